// CLI entry point for the Duet relay.
//
// Starts a standalone relay that clients connect to, pair up through, and
// exchange messages over. See `server.rs` for the networking architecture
// and `relay.rs` for the per-connection protocol.
//
// Usage:
//   duet-relay [OPTIONS]
//     --bind <ADDR>                 Listen address (default: 127.0.0.1)
//     --port <PORT>                 Listen port (default: 8080)
//     --send-timeout-ms <MS>        Per-write timeout (default: 2000)
//     --handshake-timeout-ms <MS>   First-frame timeout (default: 5000)
//     --match-policy <POLICY>       first-registered | longest-idle | random
//     --allow-deregister            Let clients release their nickname
//     --verbose                     Debug logging (RUST_LOG overrides)

use std::time::Duration;

use clap::{Parser, ValueEnum};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use duet_relay::{MatchPolicy, RelayConfig, start_relay};

#[derive(Parser, Debug)]
#[command(name = "duet-relay", about = "Pairwise nickname relay")]
struct Cli {
    /// Address to listen on.
    #[arg(long, default_value = "127.0.0.1")]
    bind: String,

    /// Port to listen on (0 lets the OS choose).
    #[arg(long, default_value_t = 8080)]
    port: u16,

    /// Upper bound on a single write to a client, in milliseconds.
    #[arg(
        long,
        default_value_t = 2000,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    send_timeout_ms: u64,

    /// How long a new connection may take to register, in milliseconds.
    #[arg(
        long,
        default_value_t = 5000,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    handshake_timeout_ms: u64,

    /// Tie-break for "match me with anyone" joins.
    #[arg(long, value_enum, default_value_t = PolicyArg::FirstRegistered)]
    match_policy: PolicyArg,

    /// Allow clients to release their nickname entirely.
    #[arg(long)]
    allow_deregister: bool,

    /// Enable debug logging.
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum PolicyArg {
    FirstRegistered,
    LongestIdle,
    Random,
}

impl From<PolicyArg> for MatchPolicy {
    fn from(arg: PolicyArg) -> Self {
        match arg {
            PolicyArg::FirstRegistered => Self::FirstRegistered,
            PolicyArg::LongestIdle => Self::LongestIdle,
            PolicyArg::Random => Self::Random,
        }
    }
}

impl Cli {
    fn into_config(self) -> RelayConfig {
        RelayConfig {
            bind_addr: self.bind,
            port: self.port,
            send_timeout: Duration::from_millis(self.send_timeout_ms),
            handshake_timeout: Duration::from_millis(self.handshake_timeout_ms),
            match_policy: self.match_policy.into(),
            allow_deregister: self.allow_deregister,
            ..RelayConfig::default()
        }
    }
}

fn main() {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let (handle, addr) = match start_relay(cli.into_config()) {
        Ok(result) => result,
        Err(e) => {
            error!("Failed to start relay: {e}");
            std::process::exit(1);
        }
    };

    info!("Relay listening on {addr}. Press Ctrl+C to stop.");
    // The listener runs until the process is killed; connection threads are
    // torn down with it.
    handle.wait();
}

/// `RUST_LOG` wins; otherwise `info`, or `debug` with `--verbose`.
fn setup_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_map_onto_config() {
        let cli = Cli::parse_from([
            "duet-relay",
            "--port",
            "0",
            "--send-timeout-ms",
            "250",
            "--match-policy",
            "longest-idle",
            "--allow-deregister",
        ]);
        let config = cli.into_config();
        assert_eq!(config.port, 0);
        assert_eq!(config.send_timeout, Duration::from_millis(250));
        assert_eq!(config.match_policy, MatchPolicy::LongestIdle);
        assert!(config.allow_deregister);
        assert_eq!(config.bind_addr, "127.0.0.1");
    }

    #[test]
    fn zero_timeouts_rejected() {
        for flag in ["--send-timeout-ms", "--handshake-timeout-ms"] {
            let err = Cli::try_parse_from(["duet-relay", flag, "0"]).unwrap_err();
            assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation, "{flag}");
            assert!(Cli::try_parse_from(["duet-relay", flag, "1"]).is_ok());
        }
    }

    #[test]
    fn defaults_match_relay_defaults() {
        let config = Cli::parse_from(["duet-relay"]).into_config();
        let defaults = RelayConfig::default();
        assert_eq!(config.port, defaults.port);
        assert_eq!(config.send_timeout, defaults.send_timeout);
        assert_eq!(config.handshake_timeout, defaults.handshake_timeout);
        assert_eq!(config.match_policy, defaults.match_policy);
        assert!(!config.allow_deregister);
    }
}
