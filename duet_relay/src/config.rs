// Relay configuration.
//
// `RelayConfig` is a plain struct with defaults; the binary fills it from
// command-line flags and embedders/tests construct it directly.

use std::time::Duration;

use duet_protocol::DEFAULT_MAX_NICKNAME_LEN;

/// Tie-break used by "match me with anyone" joins.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MatchPolicy {
    /// The candidate with the lowest session ID, i.e. the nickname that was
    /// first registered.
    #[default]
    FirstRegistered,
    /// The candidate that has been available for pairing the longest.
    LongestIdle,
    /// A uniformly random candidate.
    Random,
}

/// Configuration for starting a relay server.
#[derive(Clone, Debug)]
pub struct RelayConfig {
    pub bind_addr: String,
    pub port: u16,
    /// How long a fresh connection may take to send its first frame.
    pub handshake_timeout: Duration,
    /// Upper bound on any single write to a client socket. A write that
    /// takes longer counts as a failed send.
    pub send_timeout: Duration,
    pub max_nickname_len: usize,
    pub match_policy: MatchPolicy,
    /// Whether clients may release their nickname with `Deregister`.
    pub allow_deregister: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1".into(),
            port: 8080,
            handshake_timeout: Duration::from_secs(5),
            send_timeout: Duration::from_secs(2),
            max_nickname_len: DEFAULT_MAX_NICKNAME_LEN,
            match_policy: MatchPolicy::default(),
            allow_deregister: false,
        }
    }
}
