// TCP listener for the relay.
//
// Architecture: thread-per-connection over shared, locked state.
//
// - **Listener thread** (`TcpListener::accept()` loop): accepts connections
//   and spawns one thread per connection running `Relay::serve`.
// - **Connection threads**: each owns the read half of its socket and runs
//   the relay loop (`relay.rs`) against the shared `Registry` and
//   `PairingEngine`. Writes to any client go through that client's
//   `Connection`, which serializes frames and bounds each write.
//
// The listener is non-blocking so it can poll `keep_running` between
// accepts. Shutdown: `RelayHandle::stop` clears the flag, joins the listener,
// then closes every registered connection, which wakes each connection
// thread out of its read and lets it run its normal cleanup.

use std::io;
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::RelayConfig;
use crate::relay::Relay;

/// How long the listener sleeps when no connection is pending.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Handle returned by `start_relay` to control the running server.
pub struct RelayHandle {
    keep_running: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
    relay: Arc<Relay>,
}

impl RelayHandle {
    /// The shared relay state, for inspection.
    pub fn relay(&self) -> &Arc<Relay> {
        &self.relay
    }

    /// Signal the relay to stop and wait for the listener to shut down.
    pub fn stop(mut self) {
        self.keep_running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
        self.relay.registry().close_all();
        info!("relay stopped");
    }

    /// Block until the listener exits (in practice: until the process is
    /// killed).
    pub fn wait(mut self) {
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

/// Start the relay server on a background thread. Returns a handle for
/// stopping it and the actual bound address (useful when port 0 is used
/// to let the OS pick a free port).
///
/// Failing to bind (or a zero timeout, which sockets refuse) is the only
/// error; everything after that is handled per connection.
pub fn start_relay(config: RelayConfig) -> io::Result<(RelayHandle, SocketAddr)> {
    if config.send_timeout.is_zero() || config.handshake_timeout.is_zero() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "send and handshake timeouts must be non-zero",
        ));
    }
    let listener = TcpListener::bind((config.bind_addr.as_str(), config.port))?;
    listener.set_nonblocking(true)?;
    let addr = listener.local_addr()?;
    let keep_running = Arc::new(AtomicBool::new(true));
    let relay = Arc::new(Relay::new(config));

    let thread = {
        let keep_running = Arc::clone(&keep_running);
        let relay = Arc::clone(&relay);
        thread::Builder::new()
            .name("duet-listener".into())
            .spawn(move || accept_loop(listener, relay, keep_running))?
    };

    info!(%addr, "relay listening");
    Ok((
        RelayHandle {
            keep_running,
            thread: Some(thread),
            relay,
        },
        addr,
    ))
}

/// Accept connections until `keep_running` is cleared.
fn accept_loop(listener: TcpListener, relay: Arc<Relay>, keep_running: Arc<AtomicBool>) {
    while keep_running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, addr)) => {
                if let Err(e) = stream.set_nonblocking(false) {
                    warn!(%addr, error = %e, "dropping connection");
                    continue;
                }
                debug!(%addr, "accepted connection");
                let relay = Arc::clone(&relay);
                let spawned = thread::Builder::new()
                    .name(format!("duet-conn-{addr}"))
                    .spawn(move || relay.serve(stream));
                if let Err(e) = spawned {
                    warn!(%addr, error = %e, "could not spawn connection thread");
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
            Err(e) => {
                // Typically fd exhaustion; back off and keep serving.
                warn!(error = %e, "accept failed");
                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
        }
    }
}
