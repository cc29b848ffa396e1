// Write half of one client's TCP transport.
//
// A `Connection` is shared: the owning relay loop writes status replies to
// it, and the partner's relay loop writes relayed messages and room
// notifications to it. Writes are serialized by a mutex so frames never
// interleave, and bounded by the socket's write timeout so a stalled client
// cannot block the thread that is writing to it.
//
// `close` shuts the socket down in both directions, which also wakes the
// owning relay loop's blocking read. It is idempotent: only the first call
// touches the socket.

use std::io::BufWriter;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use duet_protocol::ServerMessage;
use duet_protocol::framing::{MAX_MESSAGE_SIZE, write_message};

use crate::error::TransportError;

#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

struct Inner {
    writer: Mutex<BufWriter<TcpStream>>,
    // Separate handle so `close` never waits behind a stalled writer.
    control: TcpStream,
    closed: AtomicBool,
    peer_addr: Option<SocketAddr>,
}

impl Connection {
    /// Wrap `stream` (typically a `try_clone` of the socket the relay loop
    /// reads from). Every write is bounded by `send_timeout`.
    pub fn new(stream: TcpStream, send_timeout: Duration) -> std::io::Result<Self> {
        stream.set_write_timeout(Some(send_timeout))?;
        let control = stream.try_clone()?;
        let peer_addr = stream.peer_addr().ok();
        Ok(Self {
            inner: Arc::new(Inner {
                writer: Mutex::new(BufWriter::new(stream)),
                control,
                closed: AtomicBool::new(false),
                peer_addr,
            }),
        })
    }

    /// Serialize `msg` and write it as one frame. A frame over the size
    /// limit is refused before anything touches the socket.
    pub fn send(&self, msg: &ServerMessage) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let json = serde_json::to_vec(msg)?;
        if json.len() > MAX_MESSAGE_SIZE as usize {
            return Err(TransportError::Oversized(json.len()));
        }
        let mut writer = self
            .inner
            .writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        write_message(&mut *writer, &json)?;
        Ok(())
    }

    /// Shut the socket down. Returns `true` only for the call that actually
    /// closed it.
    pub fn close(&self) -> bool {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        // NotConnected just means the client got there first.
        let _ = self.inner.control.shutdown(Shutdown::Both);
        true
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.peer_addr
    }

    /// Whether two handles refer to the same underlying transport.
    pub fn same_transport(&self, other: &Connection) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer_addr", &self.inner.peer_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}
