// TCP client for the Duet relay.
//
// Architecture:
// - `register()` / `login()` perform TCP connect + the nickname handshake on
//   the calling thread, then spawn a background reader thread.
// - The reader thread reads framed `ServerMessage`s in a loop and pushes
//   them into an `mpsc` channel.
// - The caller holds a `BufWriter<TcpStream>` for sending.
// - `poll()` drains the inbox without blocking; `recv_timeout()` waits for
//   the next message.
//
// Used by the integration tests and by anything embedding a client; the
// relay binary itself does not need it.

use std::io::{BufReader, BufWriter};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use duet_protocol::{ClientMessage, ServerMessage, StatusCode};
use thiserror::Error;

/// How long `register`/`login` wait for the relay's answer.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("rejected ({code}): {message}")]
    Rejected { code: StatusCode, message: String },

    #[error("unexpected response: {0:?}")]
    UnexpectedResponse(ServerMessage),

    #[error("relay closed the connection")]
    Closed,
}

/// TCP client for relay communication.
pub struct NetClient {
    nickname: String,
    writer: BufWriter<TcpStream>,
    inbox: Receiver<ServerMessage>,
    _reader_thread: Option<JoinHandle<()>>,
}

impl NetClient {
    /// Connect and claim `nickname` (or reactivate it if offline).
    pub fn register<A: ToSocketAddrs>(addr: A, nickname: &str) -> Result<Self, ClientError> {
        Self::connect(
            addr,
            nickname,
            ClientMessage::Register {
                nickname: nickname.into(),
            },
        )
    }

    /// Connect and reclaim a nickname registered in an earlier connection.
    pub fn login<A: ToSocketAddrs>(addr: A, nickname: &str) -> Result<Self, ClientError> {
        Self::connect(
            addr,
            nickname,
            ClientMessage::Login {
                nickname: nickname.into(),
            },
        )
    }

    fn connect<A: ToSocketAddrs>(
        addr: A,
        nickname: &str,
        hello: ClientMessage,
    ) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr)?;
        stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT))?;
        let reader_stream = stream.try_clone()?;
        let mut writer = BufWriter::new(stream);
        duet_protocol::send(&mut writer, &hello)?;

        let mut reader = BufReader::new(reader_stream);
        match duet_protocol::recv::<_, ServerMessage>(&mut reader)? {
            Some(ServerMessage::Status {
                code: StatusCode::Registered,
                ..
            }) => {}
            Some(ServerMessage::Status { code, message, .. }) if code.is_error() => {
                return Err(ClientError::Rejected { code, message });
            }
            Some(other) => return Err(ClientError::UnexpectedResponse(other)),
            None => return Err(ClientError::Closed),
        }

        // Clear read timeout for the long-lived reader loop.
        reader.get_ref().set_read_timeout(None)?;

        let (tx, rx) = mpsc::channel();
        let reader_thread = thread::spawn(move || reader_loop(reader, tx));

        Ok(Self {
            nickname: nickname.into(),
            writer,
            inbox: rx,
            _reader_thread: Some(reader_thread),
        })
    }

    pub fn nickname(&self) -> &str {
        &self.nickname
    }

    /// Ask to be paired with `peer`, or with anyone if `None`.
    pub fn join(&mut self, peer: Option<&str>) -> Result<(), ClientError> {
        self.send_msg(&ClientMessage::Join {
            peer: peer.map(String::from),
        })
    }

    /// Send an opaque payload to the current partner.
    pub fn send(&mut self, payload: &[u8]) -> Result<(), ClientError> {
        self.send_msg(&ClientMessage::Relay {
            payload: payload.to_vec(),
        })
    }

    pub fn leave(&mut self) -> Result<(), ClientError> {
        self.send_msg(&ClientMessage::Leave)
    }

    pub fn list_online(&mut self) -> Result<(), ClientError> {
        self.send_msg(&ClientMessage::ListOnline)
    }

    pub fn logout(&mut self) -> Result<(), ClientError> {
        self.send_msg(&ClientMessage::Logout)
    }

    pub fn deregister(&mut self) -> Result<(), ClientError> {
        self.send_msg(&ClientMessage::Deregister)
    }

    /// Drain all queued server messages (non-blocking).
    pub fn poll(&self) -> Vec<ServerMessage> {
        self.inbox.try_iter().collect()
    }

    /// Wait up to `timeout` for the next server message.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<ServerMessage, ClientError> {
        self.inbox.recv_timeout(timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => {
                ClientError::Io(std::io::Error::from(std::io::ErrorKind::TimedOut))
            }
            RecvTimeoutError::Disconnected => ClientError::Closed,
        })
    }

    fn send_msg(&mut self, msg: &ClientMessage) -> Result<(), ClientError> {
        duet_protocol::send(&mut self.writer, msg)?;
        Ok(())
    }
}

// Dropping the client without `logout` looks like a crash to the relay: the
// socket goes away with no goodbye. Shutting it down also ends the reader
// thread, which holds its own handle to the socket.
impl Drop for NetClient {
    fn drop(&mut self) {
        let _ = self.writer.get_ref().shutdown(Shutdown::Both);
    }
}

/// Reader thread: read framed messages in a loop, push to channel.
fn reader_loop(mut reader: BufReader<TcpStream>, tx: mpsc::Sender<ServerMessage>) {
    while let Ok(Some(msg)) = duet_protocol::recv::<_, ServerMessage>(&mut reader) {
        if tx.send(msg).is_err() {
            break; // Client dropped the receiver
        }
    }
}
