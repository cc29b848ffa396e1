// duet_protocol — wire protocol for the Duet pairwise relay.
//
// Message types, framing and encode/decode helpers shared by the relay
// (`duet_relay`) and its clients.
//
// Module overview:
// - `types.rs`:    `StatusCode` and nickname validation.
// - `message.rs`:  `ClientMessage` / `ServerMessage` enums and `PeerInfo`.
// - `framing.rs`:  Length-delimited framing over any `Read`/`Write` stream:
//                  4-byte big-endian length prefix, then JSON payload.
//
// JSON keeps the protocol debuggable with a hex dump; relay payloads are
// opaque byte arrays and are never inspected by the server.

pub mod framing;
pub mod message;
pub mod types;

use std::io::{self, Read, Write};

use serde::Serialize;
use serde::de::DeserializeOwned;

pub use framing::{MAX_MESSAGE_SIZE, read_frame, read_message, write_message};
pub use message::{ClientMessage, PeerInfo, ServerMessage};
pub use types::{DEFAULT_MAX_NICKNAME_LEN, NicknameProblem, StatusCode, validate_nickname};

/// Serialize `msg` to JSON and write it as one frame.
pub fn send<W: Write, T: Serialize>(writer: &mut W, msg: &T) -> io::Result<()> {
    let json = serde_json::to_vec(msg).map_err(io::Error::other)?;
    write_message(writer, &json)
}

/// Read one frame and deserialize it. `Ok(None)` on a clean close.
///
/// A frame that is not valid JSON for `T` comes back as `InvalidData`.
pub fn recv<R: Read, T: DeserializeOwned>(reader: &mut R) -> io::Result<Option<T>> {
    match read_frame(reader)? {
        Some(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e)),
        None => Ok(None),
    }
}
