// Length-delimited message framing over TCP.
//
// Wire format: a 4-byte big-endian length prefix followed by the payload
// (JSON-serialized `message.rs` types). The framing functions operate on raw
// bytes; callers handle JSON separately.
//
// `read_frame` is the relay's reader: it tells a clean close between frames
// (`Ok(None)`) apart from a stream that dies mid-frame (`UnexpectedEof`).
// `read_message` is the strict variant for callers that always expect
// another frame.

use std::io::{self, Read, Write};

/// Maximum allowed message size (1 MB). Relay payloads are chat-sized; this
/// bounds the allocation a hostile length prefix can trigger.
pub const MAX_MESSAGE_SIZE: u32 = 1024 * 1024;

/// Write a length-delimited message: 4-byte big-endian length, then payload.
pub fn write_message<W: Write>(writer: &mut W, msg: &[u8]) -> io::Result<()> {
    let len = msg.len();
    if len > MAX_MESSAGE_SIZE as usize {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("message too large: {len} bytes (max {MAX_MESSAGE_SIZE})"),
        ));
    }
    #[expect(clippy::cast_possible_truncation)]
    let len_bytes = (len as u32).to_be_bytes();
    writer.write_all(&len_bytes)?;
    writer.write_all(msg)?;
    writer.flush()?;
    Ok(())
}

/// Read one frame. Returns `Ok(None)` if the stream ends cleanly before the
/// first byte of the length prefix.
pub fn read_frame<R: Read>(reader: &mut R) -> io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    let mut filled = 0;
    while filled < len_buf.len() {
        match reader.read(&mut len_buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "stream closed inside a length prefix",
                ));
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_MESSAGE_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("message too large: {len} bytes (max {MAX_MESSAGE_SIZE})"),
        ));
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf)?;
    Ok(Some(buf))
}

/// Read a frame, treating a clean close as `UnexpectedEof`.
pub fn read_message<R: Read>(reader: &mut R) -> io::Result<Vec<u8>> {
    read_frame(reader)?.ok_or_else(|| {
        io::Error::new(io::ErrorKind::UnexpectedEof, "stream closed between frames")
    })
}
