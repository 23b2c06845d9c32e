// Length-delimited framing for hub connections.
//
// Each frame is a 4-byte big-endian length followed by that many bytes of
// JSON (a `ClientMessage` or `ServerMessage`). The functions here move raw
// bytes only; encoding is the caller's job.
//
// `MAX_MESSAGE_SIZE` (4 MB) bounds the allocation a malformed length prefix
// can trigger. Turn requests and deltas embed a full game-state snapshot and
// are the largest messages on the wire.

use std::io::{self, Read, Write};

/// Largest accepted frame payload.
pub const MAX_MESSAGE_SIZE: u32 = 4 * 1024 * 1024;

/// Write a length-delimited message: 4-byte big-endian length, then payload.
pub fn write_message<W: Write>(writer: &mut W, msg: &[u8]) -> io::Result<()> {
    let len = match u32::try_from(msg.len()) {
        Ok(len) if len <= MAX_MESSAGE_SIZE => len,
        _ => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "message too large: {} bytes (max {MAX_MESSAGE_SIZE})",
                    msg.len()
                ),
            ));
        }
    };
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(msg)?;
    writer.flush()?;
    Ok(())
}

/// Read a length-delimited message: 4-byte big-endian length, then payload.
///
/// Returns `UnexpectedEof` if the stream closes cleanly before or during a
/// message. Returns `InvalidData` if the length exceeds `MAX_MESSAGE_SIZE`.
pub fn read_message<R: Read>(reader: &mut R) -> io::Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_MESSAGE_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("message too large: {len} bytes (max {MAX_MESSAGE_SIZE})"),
        ));
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn frame_layout_is_length_then_payload() {
        let mut buf = Vec::new();
        write_message(&mut buf, b"hub").unwrap();
        assert_eq!(buf, vec![0, 0, 0, 3, b'h', b'u', b'b']);
    }

    #[test]
    fn roundtrip_empty_message() {
        let original = b"";
        let mut buf = Vec::new();
        write_message(&mut buf, original).unwrap();

        let mut cursor = Cursor::new(&buf);
        let recovered = read_message(&mut cursor).unwrap();
        assert_eq!(recovered, original.to_vec());
    }

    #[test]
    fn rejects_oversized_write() {
        let big = vec![0u8; MAX_MESSAGE_SIZE as usize + 1];
        let mut buf = Vec::new();
        let err = write_message(&mut buf, &big).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn rejects_oversized_read() {
        // Craft a length prefix that exceeds MAX_MESSAGE_SIZE.
        let fake_len = (MAX_MESSAGE_SIZE + 1).to_be_bytes();
        let mut cursor = Cursor::new(fake_len.to_vec());
        let err = read_message(&mut cursor).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn truncated_prefix_is_eof() {
        let mut cursor = Cursor::new(vec![0u8, 1]);
        let err = read_message(&mut cursor).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn truncated_payload_is_eof() {
        let mut cursor = Cursor::new(vec![0u8, 0, 0, 10, b'x']);
        let err = read_message(&mut cursor).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn frames_preserve_order() {
        let messages: Vec<&[u8]> = vec![b"join", b"action", b"ack"];
        let mut buf = Vec::new();
        for msg in &messages {
            write_message(&mut buf, msg).unwrap();
        }

        let mut cursor = Cursor::new(&buf);
        for expected in &messages {
            let recovered = read_message(&mut cursor).unwrap();
            assert_eq!(recovered, *expected);
        }
    }
}
