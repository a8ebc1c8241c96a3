// Length-delimited JSON frames over TCP.
//
// A frame is a 4-byte big-endian payload length followed by one JSON value.
// `encode` builds a whole frame in memory so `send` issues a single write,
// and a half-written frame never reaches the socket on an encoding failure.
// `receive` checks the prefix against `MAX_MESSAGE_SIZE` (16 MB) before it
// allocates, then decodes the payload.

use std::io::{self, Read, Write};

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

/// Largest payload either side will write or accept (16 MB).
pub const MAX_MESSAGE_SIZE: u32 = 16 * 1024 * 1024;

const PREFIX_LEN: usize = 4;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame i/o failed: {0}")]
    Io(#[from] io::Error),
    #[error("frame payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error(
        "frame payload of {len} bytes exceeds the limit of {max} bytes",
        max = MAX_MESSAGE_SIZE
    )]
    TooLarge { len: u64 },
}

impl FrameError {
    /// True if the peer closed the stream before or during a frame.
    pub fn is_eof(&self) -> bool {
        matches!(self, FrameError::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof)
    }

    /// True if a socket read or write timeout expired.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            FrameError::Io(e)
                if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
        )
    }
}

fn check_len(len: u64) -> Result<(), FrameError> {
    if len > u64::from(MAX_MESSAGE_SIZE) {
        return Err(FrameError::TooLarge { len });
    }
    Ok(())
}

/// Serialize `value` into a complete frame, prefix included.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, FrameError> {
    let mut frame = vec![0u8; PREFIX_LEN];
    serde_json::to_writer(&mut frame, value)?;
    let len = (frame.len() - PREFIX_LEN) as u64;
    check_len(len)?;
    frame[..PREFIX_LEN].copy_from_slice(&(len as u32).to_be_bytes());
    Ok(frame)
}

/// Write `value` as one frame and flush.
pub fn send<W: Write, T: Serialize>(writer: &mut W, value: &T) -> Result<(), FrameError> {
    let frame = encode(value)?;
    writer.write_all(&frame)?;
    writer.flush()?;
    Ok(())
}

/// Read one frame and decode its payload.
pub fn receive<R: Read, T: DeserializeOwned>(reader: &mut R) -> Result<T, FrameError> {
    let mut prefix = [0u8; PREFIX_LEN];
    reader.read_exact(&mut prefix)?;
    let len = u32::from_be_bytes(prefix);
    check_len(u64::from(len))?;
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload)?;
    Ok(serde_json::from_slice(&payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn raw_frame(payload: &[u8]) -> Vec<u8> {
        let mut frame = (payload.len() as u32).to_be_bytes().to_vec();
        frame.extend_from_slice(payload);
        frame
    }

    #[test]
    fn frames_follow_each_other_on_one_stream() {
        let mut wire = Vec::new();
        send(&mut wire, &"first").unwrap();
        send(&mut wire, &Vec::<u8>::new()).unwrap();
        send(&mut wire, &3.5f64).unwrap();

        let mut cursor = Cursor::new(wire);
        assert_eq!(receive::<_, String>(&mut cursor).unwrap(), "first");
        assert!(receive::<_, Vec<u8>>(&mut cursor).unwrap().is_empty());
        assert_eq!(receive::<_, f64>(&mut cursor).unwrap(), 3.5);
        assert!(receive::<_, u8>(&mut cursor).unwrap_err().is_eof());
    }

    #[test]
    fn prefix_is_big_endian_payload_length() {
        let frame = encode(&[1u8, 2, 3]).unwrap();
        assert_eq!(&frame[..4], &[0, 0, 0, 7]);
        assert_eq!(&frame[4..], b"[1,2,3]");
    }

    #[test]
    fn oversized_prefix_is_rejected_before_reading_the_payload() {
        let mut cursor = Cursor::new((MAX_MESSAGE_SIZE + 1).to_be_bytes().to_vec());
        let err = receive::<_, u8>(&mut cursor).unwrap_err();
        let limit = u64::from(MAX_MESSAGE_SIZE);
        assert!(matches!(err, FrameError::TooLarge { len } if len == limit + 1), "{err}");
    }

    #[test]
    fn oversized_value_is_never_written() {
        let big = "x".repeat(MAX_MESSAGE_SIZE as usize);
        let mut wire = Vec::new();
        let err = send(&mut wire, &big).unwrap_err();
        assert!(matches!(err, FrameError::TooLarge { .. }), "{err}");
        assert!(wire.is_empty());
    }

    #[test]
    fn truncated_frame_is_eof() {
        let mut cursor = Cursor::new(vec![0u8, 1]);
        let err = receive::<_, u32>(&mut cursor).unwrap_err();
        assert!(err.is_eof());
        assert!(!err.is_timeout());

        let mut short = raw_frame(b"[1,2,3]");
        short.truncate(6);
        let err = receive::<_, Vec<u32>>(&mut Cursor::new(short)).unwrap_err();
        assert!(err.is_eof());
    }

    #[test]
    fn garbage_payload_is_a_json_error() {
        let mut cursor = Cursor::new(raw_frame(b"{not json"));
        let err = receive::<_, Vec<u32>>(&mut cursor).unwrap_err();
        assert!(matches!(err, FrameError::Json(_)));
    }
}
