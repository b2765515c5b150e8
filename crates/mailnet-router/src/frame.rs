//! Length-delimited frame I/O over a byte stream.
//!
//! A frame is an encoded [`Envelope`] followed by `total_len - HEADER_LEN`
//! payload bytes.  Reading takes the header first, validates the length
//! against the configured maximum, then reads exactly the remainder.

use std::io::{self, Read, Write};

use bytes::{BufMut, Bytes, BytesMut};
use mailnet_types::{Envelope, HEADER_LEN, MailError};

/// One complete frame as read from or written to the wire.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Normalised header.
    pub envelope: Envelope,
    /// The raw frame, header included, in the sender's byte order.
    pub raw: Bytes,
}

impl Frame {
    /// Encode `envelope` and `payload` as a new frame in native byte order.
    ///
    /// # Errors
    ///
    /// [`MailError::Invalid`] when the payload does not fit a `u32` length.
    pub fn new(envelope: Envelope, payload: &[u8]) -> Result<Self, MailError> {
        let envelope = envelope.with_payload_len(payload.len())?;
        let mut buf = BytesMut::with_capacity(envelope.total_len as usize);
        envelope.encode(&mut buf);
        buf.put_slice(payload);
        Ok(Self {
            envelope,
            raw: buf.freeze(),
        })
    }

    pub fn payload(&self) -> &[u8] {
        &self.raw[HEADER_LEN..]
    }
}

/// Read one frame.
///
/// # Errors
///
/// All errors are fatal to the connection:
///
/// * [`MailError::Fault`] – the peer closed mid-frame or before a header.
/// * [`MailError::Protocol`] – `total_len` exceeds `max_len`.
/// * [`MailError::Invalid`] – `total_len` below the header size.
/// * [`MailError::Io`] – any other socket error.
pub fn read_frame(reader: &mut impl Read, max_len: usize) -> Result<Frame, MailError> {
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header).map_err(short_read)?;
    let envelope = Envelope::decode(&header)?;
    let total = envelope.total_len as usize;
    if total > max_len {
        return Err(MailError::Protocol(format!(
            "frame of {total} bytes exceeds the {max_len} byte limit"
        )));
    }

    let mut buf = BytesMut::zeroed(total);
    buf[..HEADER_LEN].copy_from_slice(&header);
    reader.read_exact(&mut buf[HEADER_LEN..]).map_err(short_read)?;
    Ok(Frame {
        envelope,
        raw: buf.freeze(),
    })
}

/// Write one already-encoded frame in full.
pub fn write_frame(writer: &mut impl Write, raw: &[u8]) -> Result<(), MailError> {
    writer.write_all(raw).map_err(short_write)?;
    writer.flush()?;
    Ok(())
}

fn short_read(e: io::Error) -> MailError {
    match e.kind() {
        io::ErrorKind::UnexpectedEof => MailError::Fault("peer closed the connection".into()),
        _ => MailError::Io(e),
    }
}

fn short_write(e: io::Error) -> MailError {
    match e.kind() {
        io::ErrorKind::WriteZero => MailError::Fault("short write".into()),
        _ => MailError::Io(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mailnet_types::{MailboxAddr, msg};
    use std::io::Cursor;

    fn sample() -> Frame {
        let env = Envelope::new(msg::DATA, MailboxAddr(1), MailboxAddr(2), 4);
        Frame::new(env, b"payload").unwrap()
    }

    #[test]
    fn frames_are_read_back_to_back() {
        let a = sample();
        let b = Frame::new(Envelope::new(msg::OK, MailboxAddr(2), MailboxAddr(1), 4), &[]).unwrap();
        let mut wire = Vec::new();
        write_frame(&mut wire, &a.raw).unwrap();
        write_frame(&mut wire, &b.raw).unwrap();

        let mut cursor = Cursor::new(wire);
        let first = read_frame(&mut cursor, 1024).unwrap();
        assert_eq!(first.envelope, a.envelope);
        assert_eq!(first.payload(), b"payload");
        let second = read_frame(&mut cursor, 1024).unwrap();
        assert_eq!(second.envelope.msg_type, msg::OK);
        assert!(second.payload().is_empty());
        assert!(matches!(read_frame(&mut cursor, 1024), Err(MailError::Fault(_))));
    }

    #[test]
    fn oversize_frame_is_a_protocol_error() {
        let frame = sample();
        let mut cursor = Cursor::new(frame.raw.to_vec());
        let err = read_frame(&mut cursor, HEADER_LEN + 3).unwrap_err();
        assert!(matches!(err, MailError::Protocol(_)));
    }

    #[test]
    fn truncated_payload_is_a_fault() {
        let frame = sample();
        let cut = frame.raw.len() - 2;
        let mut cursor = Cursor::new(frame.raw[..cut].to_vec());
        assert!(matches!(read_frame(&mut cursor, 1024), Err(MailError::Fault(_))));
    }

    #[test]
    fn undersized_total_len_is_rejected() {
        let mut env = Envelope::new(msg::DATA, MailboxAddr(1), MailboxAddr(2), 0);
        env.total_len = 4;
        let mut cursor = Cursor::new(env.to_bytes().to_vec());
        assert!(matches!(read_frame(&mut cursor, 1024), Err(MailError::Invalid(_))));
    }
}
