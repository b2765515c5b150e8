//! Cuts an encoded message into datagrams of bounded size.
//!
//! # Fragment layout
//!
//! | Fragment | Datagram | Header flags | Header `seq_nr` |
//! |---|---|---|---|
//! | first | the first `max_fragment` bytes of the message | `SPLIT_START` | original |
//! | middle | header copy + next `max_fragment` bytes | `SPLIT` | 1, 2, ... |
//! | last | header copy + remainder | `SPLIT_STOP` | n |
//!
//! The first fragment is the message's own header, so it still carries the
//! original `total_len`.  Continuation headers carry their own datagram
//! length in `total_len`, which keeps every datagram self-describing.
//! A message that fits in one fragment is sent unmodified.

use bytes::{BufMut, Bytes, BytesMut};
use mailnet_types::{Envelope, HEADER_LEN, MailError, flags};

/// Fragment size used when nothing else is configured; fits a 1500 byte MTU.
pub const DEFAULT_MAX_FRAGMENT: usize = 1400;

/// Split `message` (header and payload) into datagrams.
///
/// # Errors
///
/// * [`MailError::Invalid`] – `max_fragment` cannot hold a header, or the
///   message needs more continuation fragments than a `u8` can number.
/// * Header decode errors for a malformed `message`.
pub fn split(message: &[u8], max_fragment: usize) -> Result<Vec<Bytes>, MailError> {
    let envelope = Envelope::decode(message)?;
    if envelope.total_len as usize != message.len() {
        return Err(MailError::Invalid(format!(
            "header says {} bytes, message has {}",
            envelope.total_len,
            message.len()
        )));
    }
    if max_fragment < HEADER_LEN {
        return Err(MailError::Invalid(format!(
            "fragments of {max_fragment} bytes cannot hold a {HEADER_LEN} byte header"
        )));
    }
    if message.len() <= max_fragment {
        return Ok(vec![Bytes::copy_from_slice(message)]);
    }

    let continuations = (message.len() - max_fragment).div_ceil(max_fragment);
    if continuations > usize::from(u8::MAX) {
        return Err(MailError::Invalid(format!(
            "{} byte message needs {continuations} continuation fragments",
            message.len()
        )));
    }

    let mut fragments = Vec::with_capacity(continuations + 1);

    let mut head = BytesMut::from(&message[..max_fragment]);
    head[7] = (envelope.flags & !flags::SPLIT_MASK) | flags::SPLIT_START;
    fragments.push(head.freeze());

    let base_flags = envelope.flags & !flags::SPLIT_MASK;
    for (i, chunk) in message[max_fragment..].chunks(max_fragment).enumerate() {
        let seq_nr = (i + 1) as u8;
        let last = i + 1 == continuations;
        let mut header = envelope;
        header.flags = base_flags | if last { flags::SPLIT_STOP } else { flags::SPLIT };
        header.seq_nr = seq_nr;
        header.total_len = (HEADER_LEN + chunk.len()) as u32;

        let mut datagram = BytesMut::with_capacity(HEADER_LEN + chunk.len());
        header.encode(&mut datagram);
        datagram.put_slice(chunk);
        fragments.push(datagram.freeze());
    }
    Ok(fragments)
}

/// Number of message bytes a datagram contributes.
pub fn carried_len(datagram: &[u8]) -> usize {
    match datagram.get(7) {
        Some(f) if f & (flags::SPLIT | flags::SPLIT_STOP) != 0 => datagram.len().saturating_sub(HEADER_LEN),
        _ => datagram.len(),
    }
}
