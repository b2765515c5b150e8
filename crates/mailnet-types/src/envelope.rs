//! [`Envelope`] – the fixed message header and its wire codec.
//!
//! # Wire layout
//!
//! | Offset | Size | Field |
//! |---|---|---|
//! | 0 | 4 | `total_len` (header + payload) |
//! | 4 | 1 | `msg_type` (signed) |
//! | 5 | 1 | `priority` (signed) |
//! | 6 | 1 | `seq_nr` |
//! | 7 | 1 | `flags` |
//! | 8 | 4 | `src` |
//! | 12 | 4 | `dest` |
//!
//! The multi-byte fields are written in the byte order announced by
//! [`flags::LITTLE_ENDIAN`].  Because `flags` is a single byte at a fixed
//! offset, a receiver can read it first and decode the rest of the header
//! without any prior agreement.  The same bit describes the payload's byte
//! order, so payload consumers can normalise their own fields.

use bytes::{Buf, BufMut};

use crate::address::MailboxAddr;
use crate::error::MailError;
use crate::msg;

/// Size of the encoded header in bytes.
pub const HEADER_LEN: usize = 16;

/// Bits of [`Envelope::flags`].
pub mod flags {
    /// Header integers and payload are little-endian.
    pub const LITTLE_ENDIAN: u8 = 0x01;
    /// First fragment of a split message (carries the original header).
    pub const SPLIT_START: u8 = 0x02;
    /// Continuation fragment of a split message.
    pub const SPLIT: u8 = 0x04;
    /// Last fragment of a split message.
    pub const SPLIT_STOP: u8 = 0x08;

    pub const SPLIT_MASK: u8 = SPLIT_START | SPLIT | SPLIT_STOP;
}

/// Byte order of a header and its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    Little,
    Big,
}

impl ByteOrder {
    /// Byte order of the machine this code runs on.
    pub const fn native() -> Self {
        if cfg!(target_endian = "little") {
            ByteOrder::Little
        } else {
            ByteOrder::Big
        }
    }

    const fn flag_bit(self) -> u8 {
        match self {
            ByteOrder::Little => flags::LITTLE_ENDIAN,
            ByteOrder::Big => 0,
        }
    }

    /// Read a `u32` stored in this byte order.
    pub fn read_u32(self, bytes: [u8; 4]) -> u32 {
        match self {
            ByteOrder::Little => u32::from_le_bytes(bytes),
            ByteOrder::Big => u32::from_be_bytes(bytes),
        }
    }
}

/// Routing and framing metadata that precedes every message.
///
/// An `Envelope` held in memory is always normalised: its integer fields
/// carry their real values regardless of the byte order they arrived in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Envelope {
    /// Header plus payload length in bytes.
    pub total_len: u32,
    /// `> 0` command, `< 0` reply or data.  See [`crate::msg`].
    pub msg_type: i8,
    pub priority: i8,
    pub seq_nr: u8,
    pub flags: u8,
    pub src: MailboxAddr,
    pub dest: MailboxAddr,
}

impl Envelope {
    /// A header-only message in native byte order with priority 0.
    pub fn new(msg_type: i8, src: MailboxAddr, dest: MailboxAddr, seq_nr: u8) -> Self {
        Self {
            total_len: HEADER_LEN as u32,
            msg_type,
            priority: 0,
            seq_nr,
            flags: ByteOrder::native().flag_bit(),
            src,
            dest,
        }
    }

    /// Builder-style priority override.
    pub fn with_priority(mut self, priority: i8) -> Self {
        self.priority = priority;
        self
    }

    /// Set `total_len` for a payload of `len` bytes.
    ///
    /// # Errors
    ///
    /// [`MailError::Invalid`] when header plus payload does not fit in a `u32`.
    pub fn with_payload_len(mut self, len: usize) -> Result<Self, MailError> {
        let total = len
            .checked_add(HEADER_LEN)
            .and_then(|t| u32::try_from(t).ok())
            .ok_or_else(|| MailError::Invalid(format!("payload of {len} bytes is too large")))?;
        self.total_len = total;
        Ok(self)
    }

    /// Payload length implied by `total_len`.
    pub fn payload_len(&self) -> usize {
        (self.total_len as usize).saturating_sub(HEADER_LEN)
    }

    /// Byte order of the header as sent and of the payload.
    pub fn byte_order(&self) -> ByteOrder {
        if self.flags & flags::LITTLE_ENDIAN != 0 {
            ByteOrder::Little
        } else {
            ByteOrder::Big
        }
    }

    /// Positive message types are commands that expect a reply.
    pub fn is_command(&self) -> bool {
        self.msg_type > 0
    }

    /// Frames addressed to the router carry [`Control`][crate::Control] commands.
    pub fn is_control(&self) -> bool {
        self.dest.is_router()
    }

    /// Header for a reply to this message: source and destination swapped,
    /// same sequence number and priority, no payload, native byte order.
    pub fn reply(&self, msg_type: i8) -> Envelope {
        Envelope::new(msg_type, self.dest, self.src, self.seq_nr).with_priority(self.priority)
    }

    /// `NOT_AVAILABLE` reply for an unreachable destination.
    pub fn not_available_reply(&self) -> Envelope {
        self.reply(msg::NOT_AVAILABLE)
    }

    /// Whether an undeliverable copy of this message is answered with
    /// `NOT_AVAILABLE`.  Everything is except `NOT_AVAILABLE` itself.
    pub fn bounces(&self) -> bool {
        self.msg_type != msg::NOT_AVAILABLE
    }

    /// Append the encoded header to `buf`, in the byte order given by
    /// [`Envelope::byte_order`].
    pub fn encode(&self, buf: &mut impl BufMut) {
        let little = self.byte_order() == ByteOrder::Little;
        if little {
            buf.put_u32_le(self.total_len);
        } else {
            buf.put_u32(self.total_len);
        }
        buf.put_i8(self.msg_type);
        buf.put_i8(self.priority);
        buf.put_u8(self.seq_nr);
        buf.put_u8(self.flags);
        if little {
            buf.put_u32_le(self.src.raw());
            buf.put_u32_le(self.dest.raw());
        } else {
            buf.put_u32(self.src.raw());
            buf.put_u32(self.dest.raw());
        }
    }

    /// Encoded header as a fixed array.
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        let mut cursor = &mut out[..];
        self.encode(&mut cursor);
        out
    }

    /// Decode and normalise a header from the first [`HEADER_LEN`] bytes of
    /// `buf`.
    ///
    /// # Errors
    ///
    /// [`MailError::Invalid`] when `buf` is shorter than a header or the
    /// decoded `total_len` is smaller than [`HEADER_LEN`].
    pub fn decode(buf: &[u8]) -> Result<Self, MailError> {
        if buf.len() < HEADER_LEN {
            return Err(MailError::Invalid(format!(
                "header needs {HEADER_LEN} bytes, got {}",
                buf.len()
            )));
        }
        let flag_byte = buf[7];
        let little = flag_byte & flags::LITTLE_ENDIAN != 0;
        let mut cur = &buf[..HEADER_LEN];

        let total_len = if little { cur.get_u32_le() } else { cur.get_u32() };
        let msg_type = cur.get_i8();
        let priority = cur.get_i8();
        let seq_nr = cur.get_u8();
        let flags = cur.get_u8();
        let (src, dest) = if little {
            (cur.get_u32_le(), cur.get_u32_le())
        } else {
            (cur.get_u32(), cur.get_u32())
        };

        if (total_len as usize) < HEADER_LEN {
            return Err(MailError::Invalid(format!(
                "total length {total_len} is smaller than the header"
            )));
        }

        Ok(Self {
            total_len,
            msg_type,
            priority,
            seq_nr,
            flags,
            src: MailboxAddr(src),
            dest: MailboxAddr(dest),
        })
    }
}
