//! [`MailError`] – failure taxonomy for the whole message layer.
//!
//! Low-level I/O errors are translated into one of these variants at the
//! mailbox / connection boundary so that callers only ever match on this
//! enum.  Nothing in the workspace panics across that boundary.

use thiserror::Error;

use crate::address::MailboxAddr;
use crate::msg;

#[derive(Error, Debug)]
pub enum MailError {
    /// Destination mailbox is unknown locally and to every uplink.
    #[error("mailbox {0} is not available")]
    NotAvailable(MailboxAddr),

    /// Nothing happened before a caller-supplied deadline.
    #[error("operation timed out")]
    Timeout,

    /// A non-blocking operation found nothing to do.
    #[error("operation would block")]
    WouldBlock,

    /// Short read or write on the underlying transport, or a payload that
    /// does not fit the receiving buffer.
    #[error("transport fault: {0}")]
    Fault(String),

    /// A fixed-size table (mailboxes, slots, reassemblies) is exhausted or
    /// the requested address is already taken.
    #[error("out of resources: {0}")]
    OutOfResources(String),

    /// A bounded resource is held by someone else (peek lock, listener table).
    #[error("busy: {0}")]
    Busy(String),

    #[error("invalid: {0}")]
    Invalid(String),

    #[error("mailbox {0} is already registered")]
    AlreadyExists(MailboxAddr),

    #[error("table full ({0} entries)")]
    Full(usize),

    #[error("mailbox {0} not found")]
    NotFound(MailboxAddr),

    /// The peer answered, and the answer was an error reply.
    #[error("request rejected by {src} with {}", type_name(.msg_type))]
    Rejected { src: MailboxAddr, msg_type: i8 },

    /// Malformed control message, sequence gap, unexpected frame.
    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn type_name(msg_type: &i8) -> &'static str {
    msg::name(*msg_type)
}

impl MailError {
    /// Reply message type that reports this error back to a remote sender.
    pub fn reply_type(&self) -> i8 {
        match self {
            MailError::NotAvailable(_) | MailError::NotFound(_) => msg::NOT_AVAILABLE,
            MailError::Timeout | MailError::WouldBlock => msg::TIMEOUT,
            _ => msg::ERROR,
        }
    }

    /// `true` for failures that mean the peer socket is unusable.
    pub fn is_fatal_to_connection(&self) -> bool {
        matches!(self, MailError::Io(_) | MailError::Fault(_))
    }
}
