//! `mailnet-types` – shared vocabulary of the mailnet message layer.
//!
//! Every other crate in the workspace speaks in terms of the types defined
//! here:
//!
//! - [`address`] – [`MailboxAddr`][address::MailboxAddr], the globally unique
//!   32-bit mailbox address (system / class / instance / local id).
//! - [`envelope`] – [`Envelope`][envelope::Envelope], the fixed 16-byte
//!   header that precedes every message on every transport, plus its codec.
//! - [`msg`] – well-known message type numbers (commands are positive,
//!   replies and data are negative).
//! - [`control`] – [`Control`][control::Control], router-level commands
//!   decoded once at the transport boundary.
//! - [`error`] – [`MailError`][error::MailError], the failure taxonomy shared
//!   by mailboxes, routers, and transports.

pub mod address;
pub mod control;
pub mod envelope;
pub mod error;
pub mod msg;

use std::time::{Duration, Instant};

pub use address::MailboxAddr;
pub use control::Control;
pub use envelope::{ByteOrder, Envelope, HEADER_LEN, flags};
pub use error::MailError;

/// How long a blocking operation may wait.
///
/// Every suspending call in the workspace (mailbox receive, peek, send
/// backpressure) takes one of these instead of a bare number so that the
/// "poll" and "wait forever" cases are spelled out at the call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Timeout {
    /// Return immediately with [`MailError::WouldBlock`] when nothing is ready.
    NonBlocking,
    /// Wait until the operation can complete.
    #[default]
    Infinite,
    /// Wait at most the given duration, then fail with [`MailError::Timeout`].
    After(Duration),
}

impl Timeout {
    /// Shorthand for `Timeout::After(Duration::from_millis(ms))`.
    pub fn millis(ms: u64) -> Self {
        Timeout::After(Duration::from_millis(ms))
    }

    /// Absolute deadline for a wait starting now, `None` for the sentinels.
    pub fn deadline(&self) -> Option<Instant> {
        match self {
            Timeout::After(d) => Some(Instant::now() + *d),
            Timeout::NonBlocking | Timeout::Infinite => None,
        }
    }

    /// The error a caller gets when this timeout expires without success.
    pub fn expired_error(&self) -> MailError {
        match self {
            Timeout::NonBlocking => MailError::WouldBlock,
            Timeout::Infinite | Timeout::After(_) => MailError::Timeout,
        }
    }
}

impl From<Duration> for Timeout {
    fn from(d: Duration) -> Self {
        if d.is_zero() {
            Timeout::NonBlocking
        } else {
            Timeout::After(d)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_duration_is_non_blocking() {
        assert_eq!(Timeout::from(Duration::ZERO), Timeout::NonBlocking);
        assert_eq!(Timeout::from(Duration::from_millis(5)), Timeout::millis(5));
    }

    #[test]
    fn expired_error_distinguishes_poll_from_wait() {
        assert!(matches!(Timeout::NonBlocking.expired_error(), MailError::WouldBlock));
        assert!(matches!(Timeout::millis(1).expired_error(), MailError::Timeout));
    }

    #[test]
    fn only_timed_waits_have_a_deadline() {
        assert!(Timeout::Infinite.deadline().is_none());
        assert!(Timeout::NonBlocking.deadline().is_none());
        assert!(Timeout::millis(10).deadline().is_some());
    }
}
