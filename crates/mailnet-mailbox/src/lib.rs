//! `mailnet-mailbox` – addressable message queues for inter-task and
//! inter-process communication.
//!
//! # Modules
//!
//! - [`bus`] – [`MailBus`], the process-local directory of mailboxes, and the
//!   [`Uplink`] trait through which non-local sends leave the process.
//! - [`mailbox`] – [`Mailbox`], a bounded priority queue of message slots with
//!   blocking, timed, non-blocking and zero-copy receive.
//!
//! ```no_run
//! use mailnet_mailbox::{MailBus, MailboxConfig};
//! use mailnet_types::{MailboxAddr, Timeout, msg};
//!
//! let bus = MailBus::default();
//! let server = bus.create(MailboxAddr::compose(1, 2, 0, 0), MailboxConfig::new(8, 256))?;
//! let client = bus.create(MailboxAddr::compose(1, 9, 0, 0), MailboxConfig::new(8, 256))?;
//!
//! client.send(msg::GET_STATUS, server.addr(), 1)?;
//! let request = server.receive(Timeout::millis(100))?;
//! server.send_reply(msg::OK, &request.envelope)?;
//! # Ok::<(), mailnet_types::MailError>(())
//! ```

pub mod bus;
pub mod mailbox;
mod slots;

pub use bus::{DEFAULT_MAX_MAILBOXES, MailBus, Uplink};
pub use mailbox::{Mailbox, MailboxConfig, Message, PeekGuard, Placement, u32_payload};
