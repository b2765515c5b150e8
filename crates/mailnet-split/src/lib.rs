//! `mailnet-split` – mailbox traffic over bounded-size datagrams.
//!
//! - [`splitter`] – [`split`] cuts an encoded message into fragments.
//! - [`reassembly`] – [`Reassembler`] puts them back together per sender.
//! - [`link`] – [`DatagramLink`], a UDP [`Uplink`][mailnet_mailbox::Uplink]
//!   built on the two.

pub mod link;
pub mod reassembly;
pub mod splitter;

pub use link::{DatagramLink, LinkConfig};
pub use reassembly::{Reassembler, ReassemblyConfig};
pub use splitter::{DEFAULT_MAX_FRAGMENT, carried_len, split};
