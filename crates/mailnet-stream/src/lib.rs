//! `mailnet-stream` – publish/subscribe and point-in-time queries for
//! sampling modules.
//!
//! # Modules
//!
//! - [`buffer`] – [`DataBuffer`][buffer::DataBuffer]: ring of the most recent
//!   samples with nearest-timestamp lookup.
//! - [`listener`] – [`ListenerRegistry`][listener::ListenerRegistry]: bounded
//!   subscriber table with per-subscriber rate reduction.
//! - [`stream`] – [`DataStream`][stream::DataStream]: both of the above under
//!   one lock order, plus `GET_DATA` / `GET_CONT_DATA` / `GET_NEXT_DATA` /
//!   `STOP_CONT_DATA` handling.
//! - [`source`] – [`DataSource`][source::DataSource]: the interface a
//!   sampling driver implements.
//! - [`module`] – [`DataModule`][module::DataModule]: runs a source as a
//!   command task and a data task.

pub mod buffer;
pub mod listener;
pub mod module;
pub mod source;
pub mod stream;

pub use buffer::{DataBuffer, Sample};
pub use listener::{ListenerEntry, ListenerRegistry, Subscription};
pub use module::{DataModule, ModuleConfig};
pub use source::DataSource;
pub use stream::{DataStream, StreamConfig};
