//! `mailnet-router` – carries mailbox traffic between processes over TCP.
//!
//! # Modules
//!
//! - [`route_table`] – [`RouteTable`][route_table::RouteTable]: sorted,
//!   bounded address → owner map shared by every transport.
//! - [`frame`] – length-delimited frame read/write with size validation.
//! - [`connection`] – [`Connection`][connection::Connection] and
//!   [`ConnectionTable`][connection::ConnectionTable]: per-peer socket state,
//!   send serialisation, and teardown that purges routes atomically.
//! - [`watchdog`] – [`Watchdog`][watchdog::Watchdog]: pings every peer and
//!   drops the ones that stay silent.
//! - [`server`] – [`RouterServer`][server::RouterServer]: accept loop,
//!   per-connection relay threads, control command dispatch.
//! - [`client`] – [`RouterClient`][client::RouterClient]: the
//!   [`Uplink`][mailnet_mailbox::Uplink] that attaches a local mailbox bus to
//!   a router.

pub mod client;
pub mod connection;
pub mod frame;
pub mod route_table;
pub mod server;
pub mod watchdog;

pub use client::{ClientConfig, RouterClient};
pub use connection::{ConnId, ConnState, Connection, ConnectionTable};
pub use frame::{Frame, read_frame, write_frame};
pub use route_table::RouteTable;
pub use server::{RouterConfig, RouterHandle, RouterServer};
pub use watchdog::Watchdog;
