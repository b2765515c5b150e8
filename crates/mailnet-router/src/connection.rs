//! [`Connection`] – one peer socket – and the [`ConnectionTable`] that owns
//! every open connection together with the route table.
//!
//! # Lifecycle
//!
//! ```text
//! Accepted ──Login──▶ LoggedIn ──MbxInit──▶ Relaying ──error/close──▶ Closing ──▶ Closed
//! ```
//!
//! Receive on a connection is single-threaded (its relay thread owns the
//! read half).  Sends may come from any relay thread or the watchdog and are
//! serialised by a per-connection lock so frames never interleave.  The
//! router gives every socket a write timeout, so a peer that stops reading
//! holds that lock for at most one timeout before the send fails and the
//! connection is closed.

use std::fmt;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};

use mailnet_types::{Control, MailError};
use tracing::{info, warn};

use crate::frame::write_frame;
use crate::route_table::RouteTable;

/// Index of a connection in its [`ConnectionTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub usize);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ConnState {
    Accepted = 0,
    LoggedIn = 1,
    Relaying = 2,
    Closing = 3,
    Closed = 4,
}

impl ConnState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ConnState::Accepted,
            1 => ConnState::LoggedIn,
            2 => ConnState::Relaying,
            3 => ConnState::Closing,
            _ => ConnState::Closed,
        }
    }
}

pub struct Connection {
    id: ConnId,
    peer: SocketAddr,
    writer: Mutex<TcpStream>,
    /// Handle used only to shut the socket down, never locked.
    socket: TcpStream,
    state: AtomicU8,
    unconfirmed: AtomicBool,
    ping_seq: AtomicU8,
}

impl Connection {
    fn new(id: ConnId, stream: &TcpStream) -> Result<Self, MailError> {
        Ok(Self {
            id,
            peer: stream.peer_addr()?,
            writer: Mutex::new(stream.try_clone()?),
            socket: stream.try_clone()?,
            state: AtomicU8::new(ConnState::Accepted as u8),
            unconfirmed: AtomicBool::new(false),
            ping_seq: AtomicU8::new(0),
        })
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Move forward to `next`.  Never moves backwards.
    pub fn advance(&self, next: ConnState) {
        self.state.fetch_max(next as u8, Ordering::AcqRel);
    }

    /// Write one encoded frame under the send lock.
    pub fn send(&self, raw: &[u8]) -> Result<(), MailError> {
        let mut writer = self.lock_writer();
        write_frame(&mut *writer, raw)
    }

    pub fn send_control(&self, control: Control, seq_nr: u8) -> Result<(), MailError> {
        self.send(&control.to_frame(seq_nr))
    }

    /// Clear the confirmation flag and send a `GET_STATUS` ping.
    ///
    /// Never waits for the send lock: when another thread is mid-send the
    /// ping is skipped, the flag stays cleared and `Ok(false)` is returned.
    pub fn ping(&self) -> Result<bool, MailError> {
        self.unconfirmed.store(true, Ordering::Release);
        let mut writer = match self.writer.try_lock() {
            Ok(writer) => writer,
            Err(TryLockError::Poisoned(p)) => p.into_inner(),
            Err(TryLockError::WouldBlock) => return Ok(false),
        };
        let seq = self.ping_seq.fetch_add(1, Ordering::Relaxed);
        write_frame(&mut *writer, &Control::GetStatus.to_frame(seq))?;
        Ok(true)
    }

    /// The peer answered a ping.
    pub fn confirm(&self) {
        self.unconfirmed.store(false, Ordering::Release);
    }

    pub fn is_unconfirmed(&self) -> bool {
        self.unconfirmed.load(Ordering::Acquire)
    }

    /// Unblock both halves of the socket.
    fn shutdown(&self) {
        self.advance(ConnState::Closing);
        // Already-dead sockets report NotConnected here.
        let _ = self.socket.shutdown(Shutdown::Both);
    }

    pub(crate) fn lock_writer(&self) -> MutexGuard<'_, TcpStream> {
        self.writer.lock().unwrap_or_else(|p| {
            warn!(peer = %self.peer, "send lock poisoned; recovering");
            p.into_inner()
        })
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("state", &self.state())
            .finish()
    }
}

/// Fixed-size table of open connections plus the routes they own.
#[derive(Debug)]
pub struct ConnectionTable {
    slots: Mutex<Vec<Option<Arc<Connection>>>>,
    routes: RouteTable<ConnId>,
}

impl ConnectionTable {
    pub fn new(max_connections: usize, max_routes: usize) -> Self {
        Self {
            slots: Mutex::new(vec![None; max_connections]),
            routes: RouteTable::new(max_routes),
        }
    }

    /// Put a freshly accepted socket in the first free slot.
    ///
    /// # Errors
    ///
    /// [`MailError::OutOfResources`] when every slot is taken.
    pub fn open(&self, stream: &TcpStream) -> Result<Arc<Connection>, MailError> {
        let mut slots = self.lock();
        let free = slots
            .iter()
            .position(Option::is_none)
            .ok_or_else(|| MailError::OutOfResources(format!("all {} connection slots in use", slots.len())))?;
        let conn = Arc::new(Connection::new(ConnId(free), stream)?);
        slots[free] = Some(Arc::clone(&conn));
        Ok(conn)
    }

    pub fn get(&self, id: ConnId) -> Option<Arc<Connection>> {
        self.lock().get(id.0).and_then(Clone::clone)
    }

    /// Every open connection.
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.lock().iter().flatten().cloned().collect()
    }

    /// Tear `conn` down: purge its routes, clear its slot and shut the
    /// socket, all under the table lock so no route outlives its
    /// connection.  Returns `false` when it was already closed.
    pub fn close(&self, conn: &Connection, reason: &str) -> bool {
        let mut slots = self.lock();
        let Some(slot) = slots.get_mut(conn.id.0) else {
            return false;
        };
        if !slot.as_deref().is_some_and(|c| std::ptr::eq(c, conn)) {
            return false;
        }
        let purged = self.routes.purge_owner(conn.id);
        *slot = None;
        conn.shutdown();
        conn.advance(ConnState::Closed);
        info!(peer = %conn.peer, conn = %conn.id, routes = purged.len(), reason, "connection closed");
        true
    }

    /// Close every connection.
    pub fn close_all(&self, reason: &str) {
        for conn in self.snapshot() {
            self.close(&conn, reason);
        }
    }

    pub fn routes(&self) -> &RouteTable<ConnId> {
        &self.routes
    }

    pub fn len(&self) -> usize {
        self.lock().iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Option<Arc<Connection>>>> {
        self.slots.lock().unwrap_or_else(|p| {
            warn!("connection table lock poisoned; recovering");
            p.into_inner()
        })
    }
}
