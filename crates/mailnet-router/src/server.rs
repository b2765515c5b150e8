//! [`RouterServer`] – the TCP mailbox router.
//!
//! One accept thread, one relay thread per connection, one watchdog thread.
//! A relay thread reads frames from its peer and either executes them as
//! [`Control`] commands or forwards them to the connection that registered
//! the destination mailbox.  Any I/O failure tears down that connection
//! only; the accept loop and every other connection carry on.  A peer that
//! stops reading counts as failed once a write to it exceeds
//! [`RouterConfig::send_timeout`].

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use mailnet_types::{Control, MailError, MailboxAddr, msg};
use tracing::{debug, error, info, warn};

use crate::connection::{ConnId, ConnState, Connection, ConnectionTable};
use crate::frame::{Frame, read_frame};
use crate::watchdog::Watchdog;

/// Router settings.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub bind: SocketAddr,
    /// Largest frame accepted from a peer, header included.
    pub max_msg_len: usize,
    pub max_connections: usize,
    pub max_routes: usize,
    /// `None` disables the watchdog.
    pub watchdog_interval: Option<Duration>,
    /// Longest a single frame write to a peer may block.  A peer that stops
    /// reading is closed once a write to it times out.
    pub send_timeout: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 2000)),
            max_msg_len: 64 * 1024,
            max_connections: 32,
            max_routes: 256,
            watchdog_interval: Some(Duration::from_secs(5)),
            send_timeout: Duration::from_secs(2),
        }
    }
}

struct RouterShared {
    config: RouterConfig,
    table: Arc<ConnectionTable>,
    stop: Arc<AtomicBool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl RouterShared {
    fn workers(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.workers.lock().unwrap_or_else(|p| p.into_inner())
    }
}

pub struct RouterServer;

impl RouterServer {
    /// Bind and start serving.
    ///
    /// # Errors
    ///
    /// [`MailError::Io`] when the socket cannot be bound or a thread cannot
    /// be spawned.
    pub fn start(config: RouterConfig) -> Result<RouterHandle, MailError> {
        let listener = TcpListener::bind(config.bind)?;
        let local_addr = listener.local_addr()?;
        let table = Arc::new(ConnectionTable::new(config.max_connections, config.max_routes));
        let stop = Arc::new(AtomicBool::new(false));
        let watchdog_interval = config.watchdog_interval;

        let shared = Arc::new(RouterShared {
            config,
            table: Arc::clone(&table),
            stop: Arc::clone(&stop),
            workers: Mutex::new(Vec::new()),
        });

        let accept_shared = Arc::clone(&shared);
        let accept = thread::Builder::new()
            .name("router-accept".into())
            .spawn(move || accept_loop(&accept_shared, listener))?;

        let watchdog = match watchdog_interval {
            Some(interval) => Some(Watchdog::new(interval).spawn(table, stop)?),
            None => None,
        };

        info!(addr = %local_addr, "router listening");
        Ok(RouterHandle {
            local_addr,
            shared,
            accept: Some(accept),
            watchdog,
        })
    }
}

/// A running router.  Dropping it shuts the router down.
pub struct RouterHandle {
    local_addr: SocketAddr,
    shared: Arc<RouterShared>,
    accept: Option<JoinHandle<()>>,
    watchdog: Option<JoinHandle<()>>,
}

impl RouterHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn connection_count(&self) -> usize {
        self.shared.table.len()
    }

    pub fn route_count(&self) -> usize {
        self.shared.table.routes().len()
    }

    /// Peer that registered `mbx`, if any.
    pub fn route_of(&self, mbx: MailboxAddr) -> Option<SocketAddr> {
        let id = self.shared.table.routes().lookup(mbx).ok()?;
        self.shared.table.get(id).map(|c| c.peer())
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.stop.load(Ordering::Acquire)
    }

    /// Stop accepting, close every connection and join every thread.
    pub fn shutdown(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        if self.shared.stop.swap(true, Ordering::AcqRel) {
            return;
        }
        // Wake the blocking accept with a throwaway connection.
        let _ = TcpStream::connect(wake_addr(self.local_addr));
        if let Some(handle) = self.accept.take() {
            join(handle, "accept");
        }
        self.shared.table.close_all("router shutdown");
        let workers: Vec<JoinHandle<()>> = self.shared.workers().drain(..).collect();
        for handle in workers {
            join(handle, "relay");
        }
        if let Some(handle) = self.watchdog.take() {
            join(handle, "watchdog");
        }
        info!(addr = %self.local_addr, "router stopped");
    }
}

impl Drop for RouterHandle {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

fn join(handle: JoinHandle<()>, what: &str) {
    if handle.join().is_err() {
        error!(thread = what, "router thread panicked");
    }
}

/// Loopback equivalent of a wildcard bind address.
fn wake_addr(addr: SocketAddr) -> SocketAddr {
    let mut wake = addr;
    if wake.ip().is_unspecified() {
        wake.set_ip(match addr {
            SocketAddr::V4(_) => Ipv4Addr::LOCALHOST.into(),
            SocketAddr::V6(_) => std::net::Ipv6Addr::LOCALHOST.into(),
        });
    }
    wake
}

// ────────────────────────────────────────────────────────────────────────────
// Accept loop
// ────────────────────────────────────────────────────────────────────────────

fn accept_loop(shared: &Arc<RouterShared>, listener: TcpListener) {
    for incoming in listener.incoming() {
        if shared.stop.load(Ordering::Acquire) {
            break;
        }
        match incoming {
            Ok(stream) => {
                if let Err(e) = admit(shared, stream) {
                    warn!(error = %e, "connection rejected");
                }
            }
            Err(e) => warn!(error = %e, "accept failed"),
        }
        shared.workers().retain(|h| !h.is_finished());
    }
    debug!("accept loop stopped");
}

fn admit(shared: &Arc<RouterShared>, stream: TcpStream) -> Result<(), MailError> {
    stream.set_nodelay(true)?;
    // Zero would mean "no timeout" and is rejected by the OS.
    stream.set_write_timeout(Some(shared.config.send_timeout.max(Duration::from_millis(1))))?;
    let conn = shared.table.open(&stream)?;
    info!(peer = %conn.peer(), conn = %conn.id(), "connection accepted");

    let relay_shared = Arc::clone(shared);
    let relay_conn = Arc::clone(&conn);
    let spawned = thread::Builder::new()
        .name(format!("relay-{}", conn.id().0))
        .spawn(move || relay(&relay_shared, &relay_conn, stream));
    match spawned {
        Ok(handle) => {
            shared.workers().push(handle);
            Ok(())
        }
        Err(e) => {
            shared.table.close(&conn, "relay thread failed to start");
            Err(e.into())
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Per-connection relay
// ────────────────────────────────────────────────────────────────────────────

fn relay(shared: &RouterShared, conn: &Connection, mut stream: TcpStream) {
    let reason = loop {
        if shared.stop.load(Ordering::Acquire) {
            break "router shutdown".to_string();
        }
        let frame = match read_frame(&mut stream, shared.config.max_msg_len) {
            Ok(frame) => frame,
            Err(e) => break e.to_string(),
        };
        if let Err(e) = handle_frame(shared, conn, frame) {
            if e.is_fatal_to_connection() {
                break e.to_string();
            }
            warn!(peer = %conn.peer(), error = %e, "frame dropped");
        }
    };
    shared.table.close(conn, &reason);
}

fn handle_frame(shared: &RouterShared, conn: &Connection, frame: Frame) -> Result<(), MailError> {
    let env = frame.envelope;
    if env.is_control() {
        return match Control::decode(&env, frame.payload()) {
            Ok(control) => dispatch_control(shared, conn, control, env.seq_nr),
            Err(e) => {
                warn!(peer = %conn.peer(), error = %e, "bad control frame");
                conn.send_control(Control::Error, env.seq_nr)
            }
        };
    }

    if conn.state() < ConnState::LoggedIn {
        warn!(peer = %conn.peer(), dest = %env.dest, "message before login dropped");
        return conn.send(&Frame::new(env.reply(msg::ERROR), &[])?.raw);
    }
    forward(shared, conn, &frame)
}

/// Execute one router command on behalf of `conn`.
fn dispatch_control(shared: &RouterShared, conn: &Connection, control: Control, seq_nr: u8) -> Result<(), MailError> {
    let routes = shared.table.routes();
    match control {
        Control::Login => {
            conn.advance(ConnState::LoggedIn);
            info!(peer = %conn.peer(), "peer logged in");
            Ok(())
        }
        _ if conn.state() < ConnState::LoggedIn => {
            warn!(peer = %conn.peer(), ?control, "control before login rejected");
            conn.send_control(Control::Error, seq_nr)
        }
        Control::MbxInit { mbx, reply } => {
            let result = routes.register(mbx, conn.id());
            match &result {
                Ok(()) => conn.advance(ConnState::Relaying),
                Err(e) => warn!(peer = %conn.peer(), mbx = %mbx, error = %e, "mailbox registration refused"),
            }
            acknowledge(conn, reply || result.is_err(), result.is_ok(), seq_nr)
        }
        Control::MbxDelete { mbx, reply } => {
            let owned = routes.lookup(mbx).is_ok_and(|owner| owner == conn.id());
            if owned {
                routes.unregister(mbx);
            } else {
                debug!(peer = %conn.peer(), mbx = %mbx, "delete for a mailbox this peer does not own");
            }
            acknowledge(conn, reply, owned, seq_nr)
        }
        Control::MbxPurge => {
            let purged = routes.purge_owner(conn.id());
            debug!(peer = %conn.peer(), count = purged.len(), "peer purged its mailboxes");
            Ok(())
        }
        Control::GetStatus => conn.send_control(Control::Ok, seq_nr),
        Control::Ok => {
            conn.confirm();
            Ok(())
        }
        Control::Error => {
            warn!(peer = %conn.peer(), "peer reported a control error");
            Ok(())
        }
    }
}

fn acknowledge(conn: &Connection, wanted: bool, ok: bool, seq_nr: u8) -> Result<(), MailError> {
    if !wanted {
        return Ok(());
    }
    conn.send_control(if ok { Control::Ok } else { Control::Error }, seq_nr)
}

/// Relay `frame` to the owner of its destination, or answer the sender with
/// `NOT_AVAILABLE` when it cannot be delivered.  Replies and data bounce too,
/// so a producer learns that a subscriber has gone away.
fn forward(shared: &RouterShared, origin: &Connection, frame: &Frame) -> Result<(), MailError> {
    let env = frame.envelope;
    let target = shared
        .table
        .routes()
        .lookup(env.dest)
        .ok()
        .and_then(|id: ConnId| shared.table.get(id));

    if let Some(target) = target {
        match target.send(&frame.raw) {
            Ok(()) => return Ok(()),
            Err(e) => {
                warn!(peer = %target.peer(), error = %e, "relay to peer failed");
                shared.table.close(&target, "send failed");
            }
        }
    }

    if env.bounces() {
        debug!(src = %env.src, dest = %env.dest, msg_type = msg::name(env.msg_type), "destination not available");
        origin.send(&Frame::new(env.not_available_reply(), &[])?.raw)
    } else {
        debug!(src = %env.src, dest = %env.dest, "NOT_AVAILABLE for unknown mailbox dropped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_documented_values() {
        let config = RouterConfig::default();
        assert_eq!(config.bind.port(), 2000);
        assert_eq!(config.max_msg_len, 65536);
        assert_eq!(config.watchdog_interval, Some(Duration::from_secs(5)));
        assert_eq!(config.send_timeout, Duration::from_secs(2));
    }

    #[test]
    fn wildcard_bind_wakes_on_loopback() {
        let addr: SocketAddr = "0.0.0.0:4100".parse().unwrap();
        assert_eq!(wake_addr(addr), "127.0.0.1:4100".parse::<SocketAddr>().unwrap());
        let fixed: SocketAddr = "10.0.0.2:4100".parse().unwrap();
        assert_eq!(wake_addr(fixed), fixed);
    }

    #[test]
    fn start_and_shutdown_on_ephemeral_port() {
        let handle = RouterServer::start(RouterConfig {
            bind: "127.0.0.1:0".parse().unwrap(),
            ..RouterConfig::default()
        })
        .unwrap();
        assert_ne!(handle.local_addr().port(), 0);
        assert_eq!(handle.connection_count(), 0);
        handle.shutdown();
    }

    #[test]
    fn binding_a_used_port_fails() {
        let first = RouterServer::start(RouterConfig {
            bind: "127.0.0.1:0".parse().unwrap(),
            watchdog_interval: None,
            ..RouterConfig::default()
        })
        .unwrap();
        let second = RouterServer::start(RouterConfig {
            bind: first.local_addr(),
            watchdog_interval: None,
            ..RouterConfig::default()
        });
        assert!(matches!(second, Err(MailError::Io(_))));
    }
}
