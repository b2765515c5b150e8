//! [`Watchdog`] – drops peers that stop answering.
//!
//! Every interval the watchdog marks each open connection unconfirmed and
//! sends it a `GET_STATUS` ping.  A peer's `OK` reply clears the mark.  After
//! sleeping for the interval, every connection still marked is closed and
//! its routes purged.  This bounds the lifetime of half-open peers without
//! relying on TCP keepalive.
//!
//! Pings never wait for a connection's send lock.  A connection whose lock
//! is held by a relay (typically one stuck writing to a peer that stopped
//! reading) is not pinged that round and stays marked, so the reap phase
//! always runs.  Pings still go out one connection after another in table
//! order, and a ping that does take the lock can block for up to the socket
//! write timeout, delaying pings to the connections after it.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::connection::ConnectionTable;

/// Granularity at which the watchdog notices a stop request while asleep.
const STOP_POLL: Duration = Duration::from_millis(50);

/// Periodic liveness check over a [`ConnectionTable`].
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use std::sync::atomic::AtomicBool;
/// use std::time::Duration;
/// use mailnet_router::connection::ConnectionTable;
/// use mailnet_router::watchdog::Watchdog;
///
/// let table = Arc::new(ConnectionTable::new(8, 64));
/// let stop = Arc::new(AtomicBool::new(false));
/// let handle = Watchdog::new(Duration::from_secs(5)).spawn(table, stop)?;
/// # drop(handle);
/// # Ok::<(), std::io::Error>(())
/// ```
#[derive(Debug, Clone, Copy)]
pub struct Watchdog {
    interval: Duration,
}

impl Watchdog {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// One round: mark and ping, sleep, reap.  Returns the peers that were
    /// dropped.  Returns early with nothing reaped once `stop` is set.
    pub fn tick(&self, table: &ConnectionTable, stop: &AtomicBool) -> Vec<SocketAddr> {
        let pinged = table.snapshot();
        for conn in &pinged {
            match conn.ping() {
                Ok(true) => {}
                Ok(false) => debug!(peer = %conn.peer(), "send lock busy; ping skipped"),
                Err(e) => {
                    debug!(peer = %conn.peer(), error = %e, "ping failed");
                    table.close(conn, "ping failed");
                }
            }
        }

        if !sleep_unless_stopped(self.interval, stop) {
            return Vec::new();
        }

        let mut reaped = Vec::new();
        for conn in pinged {
            if conn.is_unconfirmed() && table.close(&conn, "watchdog timeout") {
                warn!(peer = %conn.peer(), "peer did not answer the watchdog; dropped");
                reaped.push(conn.peer());
            }
        }
        reaped
    }

    /// Run [`Watchdog::tick`] on its own thread until `stop` is set.
    pub fn spawn(self, table: Arc<ConnectionTable>, stop: Arc<AtomicBool>) -> std::io::Result<JoinHandle<()>> {
        thread::Builder::new().name("watchdog".into()).spawn(move || {
            while !stop.load(Ordering::Acquire) {
                self.tick(&table, &stop);
            }
            debug!("watchdog stopped");
        })
    }
}

/// Sleep for `total`, waking early when `stop` is set.  Returns `false` when
/// stopped.
fn sleep_unless_stopped(total: Duration, stop: &AtomicBool) -> bool {
    let deadline = Instant::now() + total;
    loop {
        if stop.load(Ordering::Acquire) {
            return false;
        }
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            return true;
        }
        thread::sleep(left.min(STOP_POLL));
    }
}
