//! [`RouterClient`] – connects a process's [`MailBus`] to a router.
//!
//! Once connected the client is the bus's [`Uplink`]: every local mailbox is
//! announced with `MBX_INIT`, sends to non-local addresses are written to
//! the router, and a reader thread delivers inbound frames into the bus and
//! answers the router's watchdog pings.

use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use mailnet_mailbox::{MailBus, Uplink};
use mailnet_types::{Control, Envelope, MailError, MailboxAddr, Timeout};
use tracing::{debug, info, warn};

use crate::frame::{Frame, read_frame, write_frame};

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub router: SocketAddr,
    pub max_msg_len: usize,
    pub connect_timeout: Duration,
    /// How long an inbound message may wait for space in a full mailbox.
    pub deliver_timeout: Timeout,
}

impl ClientConfig {
    pub fn new(router: SocketAddr) -> Self {
        Self {
            router,
            max_msg_len: 64 * 1024,
            connect_timeout: Duration::from_secs(5),
            deliver_timeout: Timeout::millis(100),
        }
    }
}

/// Write half of the router connection.  This is what the bus holds.
struct RouterLink {
    writer: Mutex<TcpStream>,
    router: SocketAddr,
    stop: AtomicBool,
}

impl RouterLink {
    fn send(&self, raw: &[u8]) -> Result<(), MailError> {
        let mut writer = self.writer.lock().unwrap_or_else(|p| p.into_inner());
        write_frame(&mut *writer, raw)
    }

    fn send_control(&self, control: Control) -> Result<(), MailError> {
        self.send(&control.to_frame(0))
    }
}

impl Uplink for RouterLink {
    fn forward(&self, envelope: &Envelope, payload: &[u8]) -> Result<(), MailError> {
        let frame = Frame::new(*envelope, payload)?;
        self.send(&frame.raw)
    }

    fn register(&self, mbx: MailboxAddr) -> Result<(), MailError> {
        self.send_control(Control::MbxInit { mbx, reply: false })
    }

    fn unregister(&self, mbx: MailboxAddr) {
        if let Err(e) = self.send_control(Control::MbxDelete { mbx, reply: false }) {
            debug!(mbx = %mbx, error = %e, "could not withdraw mailbox from router");
        }
    }
}

/// A live router connection.  Dropping it detaches the bus and closes the
/// socket.
pub struct RouterClient {
    link: Arc<RouterLink>,
    bus: MailBus,
    reader: Option<JoinHandle<()>>,
}

impl RouterClient {
    /// Connect, log in, announce the bus's mailboxes and start the reader.
    ///
    /// # Errors
    ///
    /// [`MailError::Io`] when the router cannot be reached.
    pub fn connect(config: ClientConfig, bus: &MailBus) -> Result<Self, MailError> {
        let stream = TcpStream::connect_timeout(&config.router, config.connect_timeout)?;
        stream.set_nodelay(true)?;
        let link = Arc::new(RouterLink {
            writer: Mutex::new(stream.try_clone()?),
            router: config.router,
            stop: AtomicBool::new(false),
        });
        link.send_control(Control::Login)?;
        bus.set_uplink(Arc::clone(&link) as Arc<dyn Uplink>);

        let reader_link = Arc::clone(&link);
        let reader_bus = bus.clone();
        let reader = thread::Builder::new()
            .name("router-client".into())
            .spawn(move || read_loop(&reader_link, &reader_bus, stream, &config))?;

        info!(router = %link.router, mailboxes = bus.len(), "connected to router");
        Ok(Self {
            link,
            bus: bus.clone(),
            reader: Some(reader),
        })
    }

    pub fn router_addr(&self) -> SocketAddr {
        self.link.router
    }

    /// `false` once the router connection has been lost.
    pub fn is_connected(&self) -> bool {
        self.reader.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Withdraw every mailbox, detach from the bus and close the socket.
    pub fn shutdown(mut self) {
        self.disconnect();
    }

    fn disconnect(&mut self) {
        let Some(reader) = self.reader.take() else {
            return;
        };
        self.link.stop.store(true, Ordering::Release);
        self.bus.clear_uplink();
        let _ = self.link.send_control(Control::MbxPurge);
        {
            let writer = self.link.writer.lock().unwrap_or_else(|p| p.into_inner());
            let _ = writer.shutdown(Shutdown::Both);
        }
        if reader.join().is_err() {
            warn!(router = %self.link.router, "router reader panicked");
        }
        info!(router = %self.link.router, "disconnected from router");
    }
}

impl Drop for RouterClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn read_loop(link: &RouterLink, bus: &MailBus, mut stream: TcpStream, config: &ClientConfig) {
    loop {
        let frame = match read_frame(&mut stream, config.max_msg_len) {
            Ok(frame) => frame,
            Err(e) => {
                if !link.stop.load(Ordering::Acquire) {
                    warn!(router = %link.router, error = %e, "router connection lost");
                    bus.clear_uplink();
                }
                return;
            }
        };
        if let Err(e) = handle_inbound(link, bus, &frame, config.deliver_timeout) {
            if e.is_fatal_to_connection() {
                warn!(router = %link.router, error = %e, "router connection lost");
                bus.clear_uplink();
                return;
            }
            debug!(error = %e, "inbound frame dropped");
        }
    }
}

fn handle_inbound(link: &RouterLink, bus: &MailBus, frame: &Frame, timeout: Timeout) -> Result<(), MailError> {
    let env = frame.envelope;
    if env.is_control() {
        return match Control::decode(&env, frame.payload())? {
            Control::GetStatus => link.send(&Control::Ok.to_frame(env.seq_nr)),
            Control::Error => {
                warn!(router = %link.router, "router rejected a control request");
                Ok(())
            }
            other => {
                debug!(?other, "control frame ignored");
                Ok(())
            }
        };
    }

    match bus.deliver(env, frame.payload(), timeout) {
        Ok(()) => Ok(()),
        Err(MailError::NotAvailable(_)) if env.bounces() => {
            debug!(src = %env.src, dest = %env.dest, "no such local mailbox; bounced");
            link.send(&Frame::new(env.not_available_reply(), &[])?.raw)
        }
        Err(e) => {
            debug!(dest = %env.dest, error = %e, "inbound message not delivered");
            Ok(())
        }
    }
}
