//! [`DatagramLink`] – a best-effort UDP uplink for a [`MailBus`].
//!
//! Outbound messages are looked up in a static table of remote mailboxes,
//! split into fragments and sent as datagrams.  A receiver thread feeds every
//! datagram through a [`Reassembler`] and delivers completed messages into
//! the bus.  Lost fragments lose the message; there is no retransmission.

use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use mailnet_mailbox::{MailBus, Uplink};
use mailnet_router::{Frame, RouteTable};
use mailnet_types::{Envelope, HEADER_LEN, MailError, MailboxAddr, Timeout};
use tracing::{debug, info, warn};

use crate::reassembly::{ReassemblyConfig, Reassembler};
use crate::splitter::{DEFAULT_MAX_FRAGMENT, split};

/// Largest datagram the receiver accepts.
const RECV_BUF_LEN: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub bind: SocketAddr,
    pub max_fragment: usize,
    pub reassembly: ReassemblyConfig,
    /// Bound on the remote mailbox table.
    pub max_routes: usize,
    pub deliver_timeout: Timeout,
    /// How often the receiver checks for shutdown and stale reassemblies.
    pub poll_interval: Duration,
}

impl LinkConfig {
    pub fn new(bind: SocketAddr) -> Self {
        Self {
            bind,
            max_fragment: DEFAULT_MAX_FRAGMENT,
            reassembly: ReassemblyConfig::default(),
            max_routes: 256,
            deliver_timeout: Timeout::millis(100),
            poll_interval: Duration::from_millis(50),
        }
    }
}

struct LinkShared {
    socket: UdpSocket,
    local: SocketAddr,
    routes: RouteTable<SocketAddr>,
    max_fragment: usize,
    stop: AtomicBool,
}

impl LinkShared {
    fn send_message(&self, message: &[u8], peer: SocketAddr) -> Result<(), MailError> {
        for fragment in split(message, self.max_fragment)? {
            self.socket.send_to(&fragment, peer)?;
        }
        Ok(())
    }
}

impl Uplink for LinkShared {
    fn forward(&self, envelope: &Envelope, payload: &[u8]) -> Result<(), MailError> {
        let peer = self
            .routes
            .lookup(envelope.dest)
            .map_err(|_| MailError::NotAvailable(envelope.dest))?;
        let frame = Frame::new(*envelope, payload)?;
        self.send_message(&frame.raw, peer)
    }

    // Remote mailboxes are configured with `add_route`; nothing is announced.
    fn register(&self, _mbx: MailboxAddr) -> Result<(), MailError> {
        Ok(())
    }

    fn unregister(&self, _mbx: MailboxAddr) {}
}

/// A bound UDP link attached to a bus.  Dropping it detaches the bus and
/// stops the receiver.
pub struct DatagramLink {
    shared: Arc<LinkShared>,
    bus: MailBus,
    receiver: Option<JoinHandle<()>>,
}

impl DatagramLink {
    /// Bind the socket, become `bus`'s uplink and start receiving.
    ///
    /// # Errors
    ///
    /// * [`MailError::Invalid`] – `max_fragment` cannot hold a header.
    /// * [`MailError::Io`] – the socket could not be bound.
    pub fn bind(config: LinkConfig, bus: &MailBus) -> Result<Self, MailError> {
        if config.max_fragment < HEADER_LEN {
            return Err(MailError::Invalid(format!(
                "fragment size {} is smaller than a header",
                config.max_fragment
            )));
        }
        let socket = UdpSocket::bind(config.bind)?;
        socket.set_read_timeout(Some(config.poll_interval))?;
        let local = socket.local_addr()?;

        let shared = Arc::new(LinkShared {
            socket,
            local,
            routes: RouteTable::new(config.max_routes),
            max_fragment: config.max_fragment,
            stop: AtomicBool::new(false),
        });
        bus.set_uplink(Arc::clone(&shared) as Arc<dyn Uplink>);

        let rx_shared = Arc::clone(&shared);
        let rx_bus = bus.clone();
        let reassembler = Reassembler::new(config.reassembly);
        let deliver_timeout = config.deliver_timeout;
        let receiver = thread::Builder::new()
            .name("datagram-link".into())
            .spawn(move || receive_loop(&rx_shared, &rx_bus, reassembler, deliver_timeout))?;

        info!(local = %local, max_fragment = config.max_fragment, "datagram link bound");
        Ok(Self {
            shared,
            bus: bus.clone(),
            receiver: Some(receiver),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local
    }

    /// Route `mbx` to the link at `peer`.
    ///
    /// # Errors
    ///
    /// [`MailError::AlreadyExists`] or [`MailError::Full`] from the route table.
    pub fn add_route(&self, mbx: MailboxAddr, peer: SocketAddr) -> Result<(), MailError> {
        self.shared.routes.register(mbx, peer)
    }

    pub fn remove_route(&self, mbx: MailboxAddr) -> Option<SocketAddr> {
        self.shared.routes.unregister(mbx)
    }

    pub fn route_count(&self) -> usize {
        self.shared.routes.len()
    }

    pub fn shutdown(mut self) {
        self.close();
    }

    fn close(&mut self) {
        let Some(receiver) = self.receiver.take() else {
            return;
        };
        self.shared.stop.store(true, Ordering::Release);
        self.bus.clear_uplink();
        if receiver.join().is_err() {
            warn!(local = %self.shared.local, "datagram receiver panicked");
        }
        info!(local = %self.shared.local, "datagram link closed");
    }
}

impl Drop for DatagramLink {
    fn drop(&mut self) {
        self.close();
    }
}

fn receive_loop(shared: &LinkShared, bus: &MailBus, mut reassembler: Reassembler, timeout: Timeout) {
    let mut buf = vec![0u8; RECV_BUF_LEN];
    while !shared.stop.load(Ordering::Acquire) {
        let (len, from) = match shared.socket.recv_from(&mut buf) {
            Ok(received) => received,
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                reassembler.expire(Instant::now());
                continue;
            }
            Err(e) => {
                warn!(local = %shared.local, error = %e, "datagram receive failed");
                return;
            }
        };
        match reassembler.accept(&buf[..len]) {
            Ok(Some(message)) => {
                if let Err(e) = deliver(shared, bus, message, from, timeout) {
                    debug!(peer = %from, error = %e, "inbound message not delivered");
                }
            }
            Ok(None) => {}
            Err(e) => debug!(peer = %from, error = %e, "datagram dropped"),
        }
    }
}

fn deliver(
    shared: &LinkShared,
    bus: &MailBus,
    message: Bytes,
    from: SocketAddr,
    timeout: Timeout,
) -> Result<(), MailError> {
    let env = Envelope::decode(&message)?;
    match bus.deliver(env, &message[HEADER_LEN..], timeout) {
        Err(MailError::NotAvailable(_)) if env.bounces() => {
            let reply = Frame::new(env.not_available_reply(), &[])?;
            shared.socket.send_to(&reply.raw, from)?;
            Ok(())
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mailnet_mailbox::MailboxConfig;
    use mailnet_types::msg;

    const A: MailboxAddr = MailboxAddr::compose(1, 0, 0, 1);
    const B: MailboxAddr = MailboxAddr::compose(2, 0, 0, 1);

    fn link(bus: &MailBus) -> DatagramLink {
        DatagramLink::bind(LinkConfig::new("127.0.0.1:0".parse().unwrap()), bus).unwrap()
    }

    #[test]
    fn large_request_and_reply_cross_two_links() {
        let bus_a = MailBus::default();
        let bus_b = MailBus::default();
        let mbx_a = bus_a.create(A, MailboxConfig::new(4, 8192)).unwrap();
        let mbx_b = bus_b.create(B, MailboxConfig::new(4, 8192)).unwrap();
        let link_a = link(&bus_a);
        let link_b = link(&bus_b);
        link_a.add_route(B, link_b.local_addr()).unwrap();
        link_b.add_route(A, link_a.local_addr()).unwrap();

        let request: Vec<u8> = (0..5000).map(|i| (i % 199) as u8).collect();
        let expected = request.clone();
        let server = thread::spawn(move || {
            let got = mbx_b.receive(Timeout::millis(3000)).unwrap();
            assert_eq!(&got.payload[..], &expected[..]);
            mbx_b
                .send_reply_with_payload(msg::DATA, &got.envelope, &[b"done"])
                .unwrap();
            mbx_b
        });

        let reply = mbx_a
            .call(msg::GET_DATA, B, &[&request], Timeout::millis(3000))
            .unwrap();
        assert_eq!(&reply.payload[..], b"done");
        let _mbx_b = server.join().unwrap();
    }

    #[test]
    fn missing_remote_mailbox_answers_not_available() {
        let bus_a = MailBus::default();
        let bus_b = MailBus::default();
        let mbx_a = bus_a.create(A, MailboxConfig::new(4, 64)).unwrap();
        let link_a = link(&bus_a);
        let link_b = link(&bus_b);
        link_a.add_route(B, link_b.local_addr()).unwrap();

        let err = mbx_a.call(msg::ON, B, &[], Timeout::millis(3000)).unwrap_err();
        assert!(matches!(err, MailError::NotAvailable(addr) if addr == B));
    }

    #[test]
    fn data_for_a_missing_mailbox_bounces_to_the_sender() {
        let bus_a = MailBus::default();
        let bus_b = MailBus::default();
        let mbx_a = bus_a.create(A, MailboxConfig::new(4, 64)).unwrap();
        let link_a = link(&bus_a);
        let link_b = link(&bus_b);
        link_a.add_route(B, link_b.local_addr()).unwrap();

        mbx_a.send(msg::DATA, B, 4).unwrap();
        let bounce = mbx_a.receive(Timeout::millis(3000)).unwrap();
        assert_eq!(bounce.envelope.msg_type, msg::NOT_AVAILABLE);
        assert_eq!(bounce.envelope.src, B);
        assert_eq!(bounce.envelope.seq_nr, 4);
    }

    #[test]
    fn unrouted_destination_fails_immediately() {
        let bus = MailBus::default();
        let mbx = bus.create(A, MailboxConfig::new(1, 0)).unwrap();
        let link = link(&bus);
        assert!(matches!(mbx.send(msg::ON, B, 0), Err(MailError::NotAvailable(_))));

        let peer: SocketAddr = "127.0.0.1:9".parse().unwrap();
        link.add_route(B, peer).unwrap();
        assert!(matches!(link.add_route(B, peer), Err(MailError::AlreadyExists(_))));
        assert_eq!(link.route_count(), 1);
        assert_eq!(link.remove_route(B), Some(peer));
        assert_eq!(link.route_count(), 0);
    }

    #[test]
    fn shutdown_detaches_the_bus() {
        let bus = MailBus::default();
        let mbx = bus.create(A, MailboxConfig::new(1, 0)).unwrap();
        let link = link(&bus);
        link.add_route(B, "127.0.0.1:9".parse().unwrap()).unwrap();
        link.shutdown();
        assert!(matches!(mbx.send(msg::ON, B, 0), Err(MailError::NotAvailable(_))));
    }

    #[test]
    fn tiny_fragment_size_is_rejected() {
        let mut config = LinkConfig::new("127.0.0.1:0".parse().unwrap());
        config.max_fragment = 8;
        assert!(matches!(
            DatagramLink::bind(config, &MailBus::default()),
            Err(MailError::Invalid(_))
        ));
    }
}
