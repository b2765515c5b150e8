//! [`MailBus`] – the process-local mailbox directory.
//!
//! Every mailbox in a process lives on one bus.  Sending looks the
//! destination up here first; addresses that are not hosted locally are
//! handed to the bus's [`Uplink`] (a router connection or datagram link),
//! and if there is none the send fails with [`MailError::NotAvailable`].
//!
//! ```text
//! Mailbox::send ──▶ MailBus::route ──▶ local SlotQueue
//!                                 └──▶ Uplink::forward ──▶ remote router
//!   transport ──▶ MailBus::deliver ──▶ local SlotQueue
//! ```
//!
//! The bus is cheap to clone; all clones share the same directory.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use mailnet_types::{Envelope, MailError, MailboxAddr, Timeout};
use tracing::{debug, warn};

use crate::mailbox::{Mailbox, MailboxConfig};
use crate::slots::SlotQueue;

/// Default bound on the number of mailboxes one bus hosts.
pub const DEFAULT_MAX_MAILBOXES: usize = 256;

/// Outbound path for messages whose destination is not hosted locally.
///
/// Implemented by the TCP router client and the datagram link.  Methods are
/// called from whichever thread is sending, so implementations serialise
/// their own socket writes.
pub trait Uplink: Send + Sync {
    /// Carry one message to a remote mailbox.
    ///
    /// Return [`MailError::NotAvailable`] when the remote side has no route
    /// for `envelope.dest`.
    fn forward(&self, envelope: &Envelope, payload: &[u8]) -> Result<(), MailError>;

    /// Announce that `mbx` is now hosted by this process.
    fn register(&self, mbx: MailboxAddr) -> Result<(), MailError>;

    /// Withdraw an earlier [`Uplink::register`].  Best effort.
    fn unregister(&self, mbx: MailboxAddr);
}

struct BusInner {
    mailboxes: RwLock<HashMap<MailboxAddr, Arc<SlotQueue>>>,
    uplink: RwLock<Option<Arc<dyn Uplink>>>,
    max_mailboxes: usize,
}

/// Shared mailbox directory.  See the [module docs](self).
#[derive(Clone)]
pub struct MailBus {
    inner: Arc<BusInner>,
}

impl Default for MailBus {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MAILBOXES)
    }
}

impl fmt::Debug for MailBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MailBus")
            .field("mailboxes", &self.len())
            .field("max_mailboxes", &self.inner.max_mailboxes)
            .field("uplink", &self.read_uplink().is_some())
            .finish()
    }
}

impl MailBus {
    /// Create an empty bus that hosts at most `max_mailboxes` mailboxes.
    pub fn new(max_mailboxes: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                mailboxes: RwLock::new(HashMap::new()),
                uplink: RwLock::new(None),
                max_mailboxes,
            }),
        }
    }

    /// Create a mailbox at `addr`.
    ///
    /// # Errors
    ///
    /// * [`MailError::OutOfResources`] – `addr` is already in use or the bus
    ///   is full.
    /// * [`MailError::Invalid`] – `addr` is the reserved router address or
    ///   the config is unusable.
    pub fn create(&self, addr: MailboxAddr, config: MailboxConfig) -> Result<Mailbox, MailError> {
        if addr.is_router() {
            return Err(MailError::Invalid("address 0 is reserved for the router".into()));
        }
        let (queue, priority, send_timeout) = config.into_slots(addr)?;
        let queue = Arc::new(queue);
        {
            let mut map = self.write_mailboxes();
            if map.contains_key(&addr) {
                return Err(MailError::OutOfResources(format!("mailbox {addr} already exists")));
            }
            if map.len() >= self.inner.max_mailboxes {
                return Err(MailError::OutOfResources(format!(
                    "mailbox limit of {} reached",
                    self.inner.max_mailboxes
                )));
            }
            map.insert(addr, Arc::clone(&queue));
        }

        if let Some(uplink) = self.uplink() {
            if let Err(e) = uplink.register(addr) {
                warn!(mbx = %addr, error = %e, "uplink refused mailbox registration");
            }
        }
        debug!(mbx = %addr, slots = queue_slots(&queue), "mailbox created");
        Ok(Mailbox::new(queue, self.clone(), priority, send_timeout))
    }

    /// Send from a local mailbox: local destinations are queued directly,
    /// everything else goes to the uplink.
    pub(crate) fn route(&self, envelope: Envelope, parts: &[&[u8]], timeout: Timeout) -> Result<(), MailError> {
        if let Some(queue) = self.local(envelope.dest) {
            return queue.enqueue(envelope, parts, timeout);
        }
        match self.uplink() {
            Some(uplink) => {
                let payload = parts.concat();
                uplink.forward(&envelope, &payload)
            }
            None => Err(MailError::NotAvailable(envelope.dest)),
        }
    }

    /// Inbound path for transports: queue a message that arrived from a
    /// remote peer.  Never forwards back out.
    ///
    /// # Errors
    ///
    /// [`MailError::NotAvailable`] when `envelope.dest` is not hosted here;
    /// otherwise whatever the destination queue reports.
    pub fn deliver(&self, envelope: Envelope, payload: &[u8], timeout: Timeout) -> Result<(), MailError> {
        let queue = self
            .local(envelope.dest)
            .ok_or(MailError::NotAvailable(envelope.dest))?;
        queue.enqueue(envelope, &[payload], timeout)
    }

    /// Attach `uplink` and announce every existing mailbox to it.
    pub fn set_uplink(&self, uplink: Arc<dyn Uplink>) {
        for addr in self.local_addresses() {
            if let Err(e) = uplink.register(addr) {
                warn!(mbx = %addr, error = %e, "uplink refused mailbox registration");
            }
        }
        *self
            .inner
            .uplink
            .write()
            .unwrap_or_else(|p| p.into_inner()) = Some(uplink);
    }

    /// Detach the uplink.  Later sends to remote addresses fail with
    /// [`MailError::NotAvailable`].
    pub fn clear_uplink(&self) -> Option<Arc<dyn Uplink>> {
        self.inner
            .uplink
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .take()
    }

    pub fn contains(&self, addr: MailboxAddr) -> bool {
        self.read_mailboxes().contains_key(&addr)
    }

    /// Addresses hosted on this bus, ascending.
    pub fn local_addresses(&self) -> Vec<MailboxAddr> {
        let mut addrs: Vec<MailboxAddr> = self.read_mailboxes().keys().copied().collect();
        addrs.sort_unstable();
        addrs
    }

    pub fn len(&self) -> usize {
        self.read_mailboxes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn remove(&self, addr: MailboxAddr) {
        let removed = self.write_mailboxes().remove(&addr).is_some();
        if removed {
            if let Some(uplink) = self.uplink() {
                uplink.unregister(addr);
            }
            debug!(mbx = %addr, "mailbox deleted");
        }
    }

    fn local(&self, addr: MailboxAddr) -> Option<Arc<SlotQueue>> {
        self.read_mailboxes().get(&addr).cloned()
    }

    fn uplink(&self) -> Option<Arc<dyn Uplink>> {
        self.read_uplink().clone()
    }

    fn read_uplink(&self) -> RwLockReadGuard<'_, Option<Arc<dyn Uplink>>> {
        self.inner.uplink.read().unwrap_or_else(|p| p.into_inner())
    }

    fn read_mailboxes(&self) -> RwLockReadGuard<'_, HashMap<MailboxAddr, Arc<SlotQueue>>> {
        self.inner.mailboxes.read().unwrap_or_else(|p| {
            warn!("mailbox directory lock poisoned; recovering");
            p.into_inner()
        })
    }

    fn write_mailboxes(&self) -> RwLockWriteGuard<'_, HashMap<MailboxAddr, Arc<SlotQueue>>> {
        self.inner.mailboxes.write().unwrap_or_else(|p| {
            warn!("mailbox directory lock poisoned; recovering");
            p.into_inner()
        })
    }
}

fn queue_slots(queue: &SlotQueue) -> usize {
    queue.lock().buffers.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use mailnet_types::msg;
    use std::sync::Mutex;

    const LOCAL: MailboxAddr = MailboxAddr::compose(1, 1, 0, 1);
    const REMOTE: MailboxAddr = MailboxAddr::compose(2, 1, 0, 1);

    #[derive(Default)]
    struct RecordingUplink {
        forwarded: Mutex<Vec<(Envelope, Vec<u8>)>>,
        registered: Mutex<Vec<MailboxAddr>>,
        unregistered: Mutex<Vec<MailboxAddr>>,
    }

    impl Uplink for RecordingUplink {
        fn forward(&self, envelope: &Envelope, payload: &[u8]) -> Result<(), MailError> {
            if envelope.dest != REMOTE {
                return Err(MailError::NotAvailable(envelope.dest));
            }
            self.forwarded.lock().unwrap().push((*envelope, payload.to_vec()));
            Ok(())
        }

        fn register(&self, mbx: MailboxAddr) -> Result<(), MailError> {
            self.registered.lock().unwrap().push(mbx);
            Ok(())
        }

        fn unregister(&self, mbx: MailboxAddr) {
            self.unregistered.lock().unwrap().push(mbx);
        }
    }

    #[test]
    fn duplicate_address_is_out_of_resources() {
        let bus = MailBus::default();
        let _a = bus.create(LOCAL, MailboxConfig::new(1, 8)).unwrap();
        let err = bus.create(LOCAL, MailboxConfig::new(1, 8)).unwrap_err();
        assert!(matches!(err, MailError::OutOfResources(_)));
    }

    #[test]
    fn mailbox_limit_is_enforced() {
        let bus = MailBus::new(2);
        let _a = bus.create(MailboxAddr(1), MailboxConfig::new(1, 0)).unwrap();
        let _b = bus.create(MailboxAddr(2), MailboxConfig::new(1, 0)).unwrap();
        let err = bus.create(MailboxAddr(3), MailboxConfig::new(1, 0)).unwrap_err();
        assert!(matches!(err, MailError::OutOfResources(_)));
    }

    #[test]
    fn router_address_is_reserved() {
        let bus = MailBus::default();
        let err = bus.create(MailboxAddr::ROUTER, MailboxConfig::new(1, 0)).unwrap_err();
        assert!(matches!(err, MailError::Invalid(_)));
    }

    #[test]
    fn zero_slots_is_invalid() {
        let bus = MailBus::default();
        assert!(matches!(bus.create(LOCAL, MailboxConfig::new(0, 8)), Err(MailError::Invalid(_))));
        assert!(!bus.contains(LOCAL));
    }

    #[test]
    fn non_local_sends_go_through_the_uplink() {
        let bus = MailBus::default();
        let uplink = Arc::new(RecordingUplink::default());
        bus.set_uplink(uplink.clone());

        let a = bus.create(LOCAL, MailboxConfig::new(2, 16)).unwrap();
        a.send_with_payload(msg::GET_DATA, REMOTE, 5, &[b"ab", b"cd"]).unwrap();

        let forwarded = uplink.forwarded.lock().unwrap();
        assert_eq!(forwarded.len(), 1);
        assert_eq!(forwarded[0].0.dest, REMOTE);
        assert_eq!(forwarded[0].0.payload_len(), 4);
        assert_eq!(forwarded[0].1, b"abcd");
    }

    #[test]
    fn uplink_not_available_is_surfaced() {
        let bus = MailBus::default();
        bus.set_uplink(Arc::new(RecordingUplink::default()));
        let a = bus.create(LOCAL, MailboxConfig::new(1, 0)).unwrap();
        let err = a.send(msg::ON, MailboxAddr(0x0303_0303), 0).unwrap_err();
        assert!(matches!(err, MailError::NotAvailable(_)));
    }

    #[test]
    fn uplink_sees_mailbox_lifecycle() {
        let bus = MailBus::default();
        let early = bus.create(MailboxAddr(7), MailboxConfig::new(1, 0)).unwrap();
        let uplink = Arc::new(RecordingUplink::default());
        bus.set_uplink(uplink.clone());

        let late = bus.create(LOCAL, MailboxConfig::new(1, 0)).unwrap();
        drop(late);
        drop(early);

        assert_eq!(*uplink.registered.lock().unwrap(), vec![MailboxAddr(7), LOCAL]);
        assert_eq!(*uplink.unregistered.lock().unwrap(), vec![LOCAL, MailboxAddr(7)]);
    }

    #[test]
    fn deliver_only_reaches_local_mailboxes() {
        let bus = MailBus::default();
        bus.set_uplink(Arc::new(RecordingUplink::default()));
        let a = bus.create(LOCAL, MailboxConfig::new(1, 8)).unwrap();

        let env = Envelope::new(msg::DATA, REMOTE, LOCAL, 1).with_payload_len(3).unwrap();
        bus.deliver(env, b"xyz", Timeout::NonBlocking).unwrap();
        assert_eq!(&a.receive_if().unwrap().payload[..], b"xyz");

        let stray = Envelope::new(msg::DATA, LOCAL, REMOTE, 1);
        assert!(matches!(
            bus.deliver(stray, &[], Timeout::NonBlocking),
            Err(MailError::NotAvailable(_))
        ));
    }

    #[test]
    fn local_addresses_are_sorted() {
        let bus = MailBus::default();
        let _c = bus.create(MailboxAddr(30), MailboxConfig::new(1, 0)).unwrap();
        let _a = bus.create(MailboxAddr(10), MailboxConfig::new(1, 0)).unwrap();
        let _b = bus.create(MailboxAddr(20), MailboxConfig::new(1, 0)).unwrap();
        assert_eq!(
            bus.local_addresses(),
            vec![MailboxAddr(10), MailboxAddr(20), MailboxAddr(30)]
        );
        assert_eq!(bus.len(), 3);
    }
}
