//! [`RouteTable`] – maps mailbox addresses to whoever delivers them.
//!
//! The owner type is generic: the TCP router stores connection ids, the
//! datagram link stores peer socket addresses.  Entries are kept sorted by
//! address and every operation takes the one table lock; the table is
//! bounded and small, so binary search under a mutex is plenty.

use std::fmt::Debug;
use std::sync::{Mutex, MutexGuard};

use mailnet_types::{MailError, MailboxAddr};
use tracing::{debug, warn};

/// Address → owner map with a fixed maximum size.
///
/// # Example
///
/// ```
/// use mailnet_router::route_table::RouteTable;
/// use mailnet_types::MailboxAddr;
///
/// let table = RouteTable::new(8);
/// table.register(MailboxAddr(0x0101_0001), 3usize).unwrap();
///
/// assert_eq!(table.lookup(MailboxAddr(0x0101_0001)).unwrap(), 3);
/// assert!(table.lookup(MailboxAddr(0x0101_0002)).is_err());
/// ```
#[derive(Debug)]
pub struct RouteTable<O> {
    entries: Mutex<Vec<(MailboxAddr, O)>>,
    max_routes: usize,
}

impl<O: Copy + PartialEq + Debug> RouteTable<O> {
    pub fn new(max_routes: usize) -> Self {
        Self {
            entries: Mutex::new(Vec::with_capacity(max_routes.min(1024))),
            max_routes,
        }
    }

    /// Route `mbx` to `owner`.
    ///
    /// # Errors
    ///
    /// * [`MailError::AlreadyExists`] – `mbx` already has a route.
    /// * [`MailError::Full`] – the table holds `max_routes` entries.
    pub fn register(&self, mbx: MailboxAddr, owner: O) -> Result<(), MailError> {
        let mut entries = self.lock();
        match entries.binary_search_by_key(&mbx, |(addr, _)| *addr) {
            Ok(_) => Err(MailError::AlreadyExists(mbx)),
            Err(_) if entries.len() >= self.max_routes => Err(MailError::Full(self.max_routes)),
            Err(pos) => {
                entries.insert(pos, (mbx, owner));
                debug!(mbx = %mbx, owner = ?owner, "route registered");
                Ok(())
            }
        }
    }

    /// Remove the route for `mbx`, returning its owner.  No-op when absent.
    pub fn unregister(&self, mbx: MailboxAddr) -> Option<O> {
        let mut entries = self.lock();
        let pos = entries.binary_search_by_key(&mbx, |(addr, _)| *addr).ok()?;
        let (_, owner) = entries.remove(pos);
        debug!(mbx = %mbx, owner = ?owner, "route removed");
        Some(owner)
    }

    /// Remove every route owned by `owner` and return their addresses.
    pub fn purge_owner(&self, owner: O) -> Vec<MailboxAddr> {
        let mut entries = self.lock();
        let mut purged = Vec::new();
        entries.retain(|(addr, o)| {
            if *o == owner {
                purged.push(*addr);
                false
            } else {
                true
            }
        });
        if !purged.is_empty() {
            debug!(owner = ?owner, count = purged.len(), "routes purged");
        }
        purged
    }

    /// Owner of `mbx`.
    ///
    /// # Errors
    ///
    /// [`MailError::NotFound`] when `mbx` has no route.
    pub fn lookup(&self, mbx: MailboxAddr) -> Result<O, MailError> {
        let entries = self.lock();
        entries
            .binary_search_by_key(&mbx, |(addr, _)| *addr)
            .map(|pos| entries[pos].1)
            .map_err(|_| MailError::NotFound(mbx))
    }

    /// Addresses owned by `owner`, ascending.
    pub fn addresses_of(&self, owner: O) -> Vec<MailboxAddr> {
        self.lock()
            .iter()
            .filter(|(_, o)| *o == owner)
            .map(|(addr, _)| *addr)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<(MailboxAddr, O)>> {
        self.entries.lock().unwrap_or_else(|p| {
            warn!("route table lock poisoned; recovering");
            p.into_inner()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(n: u8) -> MailboxAddr {
        MailboxAddr::compose(1, n, 0, 0)
    }

    #[test]
    fn entries_stay_sorted() {
        let table = RouteTable::new(8);
        for n in [5, 1, 3, 2, 4] {
            table.register(addr(n), n as usize).unwrap();
        }
        let all: Vec<MailboxAddr> = (0..8usize).flat_map(|o| table.addresses_of(o)).collect();
        assert_eq!(all, vec![addr(1), addr(2), addr(3), addr(4), addr(5)]);
        assert_eq!(table.lookup(addr(3)).unwrap(), 3);
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let table = RouteTable::new(8);
        table.register(addr(1), 0usize).unwrap();
        assert!(matches!(table.register(addr(1), 1), Err(MailError::AlreadyExists(_))));
        assert_eq!(table.lookup(addr(1)).unwrap(), 0);
    }

    #[test]
    fn bound_is_enforced() {
        let table = RouteTable::new(2);
        table.register(addr(1), 0usize).unwrap();
        table.register(addr(2), 0).unwrap();
        assert!(matches!(table.register(addr(3), 0), Err(MailError::Full(2))));
        table.unregister(addr(1));
        table.register(addr(3), 0).unwrap();
    }

    #[test]
    fn unregister_is_a_noop_when_absent() {
        let table: RouteTable<usize> = RouteTable::new(2);
        assert_eq!(table.unregister(addr(9)), None);
        assert!(table.is_empty());
    }

    #[test]
    fn lookup_of_unknown_is_not_found() {
        let table: RouteTable<usize> = RouteTable::new(2);
        assert!(matches!(table.lookup(addr(1)), Err(MailError::NotFound(_))));
    }

    /// After purging one owner, its addresses are gone and everybody else's
    /// routes are untouched.
    #[test]
    fn purge_only_touches_the_owner() {
        let table = RouteTable::new(16);
        for n in 0..10u8 {
            table.register(addr(n), (n % 3) as usize).unwrap();
        }
        let purged = table.purge_owner(1);
        assert_eq!(purged, vec![addr(1), addr(4), addr(7)]);
        for n in 0..10u8 {
            let owner = (n % 3) as usize;
            match table.lookup(addr(n)) {
                Ok(o) => assert_eq!(o, owner),
                Err(MailError::NotFound(_)) => assert_eq!(owner, 1),
                Err(e) => panic!("unexpected {e}"),
            }
        }
        assert_eq!(table.len(), 7);
    }
}
