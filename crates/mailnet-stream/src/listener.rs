//! [`ListenerRegistry`] – bounded set of continuous-data subscribers.
//!
//! Each entry names a subscriber mailbox and a reduction factor `n`: the
//! subscriber receives every sample whose counter is a multiple of `n`.
//! Rate matching rides on the producer's own loop, so there are no
//! per-subscriber timers and a publish costs O(listeners).

use mailnet_mailbox::Mailbox;
use mailnet_types::{MailError, MailboxAddr, Timeout, msg};
use tracing::{debug, warn};

/// One subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerEntry {
    pub subscriber: MailboxAddr,
    /// Deliver every `reduction`-th sample.  Always `>= 1`.
    pub reduction: u32,
    /// Remove after the first delivery.
    pub one_shot: bool,
    /// Sequence number of the subscribe request, echoed on every delivery.
    pub seq_nr: u8,
}

/// What the caller asked for and what it got.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subscription {
    pub reduction: u32,
    /// `reduction * producer period`, in milliseconds.
    pub achieved_period_ms: u32,
}

/// Listener table of one producing module.
#[derive(Debug)]
pub struct ListenerRegistry {
    entries: Vec<ListenerEntry>,
    max_listeners: usize,
    producer_period_ms: u32,
}

impl ListenerRegistry {
    pub fn new(producer_period_ms: u32, max_listeners: usize) -> Self {
        Self {
            entries: Vec::with_capacity(max_listeners),
            max_listeners,
            producer_period_ms,
        }
    }

    /// Reduction factor for a requested period.  Requests at or below the
    /// producer period (including `0`) get every sample; longer periods are
    /// rounded down to a multiple of it.
    pub fn reduction_for(&self, requested_period_ms: u32) -> u32 {
        if self.producer_period_ms == 0 || requested_period_ms <= self.producer_period_ms {
            1
        } else {
            (requested_period_ms / self.producer_period_ms).max(1)
        }
    }

    /// Add or update the entry for `subscriber`.
    ///
    /// # Errors
    ///
    /// [`MailError::Busy`] when the table is full and `subscriber` has no
    /// entry yet.  Existing subscribers are unaffected.
    pub fn subscribe(
        &mut self,
        subscriber: MailboxAddr,
        requested_period_ms: u32,
        one_shot: bool,
        seq_nr: u8,
    ) -> Result<Subscription, MailError> {
        let reduction = if one_shot { 1 } else { self.reduction_for(requested_period_ms) };
        let entry = ListenerEntry {
            subscriber,
            reduction,
            one_shot,
            seq_nr,
        };

        let table_full = self.entries.len() >= self.max_listeners;
        match self.entries.iter_mut().find(|e| e.subscriber == subscriber) {
            Some(existing) => *existing = entry,
            None if table_full => {
                warn!(
                    subscriber = %subscriber,
                    max = self.max_listeners,
                    "listener table full; subscription rejected"
                );
                return Err(MailError::Busy(format!(
                    "listener table full, cannot add {subscriber}"
                )));
            }
            None => self.entries.push(entry),
        }
        debug!(subscriber = %subscriber, reduction, one_shot, "listener added");
        Ok(Subscription {
            reduction,
            achieved_period_ms: reduction.saturating_mul(self.producer_period_ms),
        })
    }

    /// Remove `subscriber`.  Returns `false` when it was not subscribed.
    pub fn unsubscribe(&mut self, subscriber: MailboxAddr) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.subscriber != subscriber);
        before != self.entries.len()
    }

    /// Push sample number `counter` to every entry it is due for.
    ///
    /// Delivery never blocks: a subscriber whose mailbox is full misses this
    /// sample.  A subscriber whose mailbox no longer exists is removed.
    /// Returns how many subscribers were sent the sample.
    pub fn notify(&mut self, sender: &Mailbox, counter: u32, payload: &[u8]) -> usize {
        let mut delivered = 0;
        self.entries.retain(|entry| {
            if counter % entry.reduction != 0 {
                return true;
            }
            match sender.send_timeout(msg::DATA, entry.subscriber, entry.seq_nr, &[payload], Timeout::NonBlocking) {
                Ok(()) => {
                    delivered += 1;
                    !entry.one_shot
                }
                Err(MailError::NotAvailable(_)) => {
                    debug!(subscriber = %entry.subscriber, "subscriber vanished; unsubscribed");
                    false
                }
                Err(e) => {
                    debug!(subscriber = %entry.subscriber, error = %e, "sample skipped");
                    true
                }
            }
        });
        delivered
    }

    pub fn entries(&self) -> &[ListenerEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn producer_period_ms(&self) -> u32 {
        self.producer_period_ms
    }
}
