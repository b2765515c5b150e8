//! Fixed-capacity slot queue shared between a mailbox's reader and every
//! sender that holds its address.
//!
//! Storage is allocated once: one buffer of `max_payload` bytes per slot.
//! Sending copies the payload into a free slot; the queue then orders slot
//! indices by priority (highest first) and arrival order (oldest first).
//! A peek moves a slot's buffer out of the table for the duration of the
//! borrow, so the reader sees the bytes where they were written.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use bytes::BytesMut;
use mailnet_types::{Envelope, MailError, MailboxAddr, Timeout};
use tracing::warn;

/// One queued message: which slot holds it and how to order it.
#[derive(Debug)]
pub(crate) struct Queued {
    pub envelope: Envelope,
    pub slot: usize,
    pub len: usize,
    order: u64,
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.order == other.order
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    // Max-heap: higher priority wins, then the lower arrival number.
    fn cmp(&self, other: &Self) -> Ordering {
        self.envelope
            .priority
            .cmp(&other.envelope.priority)
            .then_with(|| other.order.cmp(&self.order))
    }
}

pub(crate) struct SlotState {
    /// `None` while the buffer is lent to a peek guard.
    pub buffers: Vec<Option<BytesMut>>,
    pub free: Vec<usize>,
    pub queue: BinaryHeap<Queued>,
    pub peek_locked: bool,
    pub closed: bool,
    next_order: u64,
}

pub(crate) struct SlotQueue {
    pub addr: MailboxAddr,
    pub max_payload: usize,
    pub zero_copy: bool,
    state: Mutex<SlotState>,
    readable: Condvar,
    writable: Condvar,
}

impl SlotQueue {
    pub fn new(addr: MailboxAddr, buffers: Vec<BytesMut>, max_payload: usize, zero_copy: bool) -> Self {
        let slots = buffers.len();
        Self {
            addr,
            max_payload,
            zero_copy,
            state: Mutex::new(SlotState {
                buffers: buffers.into_iter().map(Some).collect(),
                // Reversed so slot 0 is handed out first.
                free: (0..slots).rev().collect(),
                queue: BinaryHeap::with_capacity(slots),
                peek_locked: false,
                closed: false,
                next_order: 0,
            }),
            readable: Condvar::new(),
            writable: Condvar::new(),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            warn!(mbx = %self.addr, "mailbox lock poisoned; recovering");
            poisoned.into_inner()
        })
    }

    /// Copy `parts` into a free slot and queue it, waiting for space up to
    /// `timeout`.
    pub fn enqueue(&self, envelope: Envelope, parts: &[&[u8]], timeout: Timeout) -> Result<(), MailError> {
        let len: usize = parts.iter().map(|p| p.len()).sum();
        if len > self.max_payload {
            return Err(MailError::Fault(format!(
                "{len} byte payload exceeds the {} byte slots of mailbox {}",
                self.max_payload, self.addr
            )));
        }

        let deadline = timeout.deadline();
        let mut state = self.lock();
        loop {
            if state.closed {
                return Err(MailError::NotAvailable(self.addr));
            }
            if let Some(slot) = state.free.pop() {
                let Some(buf) = state.buffers[slot].as_mut() else {
                    // A free slot is never lent out; treat it as a fault.
                    return Err(MailError::Fault(format!("slot {slot} of {} is missing", self.addr)));
                };
                let mut offset = 0;
                for part in parts {
                    buf[offset..offset + part.len()].copy_from_slice(part);
                    offset += part.len();
                }
                let order = state.next_order;
                state.next_order += 1;
                state.queue.push(Queued { envelope, slot, len, order });
                self.readable.notify_one();
                return Ok(());
            }
            state = self.wait(&self.writable, state, timeout, deadline)?;
        }
    }

    /// Block until a message is queued and return the locked state with the
    /// message still at the head of the queue.  Peeks fail fast while
    /// another peek is outstanding.
    pub fn wait_for_message<'a>(
        &'a self,
        timeout: Timeout,
        for_peek: bool,
    ) -> Result<MutexGuard<'a, SlotState>, MailError> {
        let deadline = timeout.deadline();
        let mut state = self.lock();
        loop {
            if for_peek && state.peek_locked {
                return Err(MailError::Busy(format!("mailbox {} is already peeked", self.addr)));
            }
            if !state.queue.is_empty() {
                return Ok(state);
            }
            if state.closed {
                return Err(MailError::NotAvailable(self.addr));
            }
            state = self.wait(&self.readable, state, timeout, deadline)?;
        }
    }

    /// Return `slot` to the free list and wake one blocked sender.
    pub fn release(&self, state: &mut SlotState, slot: usize) {
        state.free.push(slot);
        self.writable.notify_one();
    }

    /// Discard everything queued.  A peeked slot stays lent out.
    pub fn clean(&self) -> usize {
        let mut state = self.lock();
        let drained: Vec<usize> = state.queue.drain().map(|q| q.slot).collect();
        let n = drained.len();
        state.free.extend(drained);
        self.writable.notify_all();
        n
    }

    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        state.queue.clear();
        self.readable.notify_all();
        self.writable.notify_all();
    }

    pub fn pending(&self) -> usize {
        self.lock().queue.len()
    }

    fn wait<'a>(
        &self,
        cv: &Condvar,
        guard: MutexGuard<'a, SlotState>,
        timeout: Timeout,
        deadline: Option<Instant>,
    ) -> Result<MutexGuard<'a, SlotState>, MailError> {
        match (timeout, deadline) {
            (Timeout::Infinite, _) => Ok(cv.wait(guard).unwrap_or_else(PoisonError::into_inner)),
            (Timeout::After(_), Some(deadline)) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Err(MailError::Timeout);
                }
                let (guard, _) = cv
                    .wait_timeout(guard, remaining)
                    .unwrap_or_else(PoisonError::into_inner);
                Ok(guard)
            }
            _ => Err(timeout.expired_error()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mailnet_types::msg;

    fn queue(slots: usize) -> SlotQueue {
        let buffers = (0..slots).map(|_| BytesMut::zeroed(16)).collect();
        SlotQueue::new(MailboxAddr(1), buffers, 16, false)
    }

    fn env(priority: i8) -> Envelope {
        Envelope::new(msg::DATA, MailboxAddr(2), MailboxAddr(1), 0).with_priority(priority)
    }

    #[test]
    fn heap_orders_by_priority_then_arrival() {
        let q = queue(4);
        q.enqueue(env(1), &[b"a"], Timeout::NonBlocking).unwrap();
        q.enqueue(env(5), &[b"b"], Timeout::NonBlocking).unwrap();
        q.enqueue(env(1), &[b"c"], Timeout::NonBlocking).unwrap();

        let mut state = q.lock();
        let order: Vec<i8> = std::iter::from_fn(|| state.queue.pop())
            .map(|e| e.envelope.priority)
            .collect();
        assert_eq!(order, vec![5, 1, 1]);
    }

    #[test]
    fn full_queue_does_not_block_non_blocking_senders() {
        let q = queue(1);
        q.enqueue(env(0), &[], Timeout::NonBlocking).unwrap();
        let err = q.enqueue(env(0), &[], Timeout::NonBlocking).unwrap_err();
        assert!(matches!(err, MailError::WouldBlock));
    }

    #[test]
    fn oversize_payload_is_a_fault() {
        let q = queue(1);
        let big = [0u8; 17];
        let err = q.enqueue(env(0), &[&big], Timeout::NonBlocking).unwrap_err();
        assert!(matches!(err, MailError::Fault(_)));
    }

    #[test]
    fn clean_returns_slots_to_free_list() {
        let q = queue(2);
        q.enqueue(env(0), &[], Timeout::NonBlocking).unwrap();
        q.enqueue(env(0), &[], Timeout::NonBlocking).unwrap();
        assert_eq!(q.clean(), 2);
        assert_eq!(q.pending(), 0);
        q.enqueue(env(0), &[], Timeout::NonBlocking).unwrap();
    }

    #[test]
    fn closed_queue_rejects_senders() {
        let q = queue(1);
        q.close();
        let err = q.enqueue(env(0), &[], Timeout::Infinite).unwrap_err();
        assert!(matches!(err, MailError::NotAvailable(_)));
    }
}
