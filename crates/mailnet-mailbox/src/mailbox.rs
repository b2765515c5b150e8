//! [`Mailbox`] – an addressable, bounded message endpoint.
//!
//! A mailbox is owned by exactly one reader.  Any holder of the same
//! [`MailBus`] can send to it by address; senders never see the `Mailbox`
//! value itself.
//!
//! # Receive disciplines
//!
//! | Call | Behaviour |
//! |---|---|
//! | [`Mailbox::receive`] | wait up to a [`Timeout`], copy the payload out |
//! | [`Mailbox::receive_if`] | poll, [`MailError::WouldBlock`] when empty |
//! | [`Mailbox::receive_blocking`] | wait forever |
//! | [`Mailbox::receive_into`] | copy into a caller buffer |
//! | [`Mailbox::peek`] | borrow the payload in place, release on drop |
//!
//! Messages leave the queue highest priority first; equal priorities leave
//! in the order they were sent.

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use mailnet_types::{Envelope, MailError, MailboxAddr, Timeout, msg};
use tracing::debug;

use crate::bus::MailBus;
use crate::slots::SlotQueue;

// ────────────────────────────────────────────────────────────────────────────
// Configuration
// ────────────────────────────────────────────────────────────────────────────

/// Where a mailbox's slot storage lives.
pub enum Placement {
    /// Slots are allocated by the mailbox.  Receivers always get a copy.
    Separate,
    /// Slots are carved out of a caller-provided arena that stays with the
    /// reader.  Enables zero-copy [`Mailbox::peek`].  The arena must hold at
    /// least `slots * max_payload` bytes.
    CoLocated(BytesMut),
}

impl fmt::Debug for Placement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Placement::Separate => write!(f, "Separate"),
            Placement::CoLocated(arena) => write!(f, "CoLocated({} bytes)", arena.len()),
        }
    }
}

/// Parameters for [`MailBus::create`].
#[derive(Debug)]
pub struct MailboxConfig {
    /// Number of messages that can be queued at once.
    pub slots: usize,
    /// Largest payload one slot can hold.
    pub max_payload: usize,
    pub placement: Placement,
    /// Priority stamped on every message this mailbox sends.
    pub priority: i8,
    /// How long a send waits when the destination is full.
    pub send_timeout: Timeout,
}

impl MailboxConfig {
    pub fn new(slots: usize, max_payload: usize) -> Self {
        Self {
            slots,
            max_payload,
            placement: Placement::Separate,
            priority: 0,
            send_timeout: Timeout::Infinite,
        }
    }

    pub fn with_placement(mut self, placement: Placement) -> Self {
        self.placement = placement;
        self
    }

    pub fn with_priority(mut self, priority: i8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_send_timeout(mut self, timeout: Timeout) -> Self {
        self.send_timeout = timeout;
        self
    }

    /// Allocate or carve the per-slot buffers.
    pub(crate) fn into_slots(self, addr: MailboxAddr) -> Result<(SlotQueue, i8, Timeout), MailError> {
        if self.slots == 0 {
            return Err(MailError::Invalid(format!("mailbox {addr} needs at least one slot")));
        }
        let (buffers, zero_copy) = match self.placement {
            Placement::Separate => {
                let buffers = (0..self.slots).map(|_| BytesMut::zeroed(self.max_payload)).collect();
                (buffers, false)
            }
            Placement::CoLocated(mut arena) => {
                let needed = self.slots * self.max_payload;
                if arena.len() < needed {
                    return Err(MailError::Invalid(format!(
                        "arena of {} bytes is too small for {} slots of {} bytes",
                        arena.len(),
                        self.slots,
                        self.max_payload
                    )));
                }
                let buffers = (0..self.slots).map(|_| arena.split_to(self.max_payload)).collect();
                (buffers, true)
            }
        };
        Ok((
            SlotQueue::new(addr, buffers, self.max_payload, zero_copy),
            self.priority,
            self.send_timeout,
        ))
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Message
// ────────────────────────────────────────────────────────────────────────────

/// A received message with its payload copied out of the mailbox.
#[derive(Debug, Clone)]
pub struct Message {
    pub envelope: Envelope,
    pub payload: Bytes,
}

impl Message {
    /// Read the `index`-th `u32` of the payload in the sender's byte order.
    pub fn payload_u32(&self, index: usize) -> Option<u32> {
        payload_u32(&self.envelope, &self.payload, index)
    }
}

pub(crate) fn payload_u32(envelope: &Envelope, payload: &[u8], index: usize) -> Option<u32> {
    let start = index.checked_mul(4)?;
    let bytes: [u8; 4] = payload.get(start..start + 4)?.try_into().ok()?;
    Some(envelope.byte_order().read_u32(bytes))
}

/// Encode `values` as a payload in native byte order.
pub fn u32_payload(values: &[u32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_ne_bytes()).collect()
}

// ────────────────────────────────────────────────────────────────────────────
// Mailbox
// ────────────────────────────────────────────────────────────────────────────

/// Reader side of a mailbox.  Created with [`MailBus::create`]; dropping it
/// removes the address from the bus and wakes every blocked sender with
/// [`MailError::NotAvailable`].
pub struct Mailbox {
    pub(crate) queue: Arc<SlotQueue>,
    pub(crate) bus: MailBus,
    priority: i8,
    send_timeout: Timeout,
    next_seq: AtomicU8,
}

impl Mailbox {
    pub(crate) fn new(queue: Arc<SlotQueue>, bus: MailBus, priority: i8, send_timeout: Timeout) -> Self {
        Self {
            queue,
            bus,
            priority,
            send_timeout,
            next_seq: AtomicU8::new(1),
        }
    }

    pub fn addr(&self) -> MailboxAddr {
        self.queue.addr
    }

    pub fn max_payload(&self) -> usize {
        self.queue.max_payload
    }

    /// `true` when [`Mailbox::peek`] is available.
    pub fn zero_copy(&self) -> bool {
        self.queue.zero_copy
    }

    /// Number of queued messages.
    pub fn pending(&self) -> usize {
        self.queue.pending()
    }

    pub fn bus(&self) -> &MailBus {
        &self.bus
    }

    // ── Sending ──────────────────────────────────────────────────────────

    /// Send a header-only message.
    pub fn send(&self, msg_type: i8, dest: MailboxAddr, seq_nr: u8) -> Result<(), MailError> {
        self.send_with_payload(msg_type, dest, seq_nr, &[])
    }

    /// Send a message whose payload is the concatenation of `parts`.
    ///
    /// # Errors
    ///
    /// * [`MailError::NotAvailable`] – no mailbox with address `dest`.
    /// * [`MailError::Timeout`] / [`MailError::WouldBlock`] – `dest` stayed
    ///   full past this mailbox's send timeout.
    /// * [`MailError::Fault`] – payload larger than the destination's slots.
    pub fn send_with_payload(
        &self,
        msg_type: i8,
        dest: MailboxAddr,
        seq_nr: u8,
        parts: &[&[u8]],
    ) -> Result<(), MailError> {
        self.send_timeout(msg_type, dest, seq_nr, parts, self.send_timeout)
    }

    /// Like [`Mailbox::send_with_payload`] with an explicit backpressure
    /// deadline.
    pub fn send_timeout(
        &self,
        msg_type: i8,
        dest: MailboxAddr,
        seq_nr: u8,
        parts: &[&[u8]],
        timeout: Timeout,
    ) -> Result<(), MailError> {
        let len = parts.iter().map(|p| p.len()).sum();
        let envelope = Envelope::new(msg_type, self.addr(), dest, seq_nr)
            .with_priority(self.priority)
            .with_payload_len(len)?;
        self.bus.route(envelope, parts, timeout)
    }

    /// Reply to `original`, reusing its sequence number and priority.
    pub fn send_reply(&self, msg_type: i8, original: &Envelope) -> Result<(), MailError> {
        self.send_reply_with_payload(msg_type, original, &[])
    }

    pub fn send_reply_with_payload(
        &self,
        msg_type: i8,
        original: &Envelope,
        parts: &[&[u8]],
    ) -> Result<(), MailError> {
        let len = parts.iter().map(|p| p.len()).sum();
        let envelope = Envelope::new(msg_type, self.addr(), original.src, original.seq_nr)
            .with_priority(original.priority)
            .with_payload_len(len)?;
        self.bus.route(envelope, parts, self.send_timeout)
    }

    // ── Receiving ────────────────────────────────────────────────────────

    /// Dequeue the oldest highest-priority message, waiting up to `timeout`.
    pub fn receive(&self, timeout: Timeout) -> Result<Message, MailError> {
        let mut state = self.queue.wait_for_message(timeout, false)?;
        let Some(head) = state.queue.pop() else {
            return Err(timeout.expired_error());
        };
        let payload = match state.buffers[head.slot].as_ref() {
            Some(buf) => Bytes::copy_from_slice(&buf[..head.len]),
            None => Bytes::new(),
        };
        self.queue.release(&mut state, head.slot);
        Ok(Message {
            envelope: head.envelope,
            payload,
        })
    }

    /// Non-blocking receive.
    pub fn receive_if(&self) -> Result<Message, MailError> {
        self.receive(Timeout::NonBlocking)
    }

    pub fn receive_blocking(&self) -> Result<Message, MailError> {
        self.receive(Timeout::Infinite)
    }

    /// Dequeue into `buf`, returning the envelope.  The message stays queued
    /// when `buf` is too small.
    pub fn receive_into(&self, buf: &mut [u8], timeout: Timeout) -> Result<Envelope, MailError> {
        let mut state = self.queue.wait_for_message(timeout, false)?;
        let Some(len) = state.queue.peek().map(|head| head.len) else {
            return Err(timeout.expired_error());
        };
        if len > buf.len() {
            return Err(MailError::Fault(format!(
                "{len} byte message does not fit a {} byte buffer",
                buf.len()
            )));
        }
        let Some(head) = state.queue.pop() else {
            return Err(timeout.expired_error());
        };
        if let Some(slot) = state.buffers[head.slot].as_ref() {
            buf[..len].copy_from_slice(&slot[..len]);
        }
        self.queue.release(&mut state, head.slot);
        Ok(head.envelope)
    }

    /// Borrow the next message in place.
    ///
    /// The slot stays reserved until the returned guard is dropped (or passed
    /// to [`Mailbox::peek_end`]).  Only one peek may be outstanding per
    /// mailbox.
    ///
    /// # Errors
    ///
    /// * [`MailError::Invalid`] – the mailbox was not created
    ///   [`Placement::CoLocated`].
    /// * [`MailError::Busy`] – another peek is still outstanding.
    pub fn peek(&self, timeout: Timeout) -> Result<PeekGuard<'_>, MailError> {
        if !self.queue.zero_copy {
            return Err(MailError::Invalid(format!(
                "mailbox {} has separate storage; use receive",
                self.addr()
            )));
        }
        let mut state = self.queue.wait_for_message(timeout, true)?;
        let Some(head) = state.queue.pop() else {
            return Err(timeout.expired_error());
        };
        let Some(buf) = state.buffers[head.slot].take() else {
            self.queue.release(&mut state, head.slot);
            return Err(MailError::Fault(format!("slot {} is already lent out", head.slot)));
        };
        state.peek_locked = true;
        Ok(PeekGuard {
            mailbox: self,
            envelope: head.envelope,
            slot: head.slot,
            len: head.len,
            buf: Some(buf),
        })
    }

    /// Release a peeked message.  Equivalent to dropping the guard.
    pub fn peek_end(&self, guard: PeekGuard<'_>) {
        drop(guard);
    }

    /// Discard every queued message.  Returns how many were dropped.
    pub fn clean(&self) -> usize {
        let n = self.queue.clean();
        if n > 0 {
            debug!(mbx = %self.addr(), dropped = n, "mailbox cleaned");
        }
        n
    }

    // ── Request / response ───────────────────────────────────────────────

    /// Send command `msg_type` to `dest` and wait for its reply.
    ///
    /// Unrelated messages that arrive while waiting are discarded, so use a
    /// mailbox dedicated to replies.
    ///
    /// # Errors
    ///
    /// * [`MailError::NotAvailable`] – the reply was `NOT_AVAILABLE`.
    /// * [`MailError::Rejected`] – the reply was `ERROR` or `TIMEOUT`.
    /// * [`MailError::Timeout`] – no reply before `timeout`.
    pub fn call(
        &self,
        msg_type: i8,
        dest: MailboxAddr,
        parts: &[&[u8]],
        timeout: Timeout,
    ) -> Result<Message, MailError> {
        let seq_nr = self.next_seq.fetch_add(1, Ordering::Relaxed);
        self.send_with_payload(msg_type, dest, seq_nr, parts)?;

        let deadline = timeout.deadline();
        loop {
            let remaining = match (timeout, deadline) {
                (Timeout::After(_), Some(d)) => {
                    let left = d.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        return Err(MailError::Timeout);
                    }
                    Timeout::After(left)
                }
                (other, _) => other,
            };
            let reply = match self.receive(remaining) {
                Err(MailError::WouldBlock) => return Err(MailError::Timeout),
                other => other?,
            };
            let env = reply.envelope;
            if env.src != dest || env.seq_nr != seq_nr || env.is_command() {
                debug!(
                    mbx = %self.addr(),
                    src = %env.src,
                    msg_type = msg::name(env.msg_type),
                    "discarding unrelated message while waiting for reply"
                );
                continue;
            }
            return match env.msg_type {
                msg::NOT_AVAILABLE => Err(MailError::NotAvailable(dest)),
                msg::ERROR | msg::TIMEOUT => Err(MailError::Rejected {
                    src: env.src,
                    msg_type: env.msg_type,
                }),
                _ => Ok(reply),
            };
        }
    }
}

impl Drop for Mailbox {
    fn drop(&mut self) {
        self.queue.close();
        self.bus.remove(self.addr());
    }
}

impl fmt::Debug for Mailbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mailbox")
            .field("addr", &self.addr())
            .field("max_payload", &self.queue.max_payload)
            .field("zero_copy", &self.queue.zero_copy)
            .finish()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// PeekGuard
// ────────────────────────────────────────────────────────────────────────────

/// A message borrowed in place from a [`Mailbox`].  Derefs to the payload.
pub struct PeekGuard<'a> {
    mailbox: &'a Mailbox,
    envelope: Envelope,
    slot: usize,
    len: usize,
    buf: Option<BytesMut>,
}

impl PeekGuard<'_> {
    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    pub fn payload(&self) -> &[u8] {
        self.buf.as_deref().map_or(&[], |b| &b[..self.len])
    }

    pub fn payload_u32(&self, index: usize) -> Option<u32> {
        payload_u32(&self.envelope, self.payload(), index)
    }
}

impl Deref for PeekGuard<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.payload()
    }
}

impl Drop for PeekGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.mailbox.queue.lock();
        state.buffers[self.slot] = self.buf.take();
        state.peek_locked = false;
        self.mailbox.queue.release(&mut state, self.slot);
    }
}
