//! [`DataBuffer`] – ring of the most recent samples of one producer.
//!
//! Slots are allocated once and overwritten in place.  The first field of
//! every sample is its `u32` recording timestamp in milliseconds (native
//! byte order), which is all the buffer needs to know about the payload.

use bytes::{Bytes, BytesMut};
use mailnet_types::MailError;

/// Size of the leading timestamp field.
pub const TIMESTAMP_LEN: usize = 4;

/// A sample copied out of the ring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    /// Global publish counter of this sample.  Never `0`.
    pub counter: u32,
    pub timestamp: u32,
    pub payload: Bytes,
}

#[derive(Debug)]
pub struct DataBuffer {
    slots: Vec<BytesMut>,
    lens: Vec<usize>,
    counters: Vec<u32>,
    /// Slot written by the latest publish.
    index: usize,
    /// Number of slots holding a sample, up to `slots.len()`.
    filled: usize,
    counter: u32,
    period_ms: u32,
    max_payload: usize,
}

impl DataBuffer {
    /// A ring of `capacity` slots of `max_payload` bytes each.
    ///
    /// # Errors
    ///
    /// [`MailError::Invalid`] for an empty ring or a slot too small to hold
    /// the timestamp.
    pub fn new(capacity: usize, max_payload: usize, period_ms: u32) -> Result<Self, MailError> {
        if capacity == 0 {
            return Err(MailError::Invalid("data buffer needs at least one slot".into()));
        }
        if max_payload < TIMESTAMP_LEN {
            return Err(MailError::Invalid(format!(
                "samples of {max_payload} bytes cannot hold a timestamp"
            )));
        }
        Ok(Self {
            slots: (0..capacity).map(|_| BytesMut::zeroed(max_payload)).collect(),
            lens: vec![0; capacity],
            counters: vec![0; capacity],
            index: capacity - 1,
            filled: 0,
            counter: 0,
            period_ms,
            max_payload,
        })
    }

    /// Store a new sample and return its counter.
    ///
    /// # Errors
    ///
    /// * [`MailError::Fault`] – larger than a slot.
    /// * [`MailError::Invalid`] – shorter than the timestamp field.
    pub fn publish(&mut self, payload: &[u8]) -> Result<u32, MailError> {
        if payload.len() > self.max_payload {
            return Err(MailError::Fault(format!(
                "{} byte sample exceeds the {} byte slots",
                payload.len(),
                self.max_payload
            )));
        }
        if payload.len() < TIMESTAMP_LEN {
            return Err(MailError::Invalid("sample is missing its timestamp".into()));
        }

        self.index = (self.index + 1) % self.slots.len();
        self.counter = self.counter.wrapping_add(1);
        if self.counter == 0 {
            self.counter = 1;
        }
        self.slots[self.index][..payload.len()].copy_from_slice(payload);
        self.lens[self.index] = payload.len();
        self.counters[self.index] = self.counter;
        self.filled = (self.filled + 1).min(self.slots.len());
        Ok(self.counter)
    }

    /// Bytes of the latest sample, borrowed from the ring.
    pub fn latest_payload(&self) -> Option<&[u8]> {
        (self.filled > 0).then(|| &self.slots[self.index][..self.lens[self.index]])
    }

    /// Counter of the latest publish, `0` before the first one.
    pub fn counter(&self) -> u32 {
        self.counter
    }

    pub fn len(&self) -> usize {
        self.filled
    }

    pub fn is_empty(&self) -> bool {
        self.filled == 0
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn period_ms(&self) -> u32 {
        self.period_ms
    }

    /// The sample recorded closest to `timestamp`; `0` means newest.
    ///
    /// The ring is time-ordered, so the scan runs from the oldest sample and
    /// stops at the first increase of the distance.
    ///
    /// # Errors
    ///
    /// [`MailError::Invalid`] when nothing was published yet, or `timestamp`
    /// is older than the oldest retained sample or newer than the newest one
    /// plus two periods.
    pub fn get_nearest(&self, timestamp: u32) -> Result<Sample, MailError> {
        if self.filled == 0 {
            return Err(MailError::Invalid("no sample recorded yet".into()));
        }
        if timestamp == 0 {
            return Ok(self.sample_at(self.index));
        }

        let oldest = self.slot_from_oldest(0);
        let oldest_ts = self.timestamp_at(oldest);
        let newest_ts = self.timestamp_at(self.index);
        let horizon = u64::from(newest_ts) + 2 * u64::from(self.period_ms);
        if timestamp < oldest_ts || u64::from(timestamp) > horizon {
            return Err(MailError::Invalid(format!(
                "timestamp {timestamp} outside retained range {oldest_ts}..={horizon}"
            )));
        }

        let mut best = oldest;
        let mut best_diff = timestamp.abs_diff(oldest_ts);
        for age in 1..self.filled {
            let slot = self.slot_from_oldest(age);
            let diff = timestamp.abs_diff(self.timestamp_at(slot));
            if diff > best_diff {
                break;
            }
            best = slot;
            best_diff = diff;
        }
        Ok(self.sample_at(best))
    }

    fn slot_from_oldest(&self, age: usize) -> usize {
        let cap = self.slots.len();
        (self.index + cap + 1 - self.filled + age) % cap
    }

    fn timestamp_at(&self, slot: usize) -> u32 {
        let mut ts = [0u8; TIMESTAMP_LEN];
        ts.copy_from_slice(&self.slots[slot][..TIMESTAMP_LEN]);
        u32::from_ne_bytes(ts)
    }

    fn sample_at(&self, slot: usize) -> Sample {
        Sample {
            counter: self.counters[slot],
            timestamp: self.timestamp_at(slot),
            payload: Bytes::copy_from_slice(&self.slots[slot][..self.lens[slot]]),
        }
    }
}
