//! [`Reassembler`] – rebuilds split messages from their fragments.
//!
//! One reassembly is in flight per sender address.  A continuation must carry
//! exactly the next sequence number; anything else throws the partial message
//! away.  Nothing is ever retransmitted, so a gap means the message is lost.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use bytes::{BufMut, Bytes, BytesMut};
use mailnet_types::{Envelope, HEADER_LEN, MailError, MailboxAddr, flags};
use tracing::{debug, error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReassemblyConfig {
    /// Senders that may have a split message in flight at once.
    pub max_pending: usize,
    /// A reassembly older than this is dropped.
    pub timeout: Duration,
    /// Largest message (header included) that will be reassembled.
    pub max_message: usize,
}

impl Default for ReassemblyConfig {
    fn default() -> Self {
        Self {
            max_pending: 16,
            timeout: Duration::from_secs(1),
            max_message: 64 * 1024,
        }
    }
}

struct Partial {
    buf: BytesMut,
    expected: usize,
    last_seq: u8,
    started: Instant,
}

pub struct Reassembler {
    config: ReassemblyConfig,
    pending: HashMap<MailboxAddr, Partial>,
}

impl Reassembler {
    pub fn new(config: ReassemblyConfig) -> Self {
        Self {
            config,
            pending: HashMap::new(),
        }
    }

    pub fn config(&self) -> &ReassemblyConfig {
        &self.config
    }

    /// Number of senders with a split message in progress.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn accept(&mut self, datagram: &[u8]) -> Result<Option<Bytes>, MailError> {
        self.accept_at(datagram, Instant::now())
    }

    /// Feed one datagram received at `now`.
    ///
    /// Returns the complete message once its last fragment arrives, and
    /// `None` while more fragments are expected.  The returned message has
    /// its original header flags back.
    ///
    /// # Errors
    ///
    /// * [`MailError::Protocol`] – malformed datagram, sequence gap, or a
    ///   continuation with no reassembly in progress.  Any partial message
    ///   from that sender is discarded.
    /// * [`MailError::Timeout`] – the sender's reassembly went stale.
    /// * [`MailError::OutOfResources`] – too many senders in flight.
    pub fn accept_at(&mut self, datagram: &[u8], now: Instant) -> Result<Option<Bytes>, MailError> {
        let header = Envelope::decode(datagram)?;
        match header.flags & flags::SPLIT_MASK {
            0 => {
                if header.total_len as usize != datagram.len() {
                    return Err(MailError::Protocol(format!(
                        "datagram of {} bytes claims {}",
                        datagram.len(),
                        header.total_len
                    )));
                }
                Ok(Some(Bytes::copy_from_slice(datagram)))
            }
            flags::SPLIT_START => self.start(&header, datagram, now).map(|()| None),
            flags::SPLIT => self.extend(&header, datagram, now, false),
            flags::SPLIT_STOP => self.extend(&header, datagram, now, true),
            other => Err(MailError::Protocol(format!("conflicting split flags {other:#04x}"))),
        }
    }

    fn start(&mut self, header: &Envelope, datagram: &[u8], now: Instant) -> Result<(), MailError> {
        let expected = header.total_len as usize;
        if expected > self.config.max_message {
            return Err(MailError::Protocol(format!(
                "split message of {expected} bytes exceeds {}",
                self.config.max_message
            )));
        }
        if datagram.len() >= expected {
            return Err(MailError::Protocol(format!(
                "first fragment of {} bytes already holds the {expected} byte message",
                datagram.len()
            )));
        }

        if let Some(stale) = self.pending.remove(&header.src) {
            warn!(
                src = %header.src,
                received = stale.buf.len(),
                expected = stale.expected,
                "new split message replaces an unfinished one"
            );
        } else if self.pending.len() >= self.config.max_pending {
            self.expire(now);
            if self.pending.len() >= self.config.max_pending {
                warn!(src = %header.src, max_pending = self.config.max_pending, "reassembly table full");
                return Err(MailError::OutOfResources(format!(
                    "{} reassemblies already in flight",
                    self.config.max_pending
                )));
            }
        }

        let mut buf = BytesMut::with_capacity(expected);
        buf.put_slice(datagram);
        buf[7] &= !flags::SPLIT_MASK;
        self.pending.insert(
            header.src,
            Partial {
                buf,
                expected,
                last_seq: 0,
                started: now,
            },
        );
        Ok(())
    }

    fn extend(
        &mut self,
        header: &Envelope,
        datagram: &[u8],
        now: Instant,
        last: bool,
    ) -> Result<Option<Bytes>, MailError> {
        let src = header.src;
        let Some(partial) = self.pending.get_mut(&src) else {
            debug!(src = %src, seq_nr = header.seq_nr, "continuation without a start");
            return Err(MailError::Protocol(format!("no split message in progress from {src}")));
        };

        if now.saturating_duration_since(partial.started) > self.config.timeout {
            self.pending.remove(&src);
            warn!(src = %src, "split message timed out");
            return Err(MailError::Timeout);
        }

        if header.seq_nr != partial.last_seq.wrapping_add(1) {
            error!(
                src = %src,
                expected = partial.last_seq.wrapping_add(1),
                got = header.seq_nr,
                "sequence gap in split message, discarding"
            );
            self.pending.remove(&src);
            return Err(MailError::Protocol(format!("sequence gap from {src}")));
        }

        let chunk = match datagram.get(HEADER_LEN..) {
            Some(chunk) if header.total_len as usize == datagram.len() => chunk,
            _ => {
                self.pending.remove(&src);
                return Err(MailError::Protocol(format!("malformed continuation from {src}")));
            }
        };
        if partial.buf.len() + chunk.len() > partial.expected {
            error!(src = %src, expected = partial.expected, "split message overruns its length");
            self.pending.remove(&src);
            return Err(MailError::Protocol(format!("split message from {src} overruns")));
        }
        partial.buf.put_slice(chunk);
        partial.last_seq = header.seq_nr;

        if !last {
            return Ok(None);
        }
        let Some(partial) = self.pending.remove(&src) else {
            return Ok(None);
        };
        if partial.buf.len() != partial.expected {
            error!(
                src = %src,
                received = partial.buf.len(),
                expected = partial.expected,
                "split message ended short"
            );
            return Err(MailError::Protocol(format!("split message from {src} ended short")));
        }
        Ok(Some(partial.buf.freeze()))
    }

    /// Drop reassemblies older than the configured timeout.  Returns how many
    /// were dropped.
    pub fn expire(&mut self, now: Instant) -> usize {
        let timeout = self.config.timeout;
        let before = self.pending.len();
        self.pending.retain(|src, partial| {
            let fresh = now.saturating_duration_since(partial.started) <= timeout;
            if !fresh {
                warn!(src = %src, received = partial.buf.len(), "dropping stale split message");
            }
            fresh
        });
        before - self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::splitter::{DEFAULT_MAX_FRAGMENT, split};
    use mailnet_types::msg;
    use proptest::prelude::*;

    fn message_from(src: MailboxAddr, payload_len: usize) -> Vec<u8> {
        let env = Envelope::new(msg::DATA, src, MailboxAddr(0x0909_0001), 7)
            .with_payload_len(payload_len)
            .unwrap();
        let mut buf = Vec::with_capacity(env.total_len as usize);
        env.encode(&mut buf);
        buf.extend((0..payload_len).map(|i| (i * 7 % 256) as u8));
        buf
    }

    fn message(payload_len: usize) -> Vec<u8> {
        message_from(MailboxAddr(0x0101_0001), payload_len)
    }

    fn feed(r: &mut Reassembler, frags: &[Bytes]) -> Vec<Result<Option<Bytes>, MailError>> {
        frags.iter().map(|f| r.accept(f)).collect()
    }

    #[test]
    fn five_thousand_bytes_reassemble() {
        let msg = message(5000 - HEADER_LEN);
        let frags = split(&msg, 1400).unwrap();
        assert_eq!(frags.len(), 4);

        let mut r = Reassembler::new(ReassemblyConfig::default());
        assert!(r.accept(&frags[0]).unwrap().is_none());
        assert!(r.accept(&frags[1]).unwrap().is_none());
        assert!(r.accept(&frags[2]).unwrap().is_none());
        let whole = r.accept(&frags[3]).unwrap().unwrap();
        assert_eq!(whole.len(), 5000);
        assert_eq!(&whole[..], &msg[..]);
        assert_eq!(r.pending(), 0);
    }

    #[test]
    fn unsplit_datagram_passes_through() {
        let msg = message(20);
        let mut r = Reassembler::new(ReassemblyConfig::default());
        assert_eq!(&r.accept(&msg).unwrap().unwrap()[..], &msg[..]);
    }

    #[test]
    fn sequence_gap_discards_the_message() {
        let msg = message(4000);
        let frags = split(&msg, 1000).unwrap();
        let mut r = Reassembler::new(ReassemblyConfig::default());
        r.accept(&frags[0]).unwrap();
        r.accept(&frags[1]).unwrap();
        assert!(matches!(r.accept(&frags[3]), Err(MailError::Protocol(_))));
        assert_eq!(r.pending(), 0);
        // The rest of the message has nothing to attach to.
        assert!(matches!(r.accept(&frags[4]), Err(MailError::Protocol(_))));
    }

    #[test]
    fn new_start_replaces_unfinished_message() {
        let first = message(3000);
        let second = message(2500);
        let a = split(&first, 1000).unwrap();
        let b = split(&second, 1000).unwrap();

        let mut r = Reassembler::new(ReassemblyConfig::default());
        r.accept(&a[0]).unwrap();
        r.accept(&a[1]).unwrap();
        let mut out = None;
        for frag in &b {
            out = r.accept(frag).unwrap();
        }
        assert_eq!(&out.unwrap()[..], &second[..]);
        assert_eq!(r.pending(), 0);
    }

    #[test]
    fn senders_are_reassembled_independently() {
        let x = message_from(MailboxAddr(1), 2500);
        let y = message_from(MailboxAddr(2), 2500);
        let fx = split(&x, 1000).unwrap();
        let fy = split(&y, 1000).unwrap();

        let mut r = Reassembler::new(ReassemblyConfig::default());
        let mut done = Vec::new();
        for (a, b) in fx.iter().zip(&fy) {
            done.extend(r.accept(a).unwrap());
            done.extend(r.accept(b).unwrap());
        }
        assert_eq!(done.len(), 2);
        assert_eq!(&done[0][..], &x[..]);
        assert_eq!(&done[1][..], &y[..]);
    }

    #[test]
    fn stale_reassembly_times_out() {
        let msg = message(3000);
        let frags = split(&msg, 1000).unwrap();
        let mut r = Reassembler::new(ReassemblyConfig {
            timeout: Duration::from_millis(50),
            ..ReassemblyConfig::default()
        });
        let t0 = Instant::now();
        r.accept_at(&frags[0], t0).unwrap();
        let late = t0 + Duration::from_millis(60);
        assert!(matches!(r.accept_at(&frags[1], late), Err(MailError::Timeout)));
        assert_eq!(r.pending(), 0);
    }

    #[test]
    fn expire_drops_only_old_entries() {
        let mut r = Reassembler::new(ReassemblyConfig {
            timeout: Duration::from_millis(100),
            ..ReassemblyConfig::default()
        });
        let t0 = Instant::now();
        let old = split(&message_from(MailboxAddr(1), 3000), 1000).unwrap();
        let new = split(&message_from(MailboxAddr(2), 3000), 1000).unwrap();
        r.accept_at(&old[0], t0).unwrap();
        r.accept_at(&new[0], t0 + Duration::from_millis(80)).unwrap();

        assert_eq!(r.expire(t0 + Duration::from_millis(150)), 1);
        assert_eq!(r.pending(), 1);
        assert!(r.accept_at(&new[1], t0 + Duration::from_millis(150)).is_ok());
    }

    #[test]
    fn table_full_rejects_new_senders() {
        let mut r = Reassembler::new(ReassemblyConfig {
            max_pending: 2,
            ..ReassemblyConfig::default()
        });
        for src in 1..=2 {
            let frags = split(&message_from(MailboxAddr(src), 3000), 1000).unwrap();
            r.accept(&frags[0]).unwrap();
        }
        let frags = split(&message_from(MailboxAddr(3), 3000), 1000).unwrap();
        assert!(matches!(r.accept(&frags[0]), Err(MailError::OutOfResources(_))));
        assert_eq!(r.pending(), 2);
    }

    #[test]
    fn oversized_message_is_refused() {
        let frags = split(&message(5000), 1000).unwrap();
        let mut r = Reassembler::new(ReassemblyConfig {
            max_message: 4096,
            ..ReassemblyConfig::default()
        });
        assert!(matches!(r.accept(&frags[0]), Err(MailError::Protocol(_))));
        assert_eq!(r.pending(), 0);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn split_then_reassemble_is_identity(payload_len in 1usize..=10 * DEFAULT_MAX_FRAGMENT) {
            let msg = message(payload_len);
            let frags = split(&msg, DEFAULT_MAX_FRAGMENT).unwrap();
            let mut r = Reassembler::new(ReassemblyConfig::default());

            let results = feed(&mut r, &frags);
            let (last, head) = results.split_last().unwrap();
            for res in head {
                prop_assert!(matches!(res, Ok(None)));
            }
            let whole = last.as_ref().unwrap().as_ref().unwrap();
            prop_assert_eq!(&whole[..], &msg[..]);
        }

        #[test]
        fn dropped_middle_fragment_delivers_nothing(
            payload_len in 2 * DEFAULT_MAX_FRAGMENT..=10 * DEFAULT_MAX_FRAGMENT,
            pick in any::<prop::sample::Index>(),
        ) {
            let msg = message(payload_len);
            let mut frags = split(&msg, DEFAULT_MAX_FRAGMENT).unwrap();
            prop_assume!(frags.len() >= 3);
            let dropped = 1 + pick.index(frags.len() - 2);
            frags.remove(dropped);

            let mut r = Reassembler::new(ReassemblyConfig::default());
            for res in feed(&mut r, &frags) {
                prop_assert!(!matches!(res, Ok(Some(_))));
            }
            prop_assert_eq!(r.pending(), 0);
        }
    }
}
