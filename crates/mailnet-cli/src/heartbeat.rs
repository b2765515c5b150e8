//! [`Heartbeat`] – a clock-driven [`DataSource`] for exercising a network.
//!
//! Each sample is two native-order `u32`s: milliseconds since the source
//! was created, then a running beat count.

use std::time::Instant;

use mailnet_stream::DataSource;
use mailnet_types::MailError;
use tracing::info;

pub const SAMPLE_LEN: usize = 8;

pub struct Heartbeat {
    period_ms: u32,
    epoch: Instant,
    beats: u32,
}

impl Heartbeat {
    pub fn new(period_ms: u32) -> Self {
        Self {
            period_ms: period_ms.max(1),
            epoch: Instant::now(),
            beats: 0,
        }
    }
}

impl DataSource for Heartbeat {
    fn name(&self) -> &str {
        "heartbeat"
    }

    fn period_ms(&self) -> u32 {
        self.period_ms
    }

    fn max_payload(&self) -> usize {
        SAMPLE_LEN
    }

    fn on(&mut self) -> Result<(), MailError> {
        info!(period_ms = self.period_ms, "heartbeat on");
        Ok(())
    }

    fn off(&mut self) -> Result<(), MailError> {
        info!(beats = self.beats, "heartbeat off");
        Ok(())
    }

    fn acquire(&mut self, buf: &mut [u8]) -> Result<usize, MailError> {
        let sample = buf
            .get_mut(..SAMPLE_LEN)
            .ok_or_else(|| MailError::Fault(format!("sample buffer shorter than {SAMPLE_LEN} bytes")))?;
        self.beats = self.beats.wrapping_add(1);
        let now = u32::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u32::MAX);
        sample[..4].copy_from_slice(&now.to_ne_bytes());
        sample[4..].copy_from_slice(&self.beats.to_ne_bytes());
        Ok(SAMPLE_LEN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn beats_count_up() {
        let mut hb = Heartbeat::new(10);
        let mut buf = [0u8; SAMPLE_LEN];
        hb.acquire(&mut buf).unwrap();
        hb.acquire(&mut buf).unwrap();
        assert_eq!(u32::from_ne_bytes(buf[4..].try_into().unwrap()), 2);
    }

    #[test]
    fn short_buffer_is_a_fault() {
        let mut hb = Heartbeat::new(10);
        let mut buf = [0u8; 4];
        assert!(matches!(hb.acquire(&mut buf), Err(MailError::Fault(_))));
    }

    #[test]
    fn zero_period_is_clamped() {
        assert_eq!(Heartbeat::new(0).period_ms(), 1);
    }
}
