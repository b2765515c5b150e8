//! Generic [`DataSource`] trait implemented by sampling drivers.

use mailnet_types::MailError;

/// A periodically sampled device (camera, ladar, compass, ...).
///
/// Drivers implement this trait and hand it to
/// [`DataModule::spawn`][crate::module::DataModule::spawn], which calls
/// [`DataSource::acquire`] once per period from its data task.
pub trait DataSource: Send + 'static {
    /// Stable name used in logs, e.g. `"front_ladar"`.
    fn name(&self) -> &str;

    /// Sampling period in milliseconds.
    fn period_ms(&self) -> u32;

    /// Largest sample this source produces, timestamp included.
    fn max_payload(&self) -> usize;

    /// Power the device up.  Called when the module receives `ON`.
    fn on(&mut self) -> Result<(), MailError> {
        Ok(())
    }

    /// Power the device down.  Called on `OFF` and at shutdown.
    fn off(&mut self) -> Result<(), MailError> {
        Ok(())
    }

    /// Write the next sample into `buf` and return its length.
    ///
    /// The first four bytes must be the `u32` recording timestamp in
    /// milliseconds, native byte order.
    ///
    /// # Errors
    ///
    /// Any [`MailError`]; the data task logs it and tries again next period.
    fn acquire(&mut self, buf: &mut [u8]) -> Result<usize, MailError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Clock {
        now: u32,
    }

    impl DataSource for Clock {
        fn name(&self) -> &str {
            "clock"
        }

        fn period_ms(&self) -> u32 {
            10
        }

        fn max_payload(&self) -> usize {
            4
        }

        fn acquire(&mut self, buf: &mut [u8]) -> Result<usize, MailError> {
            self.now += self.period_ms();
            buf[..4].copy_from_slice(&self.now.to_ne_bytes());
            Ok(4)
        }
    }

    #[test]
    fn clock_samples_carry_their_timestamp() {
        let mut clock = Clock { now: 0 };
        let mut buf = [0u8; 4];
        assert!(clock.on().is_ok());
        assert_eq!(clock.acquire(&mut buf).unwrap(), 4);
        assert_eq!(u32::from_ne_bytes(buf), 10);
        assert_eq!(clock.name(), "clock");
    }
}
