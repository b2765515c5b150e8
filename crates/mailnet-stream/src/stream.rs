//! [`DataStream`] – a producer's data buffer and listener table behind one
//! facade, plus the standard stream command handling.
//!
//! Lock order is always buffer first, listeners second, so "latest sample"
//! and "who was told about it" never disagree.
//!
//! | Command | Payload | Reply |
//! |---|---|---|
//! | `GET_DATA` | `u32` timestamp (`0` = newest) | `DATA` with the sample, or `ERROR` |
//! | `GET_CONT_DATA` | `u32` period ms, `u32` data mailbox | `CONT_DATA` with the achieved period, or `ERROR` |
//! | `GET_NEXT_DATA` | `u32` data mailbox | `OK`, then one `DATA` push |
//! | `STOP_CONT_DATA` | `u32` data mailbox | `OK` |

use std::sync::{Mutex, MutexGuard};

use mailnet_mailbox::{Mailbox, Message};
use mailnet_types::{MailError, MailboxAddr, msg};
use tracing::{debug, warn};

use crate::buffer::{DataBuffer, Sample};
use crate::listener::{ListenerRegistry, Subscription};

/// Sizing of one producer's stream.
#[derive(Debug, Clone, Copy)]
pub struct StreamConfig {
    /// Samples kept for `GET_DATA` lookups.
    pub ring_len: usize,
    pub max_payload: usize,
    pub period_ms: u32,
    pub max_listeners: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            ring_len: 50,
            max_payload: 1024,
            period_ms: 100,
            max_listeners: 16,
        }
    }
}

#[derive(Debug)]
pub struct DataStream {
    buffer: Mutex<DataBuffer>,
    listeners: Mutex<ListenerRegistry>,
}

impl DataStream {
    pub fn new(config: StreamConfig) -> Result<Self, MailError> {
        Ok(Self {
            buffer: Mutex::new(DataBuffer::new(config.ring_len, config.max_payload, config.period_ms)?),
            listeners: Mutex::new(ListenerRegistry::new(config.period_ms, config.max_listeners)),
        })
    }

    /// Store `payload` and push it to every due listener through `sender`.
    /// Returns the sample counter.
    pub fn publish(&self, sender: &Mailbox, payload: &[u8]) -> Result<u32, MailError> {
        let mut buffer = lock(&self.buffer);
        let counter = buffer.publish(payload)?;
        let mut listeners = lock(&self.listeners);
        if !listeners.is_empty() {
            let sample = buffer.latest_payload().unwrap_or_default();
            listeners.notify(sender, counter, sample);
        }
        Ok(counter)
    }

    pub fn get_nearest(&self, timestamp: u32) -> Result<Sample, MailError> {
        lock(&self.buffer).get_nearest(timestamp)
    }

    pub fn subscribe(
        &self,
        subscriber: MailboxAddr,
        requested_period_ms: u32,
        one_shot: bool,
        seq_nr: u8,
    ) -> Result<Subscription, MailError> {
        let _buffer = lock(&self.buffer);
        lock(&self.listeners).subscribe(subscriber, requested_period_ms, one_shot, seq_nr)
    }

    pub fn unsubscribe(&self, subscriber: MailboxAddr) -> bool {
        let _buffer = lock(&self.buffer);
        lock(&self.listeners).unsubscribe(subscriber)
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.listeners).len()
    }

    pub fn sample_counter(&self) -> u32 {
        lock(&self.buffer).counter()
    }

    /// Answer a stream command received on `mailbox`.
    ///
    /// Returns `Ok(false)` when `request` is not a stream command so the
    /// caller can handle it.  Malformed or unanswerable requests get an
    /// `ERROR` reply; only failures to send the reply are returned.
    pub fn handle_command(&self, mailbox: &Mailbox, request: &Message) -> Result<bool, MailError> {
        let env = &request.envelope;
        let reply = match env.msg_type {
            msg::GET_DATA => {
                let timestamp = request.payload_u32(0).unwrap_or(0);
                match self.get_nearest(timestamp) {
                    Ok(sample) => {
                        mailbox.send_reply_with_payload(msg::DATA, env, &[&sample.payload])?;
                        return Ok(true);
                    }
                    Err(e) => Err(e),
                }
            }
            msg::GET_CONT_DATA => match (request.payload_u32(0), request.payload_u32(1)) {
                (Some(period), Some(data_mbx)) => self
                    .subscribe(MailboxAddr(data_mbx), period, false, env.seq_nr)
                    .map(|sub| Some(sub.achieved_period_ms)),
                _ => Err(MailError::Invalid("GET_CONT_DATA needs period and mailbox".into())),
            },
            msg::GET_NEXT_DATA => match request.payload_u32(0) {
                Some(data_mbx) => self
                    .subscribe(MailboxAddr(data_mbx), 0, true, env.seq_nr)
                    .map(|_| None),
                None => Err(MailError::Invalid("GET_NEXT_DATA needs a mailbox".into())),
            },
            msg::STOP_CONT_DATA => match request.payload_u32(0) {
                Some(data_mbx) => {
                    self.unsubscribe(MailboxAddr(data_mbx));
                    Ok(None)
                }
                None => Err(MailError::Invalid("STOP_CONT_DATA needs a mailbox".into())),
            },
            _ => return Ok(false),
        };

        match reply {
            Ok(Some(achieved_period_ms)) => {
                let period = achieved_period_ms.to_ne_bytes();
                mailbox.send_reply_with_payload(msg::CONT_DATA, env, &[&period])?;
            }
            Ok(None) => mailbox.send_reply(msg::OK, env)?,
            Err(e) => {
                warn!(
                    src = %env.src,
                    command = msg::name(env.msg_type),
                    error = %e,
                    "stream command rejected"
                );
                mailbox.send_reply(msg::ERROR, env)?;
            }
        }
        debug!(src = %env.src, command = msg::name(env.msg_type), "stream command handled");
        Ok(true)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| {
        warn!("stream lock poisoned; recovering");
        p.into_inner()
    })
}
