//! [`DataModule`] – runs a [`DataSource`] as a command task plus a data
//! task, both plain OS threads.
//!
//! * The **command task** owns the module's command mailbox.  It answers
//!   `ON`, `OFF`, `GET_STATUS` and the stream commands of
//!   [`DataStream::handle_command`]; any other command gets `ERROR`.
//! * The **data task** owns the data mailbox.  While the module is on it
//!   calls [`DataSource::acquire`] once per period and publishes the sample.
//!   Samples that cannot be delivered to a remote subscriber come back to
//!   the data mailbox as `NOT_AVAILABLE`; each period the task drains those
//!   and unsubscribes the mailbox that bounced.
//!
//! Both tasks poll a shared stop flag between blocking calls.  Dropping the
//! [`DataModule`] sets the flag, joins both threads and powers the source
//! down.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use mailnet_mailbox::{MailBus, Mailbox, MailboxConfig, Message};
use mailnet_types::{MailError, MailboxAddr, Timeout, msg};
use tracing::{debug, error, info, warn};

use crate::source::DataSource;
use crate::stream::{DataStream, StreamConfig};

#[derive(Debug, Clone)]
pub struct ModuleConfig {
    /// Command mailbox address.
    pub cmd_addr: MailboxAddr,
    /// Address continuous data is sent from.
    pub data_addr: MailboxAddr,
    pub cmd_slots: usize,
    pub cmd_max_payload: usize,
    pub ring_len: usize,
    pub max_listeners: usize,
    /// Switch the source on at startup instead of waiting for `ON`.
    pub start_on: bool,
    /// Upper bound on how long either task ignores the stop flag.
    pub poll_interval: Duration,
}

impl ModuleConfig {
    pub fn new(cmd_addr: MailboxAddr) -> Self {
        Self {
            cmd_addr,
            data_addr: cmd_addr.with_local(cmd_addr.local().wrapping_add(1)),
            cmd_slots: 16,
            cmd_max_payload: 64,
            ring_len: 50,
            max_listeners: 16,
            start_on: false,
            poll_interval: Duration::from_millis(100),
        }
    }
}

struct Shared<S> {
    source: Mutex<S>,
    stream: DataStream,
    enabled: AtomicBool,
    stop: AtomicBool,
}

impl<S> Shared<S> {
    fn source(&self) -> MutexGuard<'_, S> {
        self.source.lock().unwrap_or_else(|p| {
            warn!("data source lock poisoned; recovering");
            p.into_inner()
        })
    }
}

/// A running producer module.  See the [module docs](self).
pub struct DataModule<S: DataSource> {
    shared: Arc<Shared<S>>,
    cmd_addr: MailboxAddr,
    threads: Vec<JoinHandle<()>>,
}

impl<S: DataSource> DataModule<S> {
    /// Create both mailboxes on `bus` and start the two tasks.
    ///
    /// # Errors
    ///
    /// Mailbox creation failures, an unusable stream configuration, or
    /// [`MailError::Io`] when a thread cannot be spawned.
    pub fn spawn(bus: &MailBus, config: ModuleConfig, mut source: S) -> Result<Self, MailError> {
        let stream = DataStream::new(StreamConfig {
            ring_len: config.ring_len,
            max_payload: source.max_payload(),
            period_ms: source.period_ms(),
            max_listeners: config.max_listeners,
        })?;
        let cmd = bus.create(
            config.cmd_addr,
            MailboxConfig::new(config.cmd_slots, config.cmd_max_payload),
        )?;
        // Only ever receives payload-less NOT_AVAILABLE bounces.
        let data = bus.create(config.data_addr, MailboxConfig::new(config.cmd_slots, 0))?;

        if config.start_on {
            source.on()?;
        }
        let name = source.name().to_string();
        let shared = Arc::new(Shared {
            source: Mutex::new(source),
            stream,
            enabled: AtomicBool::new(config.start_on),
            stop: AtomicBool::new(false),
        });

        let mut module = Self {
            shared: Arc::clone(&shared),
            cmd_addr: config.cmd_addr,
            threads: Vec::with_capacity(2),
        };

        let poll = config.poll_interval;
        let cmd_shared = Arc::clone(&shared);
        module.threads.push(
            thread::Builder::new()
                .name(format!("{name}-cmd"))
                .spawn(move || command_task(&cmd_shared, &cmd, poll))?,
        );
        let data_shared = shared;
        module.threads.push(
            thread::Builder::new()
                .name(format!("{name}-data"))
                .spawn(move || data_task(&data_shared, &data, poll))?,
        );

        info!(module = %name, cmd = %config.cmd_addr, data = %config.data_addr, "module started");
        Ok(module)
    }

    pub fn cmd_addr(&self) -> MailboxAddr {
        self.cmd_addr
    }

    pub fn is_enabled(&self) -> bool {
        self.shared.enabled.load(Ordering::Acquire)
    }

    pub fn stream(&self) -> &DataStream {
        &self.shared.stream
    }

    /// Stop both tasks and wait for them.  Also done on drop.
    pub fn shutdown(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                error!(cmd = %self.cmd_addr, "module task panicked");
            }
        }
        if self.shared.enabled.swap(false, Ordering::AcqRel) {
            if let Err(e) = self.shared.source().off() {
                warn!(cmd = %self.cmd_addr, error = %e, "source did not power down cleanly");
            }
        }
    }
}

impl<S: DataSource> Drop for DataModule<S> {
    fn drop(&mut self) {
        if !self.threads.is_empty() {
            self.stop_and_join();
        }
    }
}

fn command_task<S: DataSource>(shared: &Shared<S>, cmd: &Mailbox, poll: Duration) {
    while !shared.stop.load(Ordering::Acquire) {
        let request = match cmd.receive(Timeout::After(poll)) {
            Ok(m) => m,
            Err(MailError::Timeout) => continue,
            Err(e) => {
                error!(mbx = %cmd.addr(), error = %e, "command mailbox failed");
                break;
            }
        };
        if let Err(e) = handle_request(shared, cmd, &request) {
            warn!(
                mbx = %cmd.addr(),
                src = %request.envelope.src,
                error = %e,
                "could not answer command"
            );
        }
    }
    debug!(mbx = %cmd.addr(), "command task stopped");
}

fn handle_request<S: DataSource>(shared: &Shared<S>, cmd: &Mailbox, request: &Message) -> Result<(), MailError> {
    if shared.stream.handle_command(cmd, request)? {
        return Ok(());
    }
    let env = &request.envelope;
    match env.msg_type {
        msg::ON => {
            let reply = match shared.source().on() {
                Ok(()) => {
                    shared.enabled.store(true, Ordering::Release);
                    msg::OK
                }
                Err(e) => {
                    warn!(mbx = %cmd.addr(), error = %e, "source failed to switch on");
                    msg::ERROR
                }
            };
            cmd.send_reply(reply, env)
        }
        msg::OFF => {
            shared.enabled.store(false, Ordering::Release);
            let reply = match shared.source().off() {
                Ok(()) => msg::OK,
                Err(_) => msg::ERROR,
            };
            cmd.send_reply(reply, env)
        }
        msg::GET_STATUS => {
            let reply = if shared.enabled.load(Ordering::Acquire) {
                msg::ENABLED
            } else {
                msg::DISABLED
            };
            cmd.send_reply(reply, env)
        }
        t if t > 0 => cmd.send_reply(msg::ERROR, env),
        _ => {
            debug!(mbx = %cmd.addr(), msg_type = msg::name(env.msg_type), "ignoring reply");
            Ok(())
        }
    }
}

fn data_task<S: DataSource>(shared: &Shared<S>, data: &Mailbox, poll: Duration) {
    let (max_payload, period_ms) = {
        let source = shared.source();
        (source.max_payload(), source.period_ms())
    };
    let mut buf = vec![0u8; max_payload];
    let period = Duration::from_millis(u64::from(period_ms));

    while !shared.stop.load(Ordering::Acquire) {
        let started = Instant::now();
        drop_unreachable_listeners(&shared.stream, data);
        if shared.enabled.load(Ordering::Acquire) {
            let acquired = shared.source().acquire(&mut buf);
            match acquired {
                Ok(len) => {
                    if let Err(e) = shared.stream.publish(data, &buf[..len.min(max_payload)]) {
                        warn!(mbx = %data.addr(), error = %e, "publish failed");
                    }
                }
                Err(e) => warn!(mbx = %data.addr(), error = %e, "acquire failed"),
            }
        }
        // Sleep out the rest of the period in poll-sized steps.
        let deadline = started + period.max(Duration::from_millis(1));
        while !shared.stop.load(Ordering::Acquire) {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                break;
            }
            thread::sleep(left.min(poll));
        }
    }
    debug!(mbx = %data.addr(), "data task stopped");
}

/// Unsubscribe every listener whose sample bounced.  Returns how many were
/// removed.
fn drop_unreachable_listeners(stream: &DataStream, data: &Mailbox) -> usize {
    let mut removed = 0;
    while let Ok(bounce) = data.receive_if() {
        let env = bounce.envelope;
        if env.msg_type != msg::NOT_AVAILABLE {
            debug!(mbx = %data.addr(), msg_type = msg::name(env.msg_type), "unexpected message on data mailbox");
            continue;
        }
        if stream.unsubscribe(env.src) {
            info!(subscriber = %env.src, "subscriber unreachable; unsubscribed");
            removed += 1;
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use mailnet_mailbox::u32_payload;

    const MODULE: MailboxAddr = MailboxAddr::compose(1, 4, 0, 0);
    const CLIENT: MailboxAddr = MailboxAddr::compose(1, 9, 0, 0);
    const CLIENT_DATA: MailboxAddr = MailboxAddr::compose(1, 9, 0, 1);

    struct Ticker {
        now: u32,
    }

    impl DataSource for Ticker {
        fn name(&self) -> &str {
            "ticker"
        }

        fn period_ms(&self) -> u32 {
            10
        }

        fn max_payload(&self) -> usize {
            8
        }

        fn acquire(&mut self, buf: &mut [u8]) -> Result<usize, MailError> {
            self.now += 10;
            buf[..4].copy_from_slice(&self.now.to_ne_bytes());
            buf[4..8].copy_from_slice(&[0xab; 4]);
            Ok(8)
        }
    }

    fn spawn(bus: &MailBus) -> DataModule<Ticker> {
        let mut config = ModuleConfig::new(MODULE);
        config.poll_interval = Duration::from_millis(10);
        DataModule::spawn(bus, config, Ticker { now: 0 }).unwrap()
    }

    #[test]
    fn data_address_defaults_to_next_local_id() {
        let config = ModuleConfig::new(MODULE);
        assert_eq!(config.data_addr, MailboxAddr::compose(1, 4, 0, 1));
    }

    #[test]
    fn on_status_off_cycle() {
        let bus = MailBus::default();
        let module = spawn(&bus);
        let client = bus.create(CLIENT, MailboxConfig::new(4, 64)).unwrap();

        let status = client.call(msg::GET_STATUS, MODULE, &[], Timeout::millis(500)).unwrap();
        assert_eq!(status.envelope.msg_type, msg::DISABLED);

        client.call(msg::ON, MODULE, &[], Timeout::millis(500)).unwrap();
        assert!(module.is_enabled());
        let status = client.call(msg::GET_STATUS, MODULE, &[], Timeout::millis(500)).unwrap();
        assert_eq!(status.envelope.msg_type, msg::ENABLED);

        client.call(msg::OFF, MODULE, &[], Timeout::millis(500)).unwrap();
        assert!(!module.is_enabled());
    }

    #[test]
    fn unknown_command_is_rejected() {
        let bus = MailBus::default();
        let _module = spawn(&bus);
        let client = bus.create(CLIENT, MailboxConfig::new(4, 64)).unwrap();
        let err = client.call(msg::SET_LOG, MODULE, &[], Timeout::millis(500)).unwrap_err();
        assert!(matches!(err, MailError::Rejected { msg_type: msg::ERROR, .. }));
    }

    #[test]
    fn continuous_data_flows_while_on() {
        let bus = MailBus::default();
        let module = spawn(&bus);
        let client = bus.create(CLIENT, MailboxConfig::new(4, 64)).unwrap();
        let sink = bus.create(CLIENT_DATA, MailboxConfig::new(64, 8)).unwrap();

        client.call(msg::ON, MODULE, &[], Timeout::millis(500)).unwrap();
        let request = u32_payload(&[20, CLIENT_DATA.raw()]);
        let reply = client
            .call(msg::GET_CONT_DATA, MODULE, &[&request], Timeout::millis(500))
            .unwrap();
        assert_eq!(reply.envelope.msg_type, msg::CONT_DATA);
        assert_eq!(reply.payload_u32(0), Some(20));

        let first = sink.receive(Timeout::millis(1000)).unwrap();
        let second = sink.receive(Timeout::millis(1000)).unwrap();
        let (t1, t2) = (first.payload_u32(0).unwrap(), second.payload_u32(0).unwrap());
        assert!(t2 > t1);
        assert_eq!(first.envelope.src, MailboxAddr::compose(1, 4, 0, 1));
        assert_eq!(&first.payload[4..], &[0xab; 4]);

        module.shutdown();
        assert!(!bus.contains(MODULE));
    }

    #[test]
    fn bounced_samples_unsubscribe_the_listener() {
        let bus = MailBus::default();
        let module = spawn(&bus);
        let client = bus.create(CLIENT, MailboxConfig::new(4, 64)).unwrap();
        let sink = bus.create(CLIENT_DATA, MailboxConfig::new(4, 8)).unwrap();

        let request = u32_payload(&[20, CLIENT_DATA.raw()]);
        client
            .call(msg::GET_CONT_DATA, MODULE, &[&request], Timeout::millis(500))
            .unwrap();
        assert_eq!(module.stream().listener_count(), 1);

        // What a transport sends back when the subscriber's mailbox is gone.
        sink.send(msg::NOT_AVAILABLE, MailboxAddr::compose(1, 4, 0, 1), 0).unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while module.stream().listener_count() != 0 {
            assert!(Instant::now() < deadline, "listener was not removed");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn drop_releases_mailboxes() {
        let bus = MailBus::default();
        {
            let _module = spawn(&bus);
            assert!(bus.contains(MODULE));
        }
        assert!(bus.is_empty());
    }
}
