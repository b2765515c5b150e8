//! `mailnet-client` – attaches a mailbox bus to a router and talks to
//! remote modules.
//!
//! By default the client dials the TCP router at `-i`/`-p`.  Passing one or
//! more `--route MBX@HOST:PORT` switches to the datagram transport instead:
//! `-i`/`-p` become the local UDP address and only the listed mailboxes are
//! reachable.

use std::net::SocketAddr;
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::mpsc::{Receiver, TryRecvError};

use clap::{Parser, Subcommand};
use mailnet_cli::config::Config;
use mailnet_cli::heartbeat::Heartbeat;
use mailnet_cli::{NetArgs, shutdown_signal, telemetry};
use mailnet_mailbox::{MailBus, Mailbox, MailboxConfig};
use mailnet_router::RouterClient;
use mailnet_split::DatagramLink;
use mailnet_stream::{DataModule, ModuleConfig};
use mailnet_types::{HEADER_LEN, MailError, MailboxAddr, Timeout, msg};
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "mailnet-client", version, about = "Talk to mailboxes across a mailnet router")]
struct Cli {
    #[command(flatten)]
    net: NetArgs,

    /// Mailbox address of this process
    #[arg(long, default_value = "01.00.00.01")]
    mbx: MailboxAddr,

    /// Reach MBX over UDP at HOST:PORT (repeatable)
    #[arg(long = "route", value_name = "MBX@HOST:PORT")]
    routes: Vec<Route>,

    /// How long to wait for a reply, in milliseconds
    #[arg(long, default_value_t = 3000)]
    timeout_ms: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Host a heartbeat module at `--mbx` until interrupted
    Serve {
        #[arg(long, default_value_t = 100)]
        period_ms: u32,
    },
    /// Ask a module whether it is switched on
    Status { dest: MailboxAddr },
    /// Switch a module on
    On { dest: MailboxAddr },
    /// Switch a module off
    Off { dest: MailboxAddr },
    /// Fetch the sample nearest a timestamp (0 for the newest)
    Get {
        dest: MailboxAddr,
        #[arg(long, default_value_t = 0)]
        at: u32,
    },
    /// Subscribe to a module and log every sample until interrupted
    Watch {
        dest: MailboxAddr,
        #[arg(long, default_value_t = 100)]
        period_ms: u32,
    },
}

#[derive(Debug, Clone, Copy)]
struct Route {
    mbx: MailboxAddr,
    peer: SocketAddr,
}

impl FromStr for Route {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (mbx, peer) = s
            .split_once('@')
            .ok_or_else(|| format!("expected MBX@HOST:PORT, got '{s}'"))?;
        Ok(Self {
            mbx: mbx.parse().map_err(|e: MailError| e.to_string())?,
            peer: peer.parse().map_err(|e| format!("bad peer address '{peer}': {e}"))?,
        })
    }
}

/// Keeps the transport alive for as long as it is held.
enum Transport {
    Tcp(RouterClient),
    Datagram(DatagramLink),
}

fn attach(config: &Config, routes: &[Route], bus: &MailBus) -> Result<Transport, MailError> {
    if routes.is_empty() {
        let client = RouterClient::connect(config.client_config(), bus)?;
        return Ok(Transport::Tcp(client));
    }
    let link = DatagramLink::bind(config.link_config(), bus)?;
    for route in routes {
        link.add_route(route.mbx, route.peer)?;
    }
    info!(local = %link.local_addr(), routes = routes.len(), "datagram transport ready");
    Ok(Transport::Datagram(link))
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = match cli.net.resolve() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("mailnet-client: {e}");
            return ExitCode::FAILURE;
        }
    };
    let _guard = telemetry::init_tracing("mailnet-client", &config.log_level);

    let signal = match shutdown_signal() {
        Ok(signal) => signal,
        Err(e) => {
            error!(error = %e, "failed to install Ctrl-C handler");
            return ExitCode::FAILURE;
        }
    };

    match run(&cli, &config, &signal) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "mailnet-client failed");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli, config: &Config, signal: &Receiver<()>) -> Result<(), MailError> {
    let bus = MailBus::new(config.max_mailboxes);
    let timeout = Timeout::millis(cli.timeout_ms);

    if let Command::Serve { period_ms } = cli.command {
        let module = DataModule::spawn(
            &bus,
            ModuleConfig {
                start_on: true,
                ..ModuleConfig::new(cli.mbx)
            },
            Heartbeat::new(period_ms),
        )?;
        let transport = attach(config, &cli.routes, &bus)?;
        info!(cmd = %module.cmd_addr(), period_ms, "serving heartbeat");
        let _ = signal.recv();
        info!(samples = module.stream().sample_counter(), "shutdown requested");
        module.shutdown();
        drop(transport);
        return Ok(());
    }

    let max_payload = config.max_msg_len().saturating_sub(HEADER_LEN);
    let mbx = bus.create(cli.mbx, MailboxConfig::new(8, max_payload))?;
    let _transport = attach(config, &cli.routes, &bus)?;

    match cli.command {
        Command::Serve { .. } => Ok(()),
        Command::Status { dest } => simple_command(&mbx, msg::GET_STATUS, dest, timeout),
        Command::On { dest } => simple_command(&mbx, msg::ON, dest, timeout),
        Command::Off { dest } => simple_command(&mbx, msg::OFF, dest, timeout),
        Command::Get { dest, at } => {
            let reply = mbx.call(msg::GET_DATA, dest, &[&at.to_ne_bytes()], timeout)?;
            println!(
                "{dest}: timestamp {} ms, {} byte sample {:02x?}",
                reply.payload_u32(0).unwrap_or(0),
                reply.payload.len(),
                &reply.payload[..]
            );
            Ok(())
        }
        Command::Watch { dest, period_ms } => watch(&bus, &mbx, dest, period_ms, timeout, signal),
    }
}

fn simple_command(mbx: &Mailbox, command: i8, dest: MailboxAddr, timeout: Timeout) -> Result<(), MailError> {
    let reply = mbx.call(command, dest, &[], timeout)?;
    println!("{dest}: {}", msg::name(reply.envelope.msg_type));
    Ok(())
}

fn watch(
    bus: &MailBus,
    mbx: &Mailbox,
    dest: MailboxAddr,
    period_ms: u32,
    timeout: Timeout,
    signal: &Receiver<()>,
) -> Result<(), MailError> {
    let data_addr = mbx.addr().with_local(mbx.addr().local().wrapping_add(1));
    let data = bus.create(data_addr, MailboxConfig::new(32, mbx.max_payload()))?;

    let reply = mbx.call(
        msg::GET_CONT_DATA,
        dest,
        &[&period_ms.to_ne_bytes(), &data_addr.raw().to_ne_bytes()],
        timeout,
    )?;
    info!(
        source = %dest,
        requested_ms = period_ms,
        achieved_ms = reply.payload_u32(0).unwrap_or(0),
        "subscribed"
    );

    loop {
        match signal.try_recv() {
            Ok(()) | Err(TryRecvError::Disconnected) => break,
            Err(TryRecvError::Empty) => {}
        }
        match data.receive(Timeout::millis(200)) {
            Ok(sample) => println!(
                "{}: timestamp {} ms, {} bytes",
                sample.envelope.src,
                sample.payload_u32(0).unwrap_or(0),
                sample.payload.len()
            ),
            Err(MailError::Timeout) => {}
            Err(e) => return Err(e),
        }
    }

    if let Err(e) = mbx.call(msg::STOP_CONT_DATA, dest, &[&data_addr.raw().to_ne_bytes()], timeout) {
        warn!(source = %dest, error = %e, "could not cancel subscription");
    }
    Ok(())
}
