//! `mailnet-router` – relays mailbox traffic between client processes.
//!
//! Runs until Ctrl-C or SIGTERM, then closes every connection and exits 0.
//! Exits non-zero when the listening socket cannot be set up.

use std::process::ExitCode;

use clap::Parser;
use mailnet_cli::{NetArgs, shutdown_signal, telemetry};
use mailnet_router::RouterServer;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "mailnet-router", version, about = "TCP mailbox router")]
struct Cli {
    #[command(flatten)]
    net: NetArgs,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = match cli.net.resolve() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("mailnet-router: {e}");
            return ExitCode::FAILURE;
        }
    };
    let _guard = telemetry::init_tracing("mailnet-router", &config.log_level);

    let router = match RouterServer::start(config.router_config()) {
        Ok(router) => router,
        Err(e) => {
            error!(bind = %config.socket_addr(), error = %e, "could not start router");
            return ExitCode::FAILURE;
        }
    };
    info!(
        listen = %router.local_addr(),
        max_msg_kb = config.max_msg_kb,
        max_connections = config.max_connections,
        watchdog_ms = config.watchdog_interval_ms,
        send_timeout_ms = config.send_timeout_ms,
        "router running"
    );

    match shutdown_signal() {
        Ok(signal) => {
            let _ = signal.recv();
            info!("shutdown requested");
        }
        Err(e) => {
            warn!(error = %e, "failed to install Ctrl-C handler");
            router.shutdown();
            return ExitCode::FAILURE;
        }
    }

    router.shutdown();
    ExitCode::SUCCESS
}
