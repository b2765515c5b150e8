//! `mailnet-cli` – shared plumbing for the `mailnet-router` and
//! `mailnet-client` binaries.
//!
//! - [`config`] – `~/.mailnet/config.toml` plus `MAILNET_*` overrides.
//! - [`telemetry`] – `tracing` subscriber with optional OTLP export.
//! - [`heartbeat`] – a demo [`DataSource`][mailnet_stream::DataSource] the
//!   client can serve.
//! - [`NetArgs`] – the `-i -p -m -l` flags both binaries accept.

pub mod config;
pub mod heartbeat;
pub mod telemetry;

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver};

use clap::Args;

use crate::config::{Config, ConfigError};

/// Network flags common to both binaries.  Each one overrides the config
/// file and the environment.
#[derive(Debug, Clone, Default, Args)]
pub struct NetArgs {
    /// IP address to bind (router) or dial (client)
    #[arg(short = 'i', long = "ip")]
    pub ip: Option<IpAddr>,

    /// TCP/UDP port
    #[arg(short = 'p', long = "port")]
    pub port: Option<u16>,

    /// Largest message in KiB
    #[arg(short = 'm', long = "max-msg-kb")]
    pub max_msg_kb: Option<usize>,

    /// Log filter, e.g. `info` or `mailnet_router=debug`
    #[arg(short = 'l', long = "log-level")]
    pub log_level: Option<String>,

    /// Config file (default `~/.mailnet/config.toml`)
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl NetArgs {
    /// Load the config file and environment, then apply these flags.
    pub fn resolve(&self) -> Result<Config, ConfigError> {
        let mut cfg = config::load(self.config.as_deref())?;
        self.apply(&mut cfg);
        Ok(cfg)
    }

    pub fn apply(&self, cfg: &mut Config) {
        if let Some(ip) = self.ip {
            cfg.bind_ip = ip;
        }
        if let Some(port) = self.port {
            cfg.port = port;
        }
        if let Some(kb) = self.max_msg_kb {
            cfg.max_msg_kb = kb;
        }
        if let Some(level) = &self.log_level {
            cfg.log_level = level.clone();
        }
    }
}

/// Channel that yields once on Ctrl-C or SIGTERM.
pub fn shutdown_signal() -> Result<Receiver<()>, ctrlc::Error> {
    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })?;
    Ok(rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        net: NetArgs,
    }

    #[test]
    fn short_flags_override_config() {
        let cli = TestCli::parse_from(["test", "-i", "127.0.0.1", "-p", "2500", "-m", "8", "-l", "debug"]);
        let mut cfg = Config::default();
        cli.net.apply(&mut cfg);
        assert_eq!(cfg.bind_ip, "127.0.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(cfg.port, 2500);
        assert_eq!(cfg.max_msg_len(), 8 * 1024);
        assert_eq!(cfg.log_level, "debug");
    }

    #[test]
    fn absent_flags_leave_config_alone() {
        let cli = TestCli::parse_from(["test"]);
        let mut cfg = Config::default();
        cli.net.apply(&mut cfg);
        assert_eq!(cfg, Config::default());
    }

    #[test]
    fn explicit_config_file_is_used() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("router.toml");
        std::fs::write(&path, "port = 2700\nmax_routes = 12\n").unwrap();

        let cli = TestCli::parse_from(["test", "--config", path.to_str().unwrap(), "-p", "2800"]);
        let cfg = cli.net.resolve().unwrap();
        assert_eq!(cfg.max_routes, 12);
        assert_eq!(cfg.port, 2800);
    }

    #[test]
    fn bad_port_is_rejected_by_the_parser() {
        assert!(TestCli::try_parse_from(["test", "-p", "70000"]).is_err());
    }
}
