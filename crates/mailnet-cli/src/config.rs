//! Settings file – reads/writes `~/.mailnet/config.toml`.
//!
//! Precedence, lowest first: built-in defaults, the file, `MAILNET_*`
//! environment variables, command-line flags.

use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use mailnet_router::{ClientConfig, RouterConfig};
use mailnet_split::{LinkConfig, ReassemblyConfig};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config at {path}: {source}")]
    Read { path: PathBuf, source: std::io::Error },
    #[error("failed to parse config at {path}: {source}")]
    Parse { path: PathBuf, source: toml::de::Error },
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("failed to write config at {path}: {source}")]
    Write { path: PathBuf, source: std::io::Error },
}

/// Settings shared by the router and client binaries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Address the router listens on, or the router a client dials.
    #[serde(default = "default_bind_ip")]
    pub bind_ip: IpAddr,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Largest message in KiB, header included.
    #[serde(default = "default_max_msg_kb")]
    pub max_msg_kb: usize,

    /// `tracing` filter used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    #[serde(default = "default_max_routes")]
    pub max_routes: usize,

    /// `0` disables the watchdog.
    #[serde(default = "default_watchdog_interval_ms")]
    pub watchdog_interval_ms: u64,

    /// Longest a frame write to one peer may block before the router drops
    /// that peer.
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,

    #[serde(default = "default_max_mailboxes")]
    pub max_mailboxes: usize,

    /// Datagram transport only.
    #[serde(default = "default_fragment_size")]
    pub fragment_size: usize,

    /// Datagram transport only.
    #[serde(default = "default_reassembly_timeout_ms")]
    pub reassembly_timeout_ms: u64,
}

fn default_bind_ip() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}
fn default_port() -> u16 {
    2000
}
fn default_max_msg_kb() -> usize {
    64
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_max_connections() -> usize {
    32
}
fn default_max_routes() -> usize {
    256
}
fn default_watchdog_interval_ms() -> u64 {
    5000
}
fn default_send_timeout_ms() -> u64 {
    2000
}
fn default_max_mailboxes() -> usize {
    256
}
fn default_fragment_size() -> usize {
    1400
}
fn default_reassembly_timeout_ms() -> u64 {
    1000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_ip: default_bind_ip(),
            port: default_port(),
            max_msg_kb: default_max_msg_kb(),
            log_level: default_log_level(),
            max_connections: default_max_connections(),
            max_routes: default_max_routes(),
            watchdog_interval_ms: default_watchdog_interval_ms(),
            send_timeout_ms: default_send_timeout_ms(),
            max_mailboxes: default_max_mailboxes(),
            fragment_size: default_fragment_size(),
            reassembly_timeout_ms: default_reassembly_timeout_ms(),
        }
    }
}

impl Config {
    pub fn max_msg_len(&self) -> usize {
        self.max_msg_kb.saturating_mul(1024)
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_ip, self.port)
    }

    /// Where a client should dial: the configured address, with an
    /// unspecified IP replaced by loopback.
    pub fn router_addr(&self) -> SocketAddr {
        let ip = match self.bind_ip {
            IpAddr::V4(ip) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpAddr::V6(ip) if ip.is_unspecified() => IpAddr::V6(std::net::Ipv6Addr::LOCALHOST),
            ip => ip,
        };
        SocketAddr::new(ip, self.port)
    }

    pub fn router_config(&self) -> RouterConfig {
        RouterConfig {
            bind: self.socket_addr(),
            max_msg_len: self.max_msg_len(),
            max_connections: self.max_connections,
            max_routes: self.max_routes,
            watchdog_interval: (self.watchdog_interval_ms > 0)
                .then(|| Duration::from_millis(self.watchdog_interval_ms)),
            send_timeout: Duration::from_millis(self.send_timeout_ms),
        }
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            max_msg_len: self.max_msg_len(),
            ..ClientConfig::new(self.router_addr())
        }
    }

    pub fn link_config(&self) -> LinkConfig {
        LinkConfig {
            max_fragment: self.fragment_size,
            reassembly: ReassemblyConfig {
                timeout: Duration::from_millis(self.reassembly_timeout_ms),
                max_message: self.max_msg_len(),
                ..ReassemblyConfig::default()
            },
            max_routes: self.max_routes,
            ..LinkConfig::new(self.socket_addr())
        }
    }
}

/// `~/.mailnet/config.toml`, or `None` when there is no home directory.
pub fn config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| config_path_for_home(&home))
}

pub(crate) fn config_path_for_home(home: &Path) -> PathBuf {
    home.join(".mailnet").join("config.toml")
}

/// Load `explicit`, or the default path when `None`, then apply
/// environment overrides.  A missing file yields the defaults.
pub fn load(explicit: Option<&Path>) -> Result<Config, ConfigError> {
    let from_file = match explicit.map(Path::to_path_buf).or_else(config_path) {
        Some(path) => load_from(&path)?,
        None => None,
    };
    let mut cfg = from_file.unwrap_or_default();
    apply_env_overrides(&mut cfg);
    Ok(cfg)
}

/// Load the file at `path`.  Returns `None` if it does not exist.
pub fn load_from(path: &Path) -> Result<Option<Config>, ConfigError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let cfg = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(Some(cfg))
}

/// Apply `MAILNET_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `MAILNET_IP` | `bind_ip` |
/// | `MAILNET_PORT` | `port` |
/// | `MAILNET_MAX_MSG_KB` | `max_msg_kb` |
/// | `MAILNET_LOG` | `log_level` |
///
/// Values that do not parse are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    apply_overrides(cfg, |key| std::env::var(key).ok());
}

pub(crate) fn apply_overrides(cfg: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(ip) = var("MAILNET_IP").and_then(|v| v.parse::<IpAddr>().ok()) {
        cfg.bind_ip = ip;
    }
    if let Some(port) = var("MAILNET_PORT").and_then(|v| v.parse::<u16>().ok()) {
        cfg.port = port;
    }
    if let Some(kb) = var("MAILNET_MAX_MSG_KB").and_then(|v| v.parse::<usize>().ok()) {
        cfg.max_msg_kb = kb;
    }
    if let Some(level) = var("MAILNET_LOG").filter(|v| !v.trim().is_empty()) {
        cfg.log_level = level;
    }
}

/// Write `cfg` to `path`, creating the parent directory.
pub fn save_to(cfg: &Config, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| ConfigError::Write {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    let raw = toml::to_string_pretty(cfg)?;
    fs::write(path, raw).map_err(|source| ConfigError::Write {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn roundtrip_default_config() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(dir.path());

        save_to(&Config::default(), &path).expect("save");
        let loaded = load_from(&path).expect("load ok").expect("some");
        assert_eq!(loaded, Config::default());
        assert_eq!(loaded.port, 2000);
        assert_eq!(loaded.max_msg_kb, 64);
        assert_eq!(loaded.fragment_size, 1400);
    }

    #[test]
    fn partial_file_keeps_defaults_for_missing_fields() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        fs::write(&path, "port = 2100\nlog_level = \"debug\"\n").unwrap();

        let loaded = load_from(&path).unwrap().unwrap();
        assert_eq!(loaded.port, 2100);
        assert_eq!(loaded.log_level, "debug");
        assert_eq!(loaded.max_connections, 32);
        assert_eq!(loaded.watchdog_interval_ms, 5000);
        assert_eq!(loaded.send_timeout_ms, 2000);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        fs::write(&path, "port = \"lots\"\n").unwrap();
        assert!(matches!(load_from(&path), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn load_from_returns_none_when_missing() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(dir.path());
        assert!(load_from(&path).expect("no error").is_none());
    }

    #[test]
    fn config_path_points_to_mailnet_dir() {
        let p = config_path_for_home(Path::new("/home/testuser"));
        assert_eq!(p, PathBuf::from("/home/testuser/.mailnet/config.toml"));
    }

    #[test]
    fn env_overrides_replace_file_values() {
        let mut cfg = Config::default();
        apply_overrides(
            &mut cfg,
            vars(&[
                ("MAILNET_IP", "10.0.0.7"),
                ("MAILNET_PORT", "2300"),
                ("MAILNET_MAX_MSG_KB", "128"),
                ("MAILNET_LOG", "mailnet_router=trace"),
            ]),
        );
        assert_eq!(cfg.bind_ip, "10.0.0.7".parse::<IpAddr>().unwrap());
        assert_eq!(cfg.port, 2300);
        assert_eq!(cfg.max_msg_kb, 128);
        assert_eq!(cfg.log_level, "mailnet_router=trace");
    }

    #[test]
    fn invalid_env_values_are_ignored() {
        let mut cfg = Config::default();
        apply_overrides(
            &mut cfg,
            vars(&[("MAILNET_PORT", "not-a-port"), ("MAILNET_IP", "nowhere"), ("MAILNET_LOG", "  ")]),
        );
        assert_eq!(cfg, Config::default());
    }

    #[test]
    fn derived_library_configs() {
        let cfg = Config {
            port: 0,
            max_msg_kb: 4,
            watchdog_interval_ms: 0,
            send_timeout_ms: 300,
            reassembly_timeout_ms: 250,
            ..Config::default()
        };
        let router = cfg.router_config();
        assert_eq!(router.max_msg_len, 4096);
        assert!(router.watchdog_interval.is_none());
        assert_eq!(router.send_timeout, Duration::from_millis(300));

        let client = cfg.client_config();
        assert!(client.router.ip().is_loopback());
        assert_eq!(client.max_msg_len, 4096);

        let link = cfg.link_config();
        assert_eq!(link.max_fragment, 1400);
        assert_eq!(link.reassembly.timeout, Duration::from_millis(250));
        assert_eq!(link.reassembly.max_message, 4096);
    }
}
