//! Engine configuration.
//!
//! Two layers:
//! - [`EngineConfig`]: the parsed routing configuration (proxies, groups,
//!   rules, inbound, dispatcher). Read from TOML with kebab-case keys and
//!   replaced wholesale on reload.
//! - [`Cli`]: process-level settings (home directory, config source, log
//!   level) from command line flags with environment fallbacks.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};
use switchyard_networking::IpCidr;

use crate::error::ConfigError;

/// Default health-check probe target.
pub const DEFAULT_PROBE_URL: &str = "http://www.gstatic.com/generate_204";

/// Default health-check interval (seconds).
pub const DEFAULT_PROBE_INTERVAL_SECS: u64 = 300;

/// Default health-check timeout (milliseconds).
pub const DEFAULT_PROBE_TIMEOUT_MS: u64 = 5000;

/// Default outbound connect timeout (milliseconds).
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5000;

/// Default number of re-dials after the first failed attempt.
pub const DEFAULT_MAX_DIAL_RETRIES: u32 = 2;

/// Default maximum concurrent connections per listener.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10000;

/// Default inbound handshake timeout (milliseconds).
pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 10000;

/// Parsed engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct EngineConfig {
    #[serde(default)]
    pub inbound: InboundConfig,

    #[serde(default)]
    pub dispatcher: DispatcherConfig,

    #[serde(default)]
    pub proxies: Vec<ProxyConfig>,

    #[serde(default)]
    pub proxy_groups: Vec<ProxyGroupConfig>,

    /// Rules in `KIND,VALUE,TARGET[,no-resolve]` form, evaluated in order.
    #[serde(default)]
    pub rules: Vec<String>,

    /// Static GEOIP table.
    #[serde(default)]
    pub geoip: Vec<GeoIpEntry>,
}

impl EngineConfig {
    /// Parse a TOML document.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Parse raw bytes as UTF-8 TOML.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ConfigError> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| ConfigError::Parse(format!("config is not valid UTF-8: {e}")))?;
        Self::from_toml(text)
    }
}

/// Inbound listeners.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct InboundConfig {
    /// Address the listeners bind to.
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,

    /// Port of the mixed SOCKS5 / HTTP listener. `0` picks an ephemeral port.
    #[serde(default)]
    pub mixed_port: Option<u16>,

    /// Credentials required by the mixed listener.
    #[serde(default)]
    pub authentication: Option<Credentials>,

    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,

    /// Fixed-target tunnels.
    #[serde(default)]
    pub tunnels: Vec<TunnelConfig>,
}

impl InboundConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

impl Default for InboundConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            mixed_port: None,
            authentication: None,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT_MS,
            tunnels: Vec::new(),
        }
    }
}

/// Username / password pair.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// A listener that forwards every connection to one destination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct TunnelConfig {
    /// Inbound tag used by `IN-TAG` rules. Defaults to `tunnel-<port>`.
    #[serde(default)]
    pub tag: Option<String>,
    pub listen: SocketAddr,
    /// `host:port` every connection is forwarded to.
    pub target: String,
}

/// Dispatch pipeline settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct DispatcherConfig {
    /// Additional nodes tried after the first failed dial.
    #[serde(default = "default_max_dial_retries")]
    pub max_dial_retries: u32,

    /// Outbound connect timeout for every adapter.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Close a relayed session after this many seconds without traffic.
    #[serde(default)]
    pub idle_timeout_secs: Option<u64>,
}

impl DispatcherConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_secs.map(Duration::from_secs)
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_dial_retries: DEFAULT_MAX_DIAL_RETRIES,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            idle_timeout_secs: None,
        }
    }
}

/// One outbound node definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ProxyConfig {
    pub name: String,

    /// Protocol kind (`direct`, `reject`, `socks5`, `http`, `trojan`, ...).
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default)]
    pub server: Option<String>,

    #[serde(default)]
    pub port: Option<u16>,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    /// Wrap the connection in TLS. Trojan defaults to on.
    #[serde(default)]
    pub tls: Option<bool>,

    /// TLS server name; defaults to `server`.
    #[serde(default)]
    pub sni: Option<String>,

    #[serde(default)]
    pub skip_cert_verify: bool,
}

impl ProxyConfig {
    /// `server:port`, or an error naming the missing field.
    pub fn server_addr(&self) -> Result<(String, u16), ConfigError> {
        let server = self
            .server
            .clone()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ConfigError::InvalidNode {
                node: self.name.clone(),
                reason: "missing server".to_string(),
            })?;
        let port = self.port.ok_or_else(|| ConfigError::InvalidNode {
            node: self.name.clone(),
            reason: "missing port".to_string(),
        })?;
        Ok((server, port))
    }
}

/// Group selection policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Policy {
    /// Manual selection; defaults to the first member.
    Select,
    /// Lowest measured latency among alive members.
    UrlTest,
    /// First alive member in list order.
    Fallback,
    /// Rotate among members not known to be dead.
    #[serde(alias = "load-balance")]
    RoundRobin,
}

impl std::fmt::Display for Policy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Policy::Select => write!(f, "select"),
            Policy::UrlTest => write!(f, "url-test"),
            Policy::Fallback => write!(f, "fallback"),
            Policy::RoundRobin => write!(f, "round-robin"),
        }
    }
}

/// One proxy group definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ProxyGroupConfig {
    pub name: String,

    #[serde(rename = "type")]
    pub policy: Policy,

    /// Member node names, in priority order.
    pub proxies: Vec<String>,

    /// Health-check probe URL (`http://` or `https://`).
    #[serde(default = "default_probe_url")]
    pub url: String,

    /// Seconds between probe rounds; `0` disables periodic probing.
    #[serde(default = "default_probe_interval")]
    pub interval: u64,

    /// Per-probe timeout in milliseconds.
    #[serde(default = "default_probe_timeout")]
    pub timeout: u64,

    /// Response statuses that count as alive. Empty accepts any status.
    #[serde(default)]
    pub expected_status: Vec<u16>,
}

/// Static GEOIP table entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct GeoIpEntry {
    pub cidr: IpCidr,
    pub country: String,
}

fn default_bind_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

fn default_max_connections() -> usize {
    DEFAULT_MAX_CONNECTIONS
}

fn default_handshake_timeout_ms() -> u64 {
    DEFAULT_HANDSHAKE_TIMEOUT_MS
}

fn default_max_dial_retries() -> u32 {
    DEFAULT_MAX_DIAL_RETRIES
}

fn default_connect_timeout_ms() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_MS
}

fn default_probe_url() -> String {
    DEFAULT_PROBE_URL.to_string()
}

fn default_probe_interval() -> u64 {
    DEFAULT_PROBE_INTERVAL_SECS
}

fn default_probe_timeout() -> u64 {
    DEFAULT_PROBE_TIMEOUT_MS
}

/// Process configuration.
#[derive(Debug, Clone, Parser)]
#[command(name = "switchyard", version, about = "Rule-based proxy routing engine")]
pub struct Cli {
    /// Home directory holding the persisted config.
    #[arg(long, env = "SWITCHYARD_HOME", default_value = ".")]
    pub home: PathBuf,

    /// Config source: a file path (relative to home), base64 text or raw TOML.
    #[arg(long, short, env = "SWITCHYARD_CONFIG", default_value = "config.toml")]
    pub config: String,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "SWITCHYARD_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Validate the config and exit.
    #[arg(long)]
    pub check: bool,

    /// Print engine events to stdout as JSON lines.
    #[arg(long)]
    pub events: bool,
}
