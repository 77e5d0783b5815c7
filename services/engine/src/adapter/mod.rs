//! Outbound protocol adapters.
//!
//! An adapter encodes one protocol's client handshake over a raw byte
//! stream. Every adapter sits behind [`ProtocolAdapter`] and is built from
//! its config by a factory looked up in [`AdapterRegistry`] by protocol
//! kind, so adding a protocol never touches the router or dispatcher.
//!
//! ## Built-in kinds
//!
//! | kind     | transport |
//! |----------|-----------|
//! | `direct` | TCP to the destination |
//! | `reject` | refuses every connection |
//! | `socks5` | SOCKS5 CONNECT through an upstream |
//! | `http`   | HTTP/1.1 CONNECT through an upstream |
//! | `trojan` | Trojan request over TLS (or plain TCP) |

mod dial;
mod direct;
pub(crate) mod http;
mod reject;
pub(crate) mod socks5;
mod tls;
mod trojan;

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::config::ProxyConfig;
use crate::error::ConfigError;

pub use dial::dial_tcp;
pub(crate) use http::parse_status;
pub use direct::DirectAdapter;
pub use http::HttpConnectAdapter;
pub use reject::RejectAdapter;
pub use socks5::Socks5Adapter;
pub use tls::{build_client_config, NoVerify};
pub use trojan::TrojanAdapter;

/// A bidirectional byte stream.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// Type-erased stream returned by adapters.
pub type BoxedStream = Box<dyn AsyncStream>;

/// Destination host: a literal address or a domain name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    Ip(IpAddr),
    Domain(String),
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Ip(IpAddr::V6(v6)) => write!(f, "[{}]", v6),
            Address::Ip(ip) => write!(f, "{}", ip),
            Address::Domain(d) => write!(f, "{}", d),
        }
    }
}

/// Where a connection should be delivered.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    pub host: Address,
    pub port: u16,
}

impl Destination {
    pub fn new(host: Address, port: u16) -> Self {
        Self { host, port }
    }

    /// Build from a host string, treating literal IPs as addresses.
    pub fn from_host(host: &str, port: u16) -> Self {
        let trimmed = host.trim_start_matches('[').trim_end_matches(']');
        let host = match trimmed.parse::<IpAddr>() {
            Ok(ip) => Address::Ip(ip),
            Err(_) => Address::Domain(host.to_string()),
        };
        Self { host, port }
    }

    /// Parse `host:port` (IPv6 hosts in brackets).
    pub fn parse(s: &str) -> Option<Self> {
        let (host, port) = s.rsplit_once(':')?;
        let port = port.parse().ok()?;
        if host.is_empty() {
            return None;
        }
        Some(Self::from_host(host, port))
    }

    /// Append the SOCKS-style address (`ATYP`, address, port) used by both
    /// SOCKS5 and Trojan requests.
    pub fn write_socks_addr(&self, buf: &mut Vec<u8>) -> Result<(), AdapterError> {
        match &self.host {
            Address::Ip(IpAddr::V4(v4)) => {
                buf.push(0x01);
                buf.extend_from_slice(&v4.octets());
            }
            Address::Ip(IpAddr::V6(v6)) => {
                buf.push(0x04);
                buf.extend_from_slice(&v6.octets());
            }
            Address::Domain(domain) => {
                let len = u8::try_from(domain.len()).map_err(|_| {
                    AdapterError::Protocol(format!("domain too long: {} bytes", domain.len()))
                })?;
                buf.push(0x03);
                buf.push(len);
                buf.extend_from_slice(domain.as_bytes());
            }
        }
        buf.extend_from_slice(&self.port.to_be_bytes());
        Ok(())
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Per-attempt adapter failures.
#[derive(Debug, Error)]
pub enum AdapterError {
    /// Transport to the server (or destination) could not be established.
    #[error("dial {target} failed: {source}")]
    Dial {
        target: String,
        #[source]
        source: io::Error,
    },

    #[error("dial {target} timed out after {after:?}")]
    Timeout { target: String, after: Duration },

    /// The server answered but the handshake failed.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The node refuses connections by definition.
    #[error("connection rejected by policy")]
    Rejected,
}

impl AdapterError {
    /// Whether this failure says something about node health.
    pub fn is_node_failure(&self) -> bool {
        !matches!(self, AdapterError::Rejected)
    }
}

impl From<io::Error> for AdapterError {
    fn from(err: io::Error) -> Self {
        AdapterError::Protocol(err.to_string())
    }
}

/// One outbound protocol.
#[async_trait]
pub trait ProtocolAdapter: Send + Sync + fmt::Debug {
    /// Protocol kind this adapter was registered under.
    fn kind(&self) -> &'static str;

    /// Open a stream that delivers bytes to `destination`.
    async fn connect(&self, destination: &Destination) -> Result<BoxedStream, AdapterError>;
}

/// Settings shared by every adapter built from one config.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdapterContext {
    pub connect_timeout: Duration,
}

impl Default for AdapterContext {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(crate::config::DEFAULT_CONNECT_TIMEOUT_MS),
        }
    }
}

/// Builds an adapter from a node definition.
pub type AdapterFactory = Arc<
    dyn Fn(&ProxyConfig, &AdapterContext) -> Result<Arc<dyn ProtocolAdapter>, ConfigError>
        + Send
        + Sync,
>;

/// Protocol-kind keyed adapter factories.
#[derive(Clone)]
pub struct AdapterRegistry {
    factories: HashMap<String, AdapterFactory>,
}

impl AdapterRegistry {
    /// An empty registry.
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// A registry with every built-in protocol.
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register(direct::KIND, |_, ctx| {
            Ok(Arc::new(DirectAdapter::new(ctx.connect_timeout)) as Arc<dyn ProtocolAdapter>)
        });
        registry.register(reject::KIND, |_, _| {
            Ok(Arc::new(RejectAdapter) as Arc<dyn ProtocolAdapter>)
        });
        registry.register(socks5::KIND, |config, ctx| {
            Ok(Arc::new(Socks5Adapter::from_config(config, ctx)?) as Arc<dyn ProtocolAdapter>)
        });
        registry.register(http::KIND, |config, ctx| {
            Ok(Arc::new(HttpConnectAdapter::from_config(config, ctx)?)
                as Arc<dyn ProtocolAdapter>)
        });
        registry.register(trojan::KIND, |config, ctx| {
            Ok(Arc::new(TrojanAdapter::from_config(config, ctx)?) as Arc<dyn ProtocolAdapter>)
        });
        registry
    }

    /// Register (or replace) the factory for `kind`.
    pub fn register<F>(&mut self, kind: &str, factory: F)
    where
        F: Fn(&ProxyConfig, &AdapterContext) -> Result<Arc<dyn ProtocolAdapter>, ConfigError>
            + Send
            + Sync
            + 'static,
    {
        self.factories
            .insert(kind.to_ascii_lowercase(), Arc::new(factory));
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.factories.contains_key(&kind.to_ascii_lowercase())
    }

    /// Build the adapter for one node definition.
    pub fn build(
        &self,
        config: &ProxyConfig,
        ctx: &AdapterContext,
    ) -> Result<Arc<dyn ProtocolAdapter>, ConfigError> {
        let factory = self
            .factories
            .get(&config.kind.to_ascii_lowercase())
            .ok_or_else(|| ConfigError::UnknownProtocol {
                node: config.name.clone(),
                kind: config.kind.clone(),
            })?;
        factory(config, ctx)
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<_> = self.factories.keys().collect();
        kinds.sort();
        f.debug_struct("AdapterRegistry").field("kinds", &kinds).finish()
    }
}
