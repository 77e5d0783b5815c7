//! Fixed-target tunnel inbound.

use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::net::TcpStream;

use super::{Inbound, InboundConnection, InboundError, Reply};
use crate::adapter::Destination;
use crate::config::TunnelConfig;
use crate::error::ConfigError;
use crate::proxy::ConnMetadata;

/// Forwards every accepted connection to one destination.
#[derive(Debug, Clone)]
pub struct TunnelInbound {
    tag: String,
    target: Destination,
}

impl TunnelInbound {
    pub fn new(tag: impl Into<String>, target: Destination) -> Self {
        Self {
            tag: tag.into(),
            target,
        }
    }

    pub fn from_config(config: &TunnelConfig) -> Result<Self, ConfigError> {
        let target = Destination::parse(&config.target).ok_or_else(|| {
            ConfigError::InvalidInbound(format!(
                "tunnel target {:?} is not host:port",
                config.target
            ))
        })?;
        let tag = config
            .tag
            .clone()
            .unwrap_or_else(|| format!("tunnel-{}", config.listen.port()));
        Ok(Self::new(tag, target))
    }

    pub fn target(&self) -> &Destination {
        &self.target
    }
}

#[async_trait]
impl Inbound for TunnelInbound {
    fn tag(&self) -> &str {
        &self.tag
    }

    async fn handshake(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
    ) -> Result<InboundConnection, InboundError> {
        Ok(InboundConnection {
            metadata: ConnMetadata::new(peer, &self.target, self.tag.clone()),
            stream: Box::new(stream),
            reply: Reply::None,
        })
    }
}
