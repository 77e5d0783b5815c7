//! Trojan outbound.
//!
//! Request layout, sent once after the transport is up:
//!
//! ```text
//! hex(SHA224(password)) CRLF CMD ATYP DST.ADDR DST.PORT CRLF
//! ```

use std::time::Duration;

use async_trait::async_trait;
use rustls::pki_types::ServerName;
use sha2::{Digest, Sha224};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::debug;

use super::socks5::CMD_CONNECT;
use super::{
    build_client_config, dial_tcp, AdapterContext, AdapterError, BoxedStream, Destination,
    ProtocolAdapter,
};
use crate::config::ProxyConfig;
use crate::error::ConfigError;

pub(super) const KIND: &str = "trojan";

const CRLF: &[u8] = b"\r\n";

#[derive(Clone)]
pub struct TrojanAdapter {
    server: String,
    port: u16,
    /// Hex SHA-224 of the password (56 bytes).
    password_hash: String,
    tls: Option<(TlsConnector, ServerName<'static>)>,
    connect_timeout: Duration,
}

impl std::fmt::Debug for TrojanAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrojanAdapter")
            .field("server", &self.server)
            .field("port", &self.port)
            .field("sni", &self.tls.as_ref().map(|(_, name)| name))
            .finish()
    }
}

impl TrojanAdapter {
    /// Plain-TCP Trojan (no TLS), mostly useful behind another tunnel.
    pub fn plain(
        server: impl Into<String>,
        port: u16,
        password: &str,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            server: server.into(),
            port,
            password_hash: password_hash(password),
            tls: None,
            connect_timeout,
        }
    }

    pub(super) fn from_config(
        config: &ProxyConfig,
        ctx: &AdapterContext,
    ) -> Result<Self, ConfigError> {
        let (server, port) = config.server_addr()?;
        let invalid = |reason: String| ConfigError::InvalidNode {
            node: config.name.clone(),
            reason,
        };

        let password = config
            .password
            .as_deref()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| invalid("trojan needs a password".to_string()))?;

        let mut adapter = Self::plain(server.clone(), port, password, ctx.connect_timeout);

        if config.tls.unwrap_or(true) {
            let sni = config.sni.clone().unwrap_or(server);
            let sni = sni.trim_start_matches('[').trim_end_matches(']').to_string();
            let server_name =
                ServerName::try_from(sni).map_err(|e| invalid(format!("invalid sni: {e}")))?;
            let client_config = build_client_config(config.skip_cert_verify)
                .map_err(|e| invalid(format!("tls setup failed: {e}")))?;
            adapter.tls = Some((TlsConnector::from(client_config), server_name));
        }

        Ok(adapter)
    }

    /// Encode the request header for `destination`.
    pub(crate) fn request_header(
        &self,
        destination: &Destination,
    ) -> Result<Vec<u8>, AdapterError> {
        let mut header = Vec::with_capacity(56 + 2 + 1 + 1 + 256 + 2 + 2);
        header.extend_from_slice(self.password_hash.as_bytes());
        header.extend_from_slice(CRLF);
        header.push(CMD_CONNECT);
        destination.write_socks_addr(&mut header)?;
        header.extend_from_slice(CRLF);
        Ok(header)
    }

    async fn send_header<S>(
        &self,
        stream: &mut S,
        destination: &Destination,
    ) -> Result<(), AdapterError>
    where
        S: AsyncWrite + Unpin,
    {
        let header = self.request_header(destination)?;
        stream.write_all(&header).await?;
        stream.flush().await?;
        Ok(())
    }

    fn timeout_error(&self) -> AdapterError {
        AdapterError::Timeout {
            target: format!("{}:{}", self.server, self.port),
            after: self.connect_timeout,
        }
    }
}

#[async_trait]
impl ProtocolAdapter for TrojanAdapter {
    fn kind(&self) -> &'static str {
        KIND
    }

    async fn connect(&self, destination: &Destination) -> Result<BoxedStream, AdapterError> {
        let tcp = dial_tcp(&self.server, self.port, self.connect_timeout).await?;

        match &self.tls {
            Some((connector, server_name)) => {
                let mut tls = match timeout(
                    self.connect_timeout,
                    connector.connect(server_name.clone(), tcp),
                )
                .await
                {
                    Ok(Ok(tls)) => tls,
                    Ok(Err(e)) => return Err(AdapterError::Protocol(format!("tls handshake: {e}"))),
                    Err(_) => return Err(self.timeout_error()),
                };
                self.send_header(&mut tls, destination).await?;
                debug!(
                    upstream = %self.server,
                    destination = %destination,
                    "Trojan TLS tunnel established"
                );
                Ok(Box::new(tls))
            }
            None => {
                let mut tcp = tcp;
                self.send_header(&mut tcp, destination).await?;
                debug!(
                    upstream = %self.server,
                    destination = %destination,
                    "Trojan tunnel established"
                );
                Ok(Box::new(tcp))
            }
        }
    }
}

/// Hex-encoded SHA-224 digest of `password`.
pub fn password_hash(password: &str) -> String {
    hex::encode(Sha224::digest(password.as_bytes()))
}
