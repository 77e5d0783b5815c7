//! HTTP/1.1 CONNECT outbound.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::debug;

use super::{dial_tcp, AdapterContext, AdapterError, BoxedStream, Destination, ProtocolAdapter};
use crate::config::ProxyConfig;
use crate::error::ConfigError;

pub(super) const KIND: &str = "http";

/// Upper bound on an HTTP request or response head.
const MAX_HTTP_HEAD: usize = 8192;

#[derive(Debug, Clone)]
pub struct HttpConnectAdapter {
    server: String,
    port: u16,
    /// Precomputed `Proxy-Authorization` value.
    authorization: Option<String>,
    connect_timeout: Duration,
}

impl HttpConnectAdapter {
    pub fn new(server: impl Into<String>, port: u16, connect_timeout: Duration) -> Self {
        Self {
            server: server.into(),
            port,
            authorization: None,
            connect_timeout,
        }
    }

    pub fn with_basic_auth(mut self, username: &str, password: &str) -> Self {
        let token =
            base64::engine::general_purpose::STANDARD.encode(format!("{username}:{password}"));
        self.authorization = Some(format!("Basic {token}"));
        self
    }

    pub(super) fn from_config(
        config: &ProxyConfig,
        ctx: &AdapterContext,
    ) -> Result<Self, ConfigError> {
        let (server, port) = config.server_addr()?;
        let adapter = Self::new(server, port, ctx.connect_timeout);
        Ok(match (&config.username, &config.password) {
            (Some(user), Some(pass)) => adapter.with_basic_auth(user, pass),
            (None, None) => adapter,
            _ => {
                return Err(ConfigError::InvalidNode {
                    node: config.name.clone(),
                    reason: "http needs both username and password".to_string(),
                })
            }
        })
    }

    async fn handshake<S>(
        &self,
        stream: &mut S,
        destination: &Destination,
    ) -> Result<(), AdapterError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let authority = destination.to_string();
        let mut request = format!("CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n");
        if let Some(auth) = &self.authorization {
            request.push_str(&format!("Proxy-Authorization: {auth}\r\n"));
        }
        request.push_str("\r\n");
        stream.write_all(request.as_bytes()).await?;

        let head = read_http_head(stream).await?;
        let status = parse_status(&head)?;
        if !(200..300).contains(&status) {
            return Err(AdapterError::Protocol(format!(
                "upstream CONNECT answered {}",
                status
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ProtocolAdapter for HttpConnectAdapter {
    fn kind(&self) -> &'static str {
        KIND
    }

    async fn connect(&self, destination: &Destination) -> Result<BoxedStream, AdapterError> {
        let mut stream = dial_tcp(&self.server, self.port, self.connect_timeout).await?;

        match timeout(self.connect_timeout, self.handshake(&mut stream, destination)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(AdapterError::Timeout {
                    target: format!("{}:{}", self.server, self.port),
                    after: self.connect_timeout,
                })
            }
        }

        debug!(
            upstream = %self.server,
            destination = %destination,
            "HTTP CONNECT tunnel established"
        );
        Ok(Box::new(stream))
    }
}

/// Read up to and including the blank line ending an HTTP head.
///
/// Reads byte by byte so no tunnel payload is consumed.
pub(crate) async fn read_http_head<S>(stream: &mut S) -> Result<String, AdapterError>
where
    S: AsyncRead + Unpin,
{
    let mut head = Vec::with_capacity(256);
    loop {
        let byte = stream.read_u8().await?;
        head.push(byte);
        if head.ends_with(b"\r\n\r\n") {
            break;
        }
        if head.len() > MAX_HTTP_HEAD {
            return Err(AdapterError::Protocol("http head too large".to_string()));
        }
    }
    String::from_utf8(head)
        .map_err(|_| AdapterError::Protocol("http head is not UTF-8".to_string()))
}

/// Status code from an `HTTP/1.x NNN reason` line.
pub(crate) fn parse_status(head: &str) -> Result<u16, AdapterError> {
    let line = head.lines().next().unwrap_or_default();
    let mut parts = line.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some(version), Some(code)) if version.starts_with("HTTP/") => code
            .parse()
            .map_err(|_| AdapterError::Protocol(format!("bad status line: {line:?}"))),
        _ => Err(AdapterError::Protocol(format!("bad status line: {line:?}"))),
    }
}
