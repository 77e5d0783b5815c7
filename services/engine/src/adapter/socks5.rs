//! SOCKS5 outbound (RFC 1928 CONNECT, RFC 1929 username/password).

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;
use tracing::debug;

use super::{
    dial_tcp, AdapterContext, AdapterError, Address, BoxedStream, Destination, ProtocolAdapter,
};
use crate::config::ProxyConfig;
use crate::error::ConfigError;

pub(super) const KIND: &str = "socks5";

pub(crate) const SOCKS5_VERSION: u8 = 0x05;
pub(crate) const METHOD_NO_AUTH: u8 = 0x00;
pub(crate) const METHOD_USER_PASS: u8 = 0x02;
pub(crate) const METHOD_NONE_ACCEPTABLE: u8 = 0xff;
pub(crate) const CMD_CONNECT: u8 = 0x01;
pub(crate) const REP_SUCCESS: u8 = 0x00;
pub(crate) const REP_GENERAL_FAILURE: u8 = 0x01;
pub(crate) const REP_NOT_ALLOWED: u8 = 0x02;
pub(crate) const REP_HOST_UNREACHABLE: u8 = 0x04;
pub(crate) const REP_CONN_REFUSED: u8 = 0x05;
pub(crate) const REP_CMD_NOT_SUPPORTED: u8 = 0x07;

#[derive(Debug, Clone)]
pub struct Socks5Adapter {
    server: String,
    port: u16,
    credentials: Option<(String, String)>,
    connect_timeout: Duration,
}

impl Socks5Adapter {
    pub fn new(server: impl Into<String>, port: u16, connect_timeout: Duration) -> Self {
        Self {
            server: server.into(),
            port,
            credentials: None,
            connect_timeout,
        }
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.credentials = Some((username.into(), password.into()));
        self
    }

    pub(super) fn from_config(
        config: &ProxyConfig,
        ctx: &AdapterContext,
    ) -> Result<Self, ConfigError> {
        let (server, port) = config.server_addr()?;
        let mut adapter = Self::new(server, port, ctx.connect_timeout);
        match (&config.username, &config.password) {
            (Some(user), Some(pass)) => {
                if user.len() > 255 || pass.len() > 255 {
                    return Err(ConfigError::InvalidNode {
                        node: config.name.clone(),
                        reason: "socks5 credentials longer than 255 bytes".to_string(),
                    });
                }
                adapter = adapter.with_credentials(user.clone(), pass.clone());
            }
            (None, None) => {}
            _ => {
                return Err(ConfigError::InvalidNode {
                    node: config.name.clone(),
                    reason: "socks5 needs both username and password".to_string(),
                })
            }
        }
        Ok(adapter)
    }

    async fn handshake<S>(
        &self,
        stream: &mut S,
        destination: &Destination,
    ) -> Result<(), AdapterError>
    where
        S: AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        // Greeting
        let greeting: &[u8] = if self.credentials.is_some() {
            &[SOCKS5_VERSION, 0x02, METHOD_NO_AUTH, METHOD_USER_PASS]
        } else {
            &[SOCKS5_VERSION, 0x01, METHOD_NO_AUTH]
        };
        stream.write_all(greeting).await?;

        let mut method = [0u8; 2];
        stream.read_exact(&mut method).await?;
        if method[0] != SOCKS5_VERSION {
            return Err(AdapterError::Protocol(format!(
                "upstream answered with version 0x{:02x}",
                method[0]
            )));
        }

        match (method[1], &self.credentials) {
            (METHOD_NO_AUTH, _) => {}
            (METHOD_USER_PASS, Some((user, pass))) => {
                let mut auth = Vec::with_capacity(3 + user.len() + pass.len());
                auth.push(0x01);
                auth.push(user.len() as u8);
                auth.extend_from_slice(user.as_bytes());
                auth.push(pass.len() as u8);
                auth.extend_from_slice(pass.as_bytes());
                stream.write_all(&auth).await?;

                let mut status = [0u8; 2];
                stream.read_exact(&mut status).await?;
                if status[1] != 0x00 {
                    return Err(AdapterError::Protocol(
                        "upstream rejected credentials".to_string(),
                    ));
                }
            }
            (other, _) => {
                return Err(AdapterError::Protocol(format!(
                    "upstream selected unsupported method 0x{:02x}",
                    other
                )))
            }
        }

        // CONNECT request
        let mut request = vec![SOCKS5_VERSION, CMD_CONNECT, 0x00];
        destination.write_socks_addr(&mut request)?;
        stream.write_all(&request).await?;

        // Reply: VER REP RSV then the bound address, which is drained.
        let mut reply = [0u8; 3];
        stream.read_exact(&mut reply).await?;
        if reply[1] != REP_SUCCESS {
            return Err(AdapterError::Protocol(format!(
                "upstream CONNECT rejected (rep=0x{:02x})",
                reply[1]
            )));
        }
        read_socks_addr(stream).await?;

        Ok(())
    }
}

#[async_trait]
impl ProtocolAdapter for Socks5Adapter {
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

        debug!(upstream = %self.server, destination = %destination, "SOCKS5 tunnel established");
        Ok(Box::new(stream))
    }
}

/// Read `ATYP`, address and port.
pub(crate) async fn read_socks_addr<S>(stream: &mut S) -> std::io::Result<Destination>
where
    S: AsyncRead + Unpin,
{
    let atyp = stream.read_u8().await?;
    let host = match atyp {
        0x01 => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets).await?;
            Address::Ip(IpAddr::V4(Ipv4Addr::from(octets)))
        }
        0x03 => {
            let len = stream.read_u8().await? as usize;
            let mut domain = vec![0u8; len];
            stream.read_exact(&mut domain).await?;
            let domain = String::from_utf8(domain).map_err(|_| {
                std::io::Error::new(std::io::ErrorKind::InvalidData, "domain is not UTF-8")
            })?;
            Address::Domain(domain)
        }
        0x04 => {
            let mut octets = [0u8; 16];
            stream.read_exact(&mut octets).await?;
            Address::Ip(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        other => {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("unknown address type 0x{:02x}", other),
            ))
        }
    };
    let port = stream.read_u16().await?;
    Ok(Destination::new(host, port))
}
