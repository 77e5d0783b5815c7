//! Mixed SOCKS5 / HTTP proxy inbound.
//!
//! The first byte picks the protocol: `0x05` is a SOCKS5 greeting, anything
//! else is read as an HTTP request head. HTTP clients may either `CONNECT`
//! or send plain requests with an absolute URI, which are rewritten to
//! origin form and forwarded with `Connection: close`.

use std::net::SocketAddr;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use super::{socks5_failure, socks5_reply, Inbound, InboundConnection, InboundError, Reply};
use crate::adapter::http::read_http_head;
use crate::adapter::socks5::{
    read_socks_addr, CMD_CONNECT, METHOD_NONE_ACCEPTABLE, METHOD_NO_AUTH, METHOD_USER_PASS,
    REP_CMD_NOT_SUPPORTED, SOCKS5_VERSION,
};
use crate::adapter::Destination;
use crate::config::Credentials;
use crate::proxy::ConnMetadata;

const USER_PASS_VERSION: u8 = 0x01;

/// Headers dropped when forwarding a plain HTTP request.
const HOP_HEADERS: &[&str] = &[
    "proxy-authorization",
    "proxy-connection",
    "connection",
    "keep-alive",
];

#[derive(Debug, Clone)]
pub struct MixedInbound {
    tag: String,
    credentials: Option<Credentials>,
}

impl MixedInbound {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            credentials: None,
        }
    }

    pub fn with_credentials(mut self, credentials: Option<Credentials>) -> Self {
        self.credentials = credentials;
        self
    }

    async fn socks5(
        &self,
        mut stream: TcpStream,
        peer: SocketAddr,
    ) -> Result<InboundConnection, InboundError> {
        let version = stream.read_u8().await?;
        if version != SOCKS5_VERSION {
            return Err(InboundError::Protocol(format!("unexpected socks version {version}")));
        }
        let count = stream.read_u8().await? as usize;
        let mut methods = vec![0u8; count];
        stream.read_exact(&mut methods).await?;

        let wanted = if self.credentials.is_some() {
            METHOD_USER_PASS
        } else {
            METHOD_NO_AUTH
        };
        if !methods.contains(&wanted) {
            stream.write_all(&[SOCKS5_VERSION, METHOD_NONE_ACCEPTABLE]).await?;
            return Err(InboundError::AuthFailed);
        }
        stream.write_all(&[SOCKS5_VERSION, wanted]).await?;

        if let Some(credentials) = &self.credentials {
            let version = stream.read_u8().await?;
            if version != USER_PASS_VERSION {
                return Err(InboundError::Protocol(format!("unexpected auth version {version}")));
            }
            let username = read_short_string(&mut stream).await?;
            let password = read_short_string(&mut stream).await?;
            if username != credentials.username.as_bytes()
                || password != credentials.password.as_bytes()
            {
                stream.write_all(&[USER_PASS_VERSION, 0x01]).await?;
                return Err(InboundError::AuthFailed);
            }
            stream.write_all(&[USER_PASS_VERSION, 0x00]).await?;
        }

        let mut header = [0u8; 3];
        stream.read_exact(&mut header).await?;
        if header[0] != SOCKS5_VERSION {
            stream.write_all(&socks5_failure()).await?;
            return Err(InboundError::Protocol(format!("unexpected socks version {}", header[0])));
        }
        let destination = read_socks_addr(&mut stream).await?;
        if header[1] != CMD_CONNECT {
            stream.write_all(&socks5_reply(REP_CMD_NOT_SUPPORTED)).await?;
            return Err(InboundError::UnsupportedCommand(header[1]));
        }

        debug!(destination = %destination, "SOCKS5 CONNECT");
        Ok(InboundConnection {
            metadata: ConnMetadata::new(peer, &destination, self.tag.clone()),
            stream: Box::new(stream),
            reply: Reply::Socks5,
        })
    }

    async fn http(
        &self,
        mut stream: TcpStream,
        peer: SocketAddr,
    ) -> Result<InboundConnection, InboundError> {
        let head = read_http_head(&mut stream)
            .await
            .map_err(|e| InboundError::Protocol(e.to_string()))?;

        let request = match RequestHead::parse(&head) {
            Ok(request) => request,
            Err(e) => {
                respond(&mut stream, "400 Bad Request", "").await?;
                return Err(e);
            }
        };

        if let Some(credentials) = &self.credentials {
            if !request.authorized(credentials) {
                respond(
                    &mut stream,
                    "407 Proxy Authentication Required",
                    "Proxy-Authenticate: Basic realm=\"switchyard\"\r\n",
                )
                .await?;
                return Err(InboundError::AuthFailed);
            }
        }

        let (destination, reply) = if request.method.eq_ignore_ascii_case("CONNECT") {
            let destination = match Destination::parse(&request.target) {
                Some(destination) => destination,
                None => {
                    respond(&mut stream, "400 Bad Request", "").await?;
                    return Err(InboundError::Protocol(format!(
                        "bad CONNECT target {:?}",
                        request.target
                    )));
                }
            };
            (destination, Reply::HttpConnect)
        } else {
            match request.forward() {
                Ok(forward) => forward,
                Err(e) => {
                    respond(&mut stream, "400 Bad Request", "").await?;
                    return Err(e);
                }
            }
        };

        debug!(method = %request.method, destination = %destination, "HTTP proxy request");
        Ok(InboundConnection {
            metadata: ConnMetadata::new(peer, &destination, self.tag.clone()),
            stream: Box::new(stream),
            reply,
        })
    }
}

#[async_trait]
impl Inbound for MixedInbound {
    fn tag(&self) -> &str {
        &self.tag
    }

    async fn handshake(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
    ) -> Result<InboundConnection, InboundError> {
        let mut first = [0u8; 1];
        if stream.peek(&mut first).await? == 0 {
            return Err(InboundError::Protocol("connection closed before handshake".to_string()));
        }
        if first[0] == SOCKS5_VERSION {
            self.socks5(stream, peer).await
        } else {
            self.http(stream, peer).await
        }
    }
}

async fn read_short_string(stream: &mut TcpStream) -> Result<Vec<u8>, InboundError> {
    let len = stream.read_u8().await? as usize;
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}

async fn respond(
    stream: &mut TcpStream,
    status: &str,
    extra_headers: &str,
) -> Result<(), InboundError> {
    let response = format!(
        "HTTP/1.1 {status}\r\n{extra_headers}Content-Length: 0\r\nConnection: close\r\n\r\n"
    );
    stream.write_all(response.as_bytes()).await?;
    Ok(())
}

/// Parsed HTTP request line and headers.
#[derive(Debug)]
struct RequestHead {
    method: String,
    target: String,
    version: String,
    headers: Vec<(String, String)>,
}

impl RequestHead {
    fn parse(head: &str) -> Result<Self, InboundError> {
        let mut lines = head.split("\r\n");
        let request_line = lines.next().unwrap_or_default();
        let mut parts = request_line.split_whitespace();
        let (method, target, version) = match (parts.next(), parts.next(), parts.next()) {
            (Some(m), Some(t), Some(v)) if v.starts_with("HTTP/") => (m, t, v),
            _ => {
                return Err(InboundError::Protocol(format!("bad request line {request_line:?}")));
            }
        };

        let headers = lines
            .filter(|line| !line.is_empty())
            .map(|line| {
                line.split_once(':')
                    .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
                    .ok_or_else(|| InboundError::Protocol(format!("bad header line {line:?}")))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            method: method.to_string(),
            target: target.to_string(),
            version: version.to_string(),
            headers,
        })
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn authorized(&self, credentials: &Credentials) -> bool {
        let Some(value) = self.header("proxy-authorization") else {
            return false;
        };
        let Some(encoded) = value
            .strip_prefix("Basic ")
            .or_else(|| value.strip_prefix("basic "))
        else {
            return false;
        };
        let expected = format!("{}:{}", credentials.username, credentials.password);
        STANDARD
            .decode(encoded.trim())
            .is_ok_and(|decoded| decoded == expected.as_bytes())
    }

    /// Destination and rewritten head for a plain (absolute URI) request.
    fn forward(&self) -> Result<(Destination, Reply), InboundError> {
        let rest = self.target.strip_prefix("http://").ok_or_else(|| {
            InboundError::Protocol(format!("expected an absolute http URI, got {:?}", self.target))
        })?;
        let (authority, path) = match rest.find('/') {
            Some(i) => (&rest[..i], &rest[i..]),
            None => (rest, "/"),
        };
        if authority.is_empty() {
            return Err(InboundError::Protocol("empty host".to_string()));
        }
        let destination = match authority.rsplit_once(':') {
            Some((host, port)) if !port.contains(']') => {
                let port = port
                    .parse()
                    .map_err(|_| InboundError::Protocol(format!("bad port in {authority:?}")))?;
                Destination::from_host(host, port)
            }
            _ => Destination::from_host(authority, 80),
        };

        let mut head = format!("{} {} {}\r\n", self.method, path, self.version);
        for (name, value) in &self.headers {
            if HOP_HEADERS.iter().any(|h| name.eq_ignore_ascii_case(h)) {
                continue;
            }
            head.push_str(&format!("{name}: {value}\r\n"));
        }
        if self.header("host").is_none() {
            head.push_str(&format!("Host: {authority}\r\n"));
        }
        head.push_str("Connection: close\r\n\r\n");

        Ok((destination, Reply::HttpForward { head: head.into_bytes() }))
    }
}
