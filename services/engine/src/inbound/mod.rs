//! Inbound listener adapters.
//!
//! An inbound turns an accepted TCP connection into an
//! [`InboundConnection`]: the connection metadata used for routing, the
//! client stream, and the protocol reply still owed to the client once the
//! outbound dial has succeeded or failed.

mod mixed;
mod tunnel;

use std::fmt;
use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use crate::adapter::socks5::{
    REP_CONN_REFUSED, REP_GENERAL_FAILURE, REP_HOST_UNREACHABLE, REP_NOT_ALLOWED, REP_SUCCESS,
    SOCKS5_VERSION,
};
use crate::adapter::BoxedStream;
use crate::proxy::ConnMetadata;

pub use mixed::MixedInbound;
pub use tunnel::TunnelInbound;

/// Handshake failures. The connection is dropped.
#[derive(Debug, Error)]
pub enum InboundError {
    #[error("inbound i/o failed: {0}")]
    Io(#[from] io::Error),

    #[error("inbound protocol error: {0}")]
    Protocol(String),

    #[error("client authentication failed")]
    AuthFailed,

    #[error("unsupported command 0x{0:02x}")]
    UnsupportedCommand(u8),
}

/// Reply owed to the client after the outbound dial.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Socks5,
    HttpConnect,
    /// Plain HTTP proxying: the rewritten request head is sent upstream
    /// instead of answering the client.
    HttpForward { head: Vec<u8> },
    /// Fixed-target tunnels owe nothing.
    None,
}

/// Why the dispatcher could not serve a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refusal {
    /// No usable node.
    NoRoute,
    /// Routed to a reject node.
    Rejected,
    /// Every dial attempt failed.
    Unreachable,
}

/// A client connection that finished its inbound handshake.
pub struct InboundConnection {
    pub metadata: ConnMetadata,
    pub stream: BoxedStream,
    pub reply: Reply,
}

impl InboundConnection {
    /// Tell the client the tunnel is up.
    pub async fn established(&mut self, outbound: &mut BoxedStream) -> io::Result<()> {
        match &self.reply {
            Reply::Socks5 => self.stream.write_all(&socks5_reply(REP_SUCCESS)).await?,
            Reply::HttpConnect => {
                self.stream
                    .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                    .await?
            }
            Reply::HttpForward { head } => outbound.write_all(head).await?,
            Reply::None => {}
        }
        self.stream.flush().await
    }

    /// Tell the client the connection will not be served.
    pub async fn refused(&mut self, refusal: Refusal) -> io::Result<()> {
        match &self.reply {
            Reply::Socks5 => {
                let code = match refusal {
                    Refusal::NoRoute => REP_CONN_REFUSED,
                    Refusal::Rejected => REP_NOT_ALLOWED,
                    Refusal::Unreachable => REP_HOST_UNREACHABLE,
                };
                self.stream.write_all(&socks5_reply(code)).await?;
            }
            Reply::HttpConnect | Reply::HttpForward { .. } => {
                let status = match refusal {
                    Refusal::NoRoute => "503 Service Unavailable",
                    Refusal::Rejected => "403 Forbidden",
                    Refusal::Unreachable => "502 Bad Gateway",
                };
                let response = format!(
                    "HTTP/1.1 {status}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
                );
                self.stream.write_all(response.as_bytes()).await?;
            }
            Reply::None => {}
        }
        self.stream.shutdown().await
    }
}

impl fmt::Debug for InboundConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundConnection")
            .field("metadata", &self.metadata)
            .field("reply", &self.reply)
            .finish_non_exhaustive()
    }
}

/// SOCKS5 reply with an all-zero IPv4 bound address.
pub(crate) fn socks5_reply(code: u8) -> [u8; 10] {
    [SOCKS5_VERSION, code, 0x00, 0x01, 0, 0, 0, 0, 0, 0]
}

/// General failure reply, used when the request itself is bad.
pub(crate) fn socks5_failure() -> [u8; 10] {
    socks5_reply(REP_GENERAL_FAILURE)
}

/// Protocol spoken by one listener.
#[async_trait]
pub trait Inbound: Send + Sync + fmt::Debug {
    /// Tag matched by `IN-TAG` rules.
    fn tag(&self) -> &str;

    async fn handshake(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
    ) -> Result<InboundConnection, InboundError>;
}
