//! TCP listener and connection handling.
//!
//! A listener accepts connections on one address, runs its inbound
//! handshake under a timeout and hands the result to the dispatcher. Each
//! connection runs on its own task inside a `connection` span; the number
//! of concurrent connections is capped by a semaphore.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, warn, Instrument};

use super::dispatcher::{DispatchError, Dispatcher};
use crate::config::{DEFAULT_HANDSHAKE_TIMEOUT_MS, DEFAULT_MAX_CONNECTIONS};
use crate::inbound::Inbound;

/// Configuration for a listener.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Bound on the inbound handshake.
    pub handshake_timeout: Duration,
}

impl ListenerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            handshake_timeout: Duration::from_millis(DEFAULT_HANDSHAKE_TIMEOUT_MS),
        }
    }
}

/// Statistics for a listener.
#[derive(Debug, Default)]
pub struct ListenerStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Connections currently open.
    pub connections_active: AtomicU64,
    /// Total connections closed.
    pub connections_closed: AtomicU64,
    /// Connections rejected due to max limit.
    pub connections_rejected: AtomicU64,
    /// Inbound handshakes that failed or timed out.
    pub handshakes_failed: AtomicU64,
    /// Sessions relayed to completion.
    pub sessions_completed: AtomicU64,
    /// Sessions that ended in `Failed`.
    pub sessions_failed: AtomicU64,
    /// Bytes relayed from clients.
    pub bytes_up: AtomicU64,
    /// Bytes relayed to clients.
    pub bytes_down: AtomicU64,
}

/// A bound inbound listener.
///
/// Only the accept loop holds the socket. Connection tasks share the
/// handler, so the port is released once the loop stops even while
/// sessions are still open.
pub struct Listener {
    listener: TcpListener,
    conn_semaphore: Arc<Semaphore>,
    handler: Arc<ConnectionHandler>,
}

/// Per-connection state shared with connection tasks.
struct ConnectionHandler {
    config: ListenerConfig,
    inbound: Arc<dyn Inbound>,
    dispatcher: Dispatcher,
    stats: ListenerStats,
}

impl Listener {
    pub async fn bind(
        config: ListenerConfig,
        inbound: Arc<dyn Inbound>,
        dispatcher: Dispatcher,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let local_addr = listener.local_addr()?;

        info!(
            bind_addr = %local_addr,
            inbound = %inbound.tag(),
            max_connections = config.max_connections,
            "Listener bound"
        );

        Ok(Self {
            conn_semaphore: Arc::new(Semaphore::new(config.max_connections)),
            listener,
            handler: Arc::new(ConnectionHandler {
                config,
                inbound,
                dispatcher,
                stats: ListenerStats::default(),
            }),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn tag(&self) -> &str {
        self.handler.inbound.tag()
    }

    pub fn stats(&self) -> &ListenerStats {
        &self.handler.stats
    }

    /// Accept connections until `shutdown` flips to true. Connections
    /// already handed off keep running.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> io::Result<()> {
        let local_addr = self.listener.local_addr()?;
        info!(bind_addr = %local_addr, inbound = %self.tag(), "Listener started");

        loop {
            let accepted = tokio::select! {
                accepted = self.listener.accept() => accepted,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            };

            match accepted {
                Ok((stream, peer_addr)) => {
                    let permit = match self.conn_semaphore.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            self.stats().connections_rejected.fetch_add(1, Ordering::Relaxed);
                            warn!(
                                peer_addr = %peer_addr,
                                "Connection rejected: max connections reached"
                            );
                            continue;
                        }
                    };

                    self.stats().connections_accepted.fetch_add(1, Ordering::Relaxed);
                    self.stats().connections_active.fetch_add(1, Ordering::Relaxed);

                    let handler = Arc::clone(&self.handler);

                    tokio::spawn(
                        async move {
                            handler.handle_connection(stream, peer_addr).await;

                            handler.stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                            handler.stats.connections_closed.fetch_add(1, Ordering::Relaxed);
                            drop(permit);
                        }
                        .instrument(tracing::info_span!("connection", peer = %peer_addr)),
                    );
                }
                Err(e) => {
                    error!(error = %e, "Accept error");
                    // Brief sleep to avoid tight loop on persistent errors
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }

        info!(bind_addr = %local_addr, "Listener stopped");
        Ok(())
    }
}

impl ConnectionHandler {
    async fn handle_connection(&self, stream: TcpStream, peer_addr: SocketAddr) {
        let handshake = tokio::time::timeout(
            self.config.handshake_timeout,
            self.inbound.handshake(stream, peer_addr),
        )
        .await;

        let conn = match handshake {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => {
                self.stats.handshakes_failed.fetch_add(1, Ordering::Relaxed);
                debug!(error = %e, "Inbound handshake failed");
                return;
            }
            Err(_) => {
                self.stats.handshakes_failed.fetch_add(1, Ordering::Relaxed);
                debug!(timeout = ?self.config.handshake_timeout, "Inbound handshake timed out");
                return;
            }
        };

        match self.dispatcher.dispatch(conn).await {
            Ok(summary) => {
                self.stats.sessions_completed.fetch_add(1, Ordering::Relaxed);
                self.stats.bytes_up.fetch_add(summary.bytes_up, Ordering::Relaxed);
                self.stats.bytes_down.fetch_add(summary.bytes_down, Ordering::Relaxed);
            }
            Err(e) => {
                self.stats.sessions_failed.fetch_add(1, Ordering::Relaxed);
                match e {
                    DispatchError::Relay(e) => debug!(error = %e, "Relay closed with error"),
                    other => debug!(error = %other, "Session not served"),
                }
            }
        }
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("config", &self.handler.config)
            .field("inbound", &self.handler.inbound)
            .finish_non_exhaustive()
    }
}
