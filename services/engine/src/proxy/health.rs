//! Group health checking.
//!
//! One checker task per group. Each round probes every member concurrently
//! through the member's own adapter: connect to the probe URL, send
//! `HEAD`, and time the wait for the response status line. Results are
//! written as whole health records stamped with the round start, so a dial
//! report made during the round is never overwritten by an older probe.
//!
//! Rounds run on a jittered interval and on demand when the group's
//! trigger fires; both paths go through the same loop, so rounds never
//! overlap.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use switchyard_events::{EventPayload, HealthCheckedPayload};
use switchyard_id::ProbeRoundId;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn, Instrument};

use super::group::{HealthCheckSettings, ProxyGroup};
use super::node::{HealthRecord, NodeIndex, NodeRegistry, OutboundNode};
use crate::adapter::{build_client_config, parse_status, AdapterError, Destination};
use crate::events::EventBus;

/// Upper bound on a probe status line.
const MAX_STATUS_LINE: usize = 1024;

/// Where probes are sent, parsed from an `http://` or `https://` URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTarget {
    pub tls: bool,
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl ProbeTarget {
    pub fn parse(url: &str) -> Option<Self> {
        let (tls, rest) = if let Some(rest) = url.strip_prefix("http://") {
            (false, rest)
        } else if let Some(rest) = url.strip_prefix("https://") {
            (true, rest)
        } else {
            return None;
        };

        let (authority, path) = match rest.find('/') {
            Some(i) => (&rest[..i], &rest[i..]),
            None => (rest, "/"),
        };

        let default_port = if tls { 443 } else { 80 };
        let (host, port) = match authority.rsplit_once(':') {
            // Bracketed IPv6 without a port also contains ':'.
            Some((host, port)) if !port.contains(']') => (host, port.parse().ok()?),
            _ => (authority, default_port),
        };

        if host.is_empty() {
            return None;
        }

        Some(Self {
            tls,
            host: host.to_string(),
            port,
            path: path.to_string(),
        })
    }

    pub fn destination(&self) -> Destination {
        Destination::from_host(&self.host, self.port)
    }

    fn host_header(&self) -> String {
        let default_port = if self.tls { 443 } else { 80 };
        if self.port == default_port {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Why a probe did not prove a node alive.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error(transparent)]
    Adapter(#[from] AdapterError),

    #[error("tls handshake with probe target failed: {0}")]
    Tls(String),

    #[error("probe i/o failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("probe timed out after {0:?}")]
    Timeout(Duration),

    #[error("bad probe response: {0}")]
    BadResponse(String),

    #[error("unexpected probe status {0}")]
    UnexpectedStatus(u16),
}

/// Probe one node. Returns the measured latency.
pub async fn probe_node(
    node: &OutboundNode,
    settings: &HealthCheckSettings,
    tls: Option<&Arc<ClientConfig>>,
) -> Result<Duration, ProbeError> {
    let target = &settings.target;
    let started = Instant::now();

    let attempt = async {
        let stream = node.adapter().connect(&target.destination()).await?;
        let status = if target.tls {
            let config = tls.ok_or_else(|| ProbeError::Tls("no tls configuration".to_string()))?;
            let server_name = ServerName::try_from(target.host.clone())
                .map_err(|e| ProbeError::Tls(e.to_string()))?;
            let mut stream = TlsConnector::from(Arc::clone(config))
                .connect(server_name, stream)
                .await
                .map_err(|e| ProbeError::Tls(e.to_string()))?;
            head_request(&mut stream, target).await?
        } else {
            let mut stream = stream;
            head_request(&mut stream, target).await?
        };
        Ok::<_, ProbeError>(status)
    };

    let status = match timeout(settings.timeout, attempt).await {
        Ok(result) => result?,
        Err(_) => return Err(ProbeError::Timeout(settings.timeout)),
    };
    let latency = started.elapsed();

    if !settings.accepts(status) {
        return Err(ProbeError::UnexpectedStatus(status));
    }
    Ok(latency)
}

/// Send `HEAD` and return the status code from the first response line.
async fn head_request<S>(stream: &mut S, target: &ProbeTarget) -> Result<u16, ProbeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = format!(
        "HEAD {} HTTP/1.1\r\nHost: {}\r\nUser-Agent: switchyard\r\nConnection: close\r\n\r\n",
        target.path,
        target.host_header()
    );
    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;

    let mut line = Vec::with_capacity(64);
    loop {
        let byte = stream.read_u8().await?;
        line.push(byte);
        if line.ends_with(b"\r\n") {
            break;
        }
        if line.len() > MAX_STATUS_LINE {
            return Err(ProbeError::BadResponse("status line too long".to_string()));
        }
    }

    let line = String::from_utf8_lossy(&line);
    parse_status(&line).map_err(|e| ProbeError::BadResponse(e.to_string()))
}

/// Background prober for one group.
pub struct HealthChecker {
    group: Arc<ProxyGroup>,
    registry: Arc<NodeRegistry>,
    events: EventBus,
    tls: Option<Arc<ClientConfig>>,
}

impl HealthChecker {
    pub fn new(group: Arc<ProxyGroup>, registry: Arc<NodeRegistry>, events: EventBus) -> Self {
        let tls = if group.health_check().target.tls {
            match build_client_config(false) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!(group = %group.name(), error = %e, "Probe TLS setup failed");
                    None
                }
            }
        } else {
            None
        };

        Self {
            group,
            registry,
            events,
            tls,
        }
    }

    /// Spawn the checker loop on the runtime.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let span = tracing::info_span!("health_checker", group = %self.group.name());
        tokio::spawn(self.run(shutdown).instrument(span))
    }

    /// Probe every member once and store the results.
    pub async fn probe_round(&self) -> Vec<(NodeIndex, Result<Duration, ProbeError>)> {
        let round_id = ProbeRoundId::new();
        let started = Instant::now();
        let settings = self.group.health_check();

        let probes = self.group.members().iter().filter_map(|&index| {
            let node = Arc::clone(self.registry.get(index)?);
            let tls = self.tls.as_ref();
            Some(async move {
                let result = probe_node(&node, settings, tls).await;
                (index, node, result)
            })
        });

        let results = join_all(probes).await;
        let mut summary = Vec::with_capacity(results.len());
        let mut alive = 0usize;

        for (index, node, result) in results {
            let payload = match &result {
                Ok(latency) => {
                    alive += 1;
                    node.record(HealthRecord::alive(*latency, started));
                    debug!(
                        node = %node.name(),
                        latency_ms = latency.as_millis() as u64,
                        "Probe succeeded"
                    );
                    Some(HealthCheckedPayload {
                        round_id,
                        group: self.group.name().to_string(),
                        node: node.name().to_string(),
                        alive: true,
                        latency_ms: Some(latency.as_millis() as u64),
                        error: None,
                    })
                }
                // Reject nodes are never marked dead.
                Err(ProbeError::Adapter(AdapterError::Rejected)) => None,
                Err(e) => {
                    node.record(HealthRecord::dead(started));
                    warn!(node = %node.name(), error = %e, "Probe failed");
                    Some(HealthCheckedPayload {
                        round_id,
                        group: self.group.name().to_string(),
                        node: node.name().to_string(),
                        alive: false,
                        latency_ms: None,
                        error: Some(e.to_string()),
                    })
                }
            };
            if let Some(payload) = payload {
                self.events.publish(EventPayload::HealthChecked(payload));
            }
            summary.push((index, result));
        }

        info!(
            group = %self.group.name(),
            round_id = %round_id.short(),
            alive = alive,
            probed = summary.len(),
            "Probe round finished"
        );
        summary
    }

    /// Run rounds until `shutdown` flips to true or its sender is dropped.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let trigger = self.group.trigger();
        let interval = self.group.health_check().interval;
        info!(interval_secs = interval.map(|i| i.as_secs()), "Health checker started");

        if interval.is_some() {
            tokio::select! {
                _ = self.probe_round() => {}
                _ = wait_for_shutdown(&mut shutdown) => return,
            }
        }

        loop {
            let wait = interval.map(jittered);
            tokio::select! {
                _ = sleep_or_pending(wait) => {}
                _ = trigger.notified() => {
                    debug!("Probe round triggered");
                }
                _ = wait_for_shutdown(&mut shutdown) => break,
            }

            tokio::select! {
                _ = self.probe_round() => {}
                _ = wait_for_shutdown(&mut shutdown) => break,
            }
        }

        info!("Health checker stopped");
    }
}

/// `interval` plus up to 10% random jitter.
fn jittered(interval: Duration) -> Duration {
    let max_jitter_ms = (interval.as_millis() / 10) as u64;
    if max_jitter_ms == 0 {
        return interval;
    }
    interval + Duration::from_millis(rand::random_range(0..=max_jitter_ms))
}

async fn sleep_or_pending(wait: Option<Duration>) {
    match wait {
        Some(wait) => tokio::time::sleep(wait).await,
        None => std::future::pending().await,
    }
}

async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
