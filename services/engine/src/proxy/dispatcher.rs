//! Connection dispatch pipeline.
//!
//! One session per inbound connection:
//!
//! ```text
//! Accepted -> Routed -> Dialing -> Relaying -> Closed
//!    |                    |  ^         |
//!    +--------------------+--+---------+--> Failed
//!                         (retry)
//! ```
//!
//! A failed dial is reported to the owning group, which marks the node dead
//! before the next `select`. The dispatcher then asks the group for the
//! next-best node it has not tried yet, up to `max_dial_retries` extra
//! attempts. Manual-selection groups and reject nodes never retry. When
//! every attempt failed the group is asked for an immediate probe round.
//!
//! While dialing, the client side is watched for EOF. A client that goes
//! away cancels the dial in flight and no outcome is reported for the node.
//! Bytes the client sends early are held and written upstream first.

use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use switchyard_events::{
    EventPayload, SessionClosedPayload, SessionDialFailedPayload, SessionFailedPayload,
    SessionOpenedPayload, SessionRelayingPayload, SessionRoutedPayload, SessionState,
};
use switchyard_id::SessionId;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use super::metadata::ConnMetadata;
use super::node::{NodeIndex, Outcome};
use super::relay::{relay, RelayCounters};
use super::router::{Router, RoutingDecision, Snapshot};
use crate::adapter::{AdapterError, BoxedStream};
use crate::config::Policy;
use crate::error::SelectError;
use crate::events::EventBus;
use crate::inbound::{InboundConnection, Refusal};

/// Client bytes buffered while a dial is in flight. Past this the client
/// is no longer read until the dial finishes.
const MAX_EARLY_DATA: usize = 64 * 1024;

/// Why a session ended without relaying to completion.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Select(#[from] SelectError),

    #[error("connection rejected by {node}")]
    Rejected { node: String },

    #[error("dial failed after {attempts} attempt(s), last via {node}: {source}")]
    DialExhausted {
        node: String,
        attempts: u32,
        #[source]
        source: AdapterError,
    },

    #[error("client closed the connection while dialing")]
    ClientClosed,

    #[error("relay failed: {0}")]
    Relay(#[source] io::Error),
}

/// What happened to a session that relayed to completion.
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub id: SessionId,
    pub rule: Option<String>,
    pub target: String,
    pub node: String,
    /// Dial attempts that failed before the one that succeeded.
    pub retries: u32,
    pub bytes_up: u64,
    pub bytes_down: u64,
    pub duration: Duration,
}

/// Routes, dials and relays inbound connections.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    router: Arc<Router>,
    events: EventBus,
}

impl Dispatcher {
    pub fn new(router: Arc<Router>, events: EventBus) -> Self {
        Self { router, events }
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    /// Run one session to completion.
    pub async fn dispatch(
        &self,
        mut conn: InboundConnection,
    ) -> Result<SessionSummary, DispatchError> {
        // The session keeps this snapshot even if a reload swaps it.
        let snapshot = self.router.load();
        let mut session = Session::open(&self.events, &conn.metadata);

        let decision = match snapshot.route(&conn.metadata) {
            Ok(decision) => decision,
            Err(e) => {
                session.fail(None, &e);
                let _ = conn.refused(Refusal::NoRoute).await;
                return Err(e.into());
            }
        };

        session.advance(SessionState::Routed);
        self.events.publish(EventPayload::SessionRouted(SessionRoutedPayload {
            session_id: session.id,
            rule: decision.rule.clone(),
            target: decision.target.clone(),
            node: node_name(&snapshot, decision.node),
        }));

        session.advance(SessionState::Dialing);
        let mut early = Vec::new();
        let dialed = {
            let dial = self.dial(&snapshot, &decision, &conn.metadata, &session);
            tokio::pin!(dial);
            let mut buf = vec![0u8; 4096];
            loop {
                tokio::select! {
                    result = &mut dial => break Some(result),
                    read = conn.stream.read(&mut buf), if early.len() < MAX_EARLY_DATA => {
                        match read {
                            Ok(0) | Err(_) => break None,
                            Ok(n) => early.extend_from_slice(&buf[..n]),
                        }
                    }
                }
            }
        };

        let (mut outbound, node, retries) = match dialed {
            Some(Ok(dialed)) => dialed,
            Some(Err(e)) => {
                let (node, refusal) = match &e {
                    DispatchError::Rejected { node } => (Some(node.as_str()), Refusal::Rejected),
                    DispatchError::DialExhausted { node, .. } => {
                        (Some(node.as_str()), Refusal::Unreachable)
                    }
                    _ => (None, Refusal::Unreachable),
                };
                session.fail(node, &e);
                let _ = conn.refused(refusal).await;
                return Err(e);
            }
            None => {
                let e = DispatchError::ClientClosed;
                session.fail(None, &e);
                return Err(e);
            }
        };
        let node = node_name(&snapshot, node);

        if let Err(e) = conn.established(&mut outbound).await {
            session.fail(Some(&node), &e);
            return Err(DispatchError::Relay(e));
        }

        let counters = RelayCounters::default();
        if !early.is_empty() {
            if let Err(e) = outbound.write_all(&early).await {
                session.fail(Some(&node), &e);
                return Err(DispatchError::Relay(e));
            }
            counters.add_up(early.len() as u64);
        }

        session.advance(SessionState::Relaying);
        self.events.publish(EventPayload::SessionRelaying(SessionRelayingPayload {
            session_id: session.id,
            node: node.clone(),
            retries,
        }));

        let idle_timeout = snapshot.dispatcher().idle_timeout();
        let result = relay(conn.stream, outbound, idle_timeout, &counters).await;

        if let Err(e) = result {
            debug!(
                session_id = %session.id.short(),
                bytes_up = counters.up(),
                bytes_down = counters.down(),
                error = %e,
                "Relay ended with error"
            );
            session.fail(Some(&node), &e);
            return Err(DispatchError::Relay(e));
        }

        let summary = SessionSummary {
            id: session.id,
            rule: decision.rule,
            target: decision.target,
            node,
            retries,
            bytes_up: counters.up(),
            bytes_down: counters.down(),
            duration: session.started.elapsed(),
        };
        session.close(&summary);
        Ok(summary)
    }

    /// Dial through the chosen node, retrying within the group.
    ///
    /// Returns the stream, the node that served it and the number of failed
    /// attempts before it.
    async fn dial(
        &self,
        snapshot: &Snapshot,
        decision: &RoutingDecision,
        meta: &ConnMetadata,
        session: &Session<'_>,
    ) -> Result<(BoxedStream, NodeIndex, u32), DispatchError> {
        let registry = snapshot.registry();
        let destination = meta.destination();
        let max_retries = snapshot.dispatcher().max_dial_retries as usize;
        let retry_allowed = decision
            .group
            .as_ref()
            .is_some_and(|group| group.policy() != Policy::Select);

        let mut tried: Vec<NodeIndex> = Vec::new();
        let mut current = decision.node;

        loop {
            let node = snapshot
                .node(current)
                .ok_or_else(|| SelectError::UnknownNode {
                    group: decision.target.clone(),
                    node: current.get().to_string(),
                })?;

            let error = match node.adapter().connect(&destination).await {
                Ok(stream) => {
                    if let Some(group) = &decision.group {
                        group.report(registry, current, Outcome::Success);
                    }
                    debug!(
                        session_id = %session.id.short(),
                        node = %node.name(),
                        attempt = tried.len() + 1,
                        "Dial succeeded"
                    );
                    return Ok((stream, current, tried.len() as u32));
                }
                Err(AdapterError::Rejected) => {
                    return Err(DispatchError::Rejected {
                        node: node.name().to_string(),
                    });
                }
                Err(e) => e,
            };

            tried.push(current);
            warn!(
                session_id = %session.id.short(),
                node = %node.name(),
                destination = %destination,
                attempt = tried.len(),
                error = %error,
                "Dial failed"
            );
            self.events.publish(EventPayload::SessionDialFailed(SessionDialFailedPayload {
                session_id: session.id,
                node: node.name().to_string(),
                attempt: tried.len() as u32,
                error: error.to_string(),
            }));

            let exhausted = |source: AdapterError| DispatchError::DialExhausted {
                node: node.name().to_string(),
                attempts: tried.len() as u32,
                source,
            };

            let Some(group) = &decision.group else {
                return Err(exhausted(error));
            };
            if error.is_node_failure() {
                group.report(registry, current, Outcome::Failure);
            }

            if !retry_allowed || tried.len() > max_retries {
                group.trigger_probe();
                return Err(exhausted(error));
            }
            match group.select_excluding(registry, &tried) {
                Ok(next) => current = next,
                Err(_) => {
                    group.trigger_probe();
                    return Err(exhausted(error));
                }
            }
        }
    }
}

fn node_name(snapshot: &Snapshot, index: NodeIndex) -> String {
    snapshot
        .node(index)
        .map(|n| n.name().to_string())
        .unwrap_or_default()
}

/// Session state tracking and lifecycle events.
struct Session<'a> {
    id: SessionId,
    state: SessionState,
    started: Instant,
    events: &'a EventBus,
}

impl<'a> Session<'a> {
    fn open(events: &'a EventBus, meta: &ConnMetadata) -> Self {
        let id = SessionId::new();
        events.publish(EventPayload::SessionOpened(SessionOpenedPayload {
            session_id: id,
            inbound_tag: meta.inbound_tag.clone(),
            source: meta.source.to_string(),
            destination: meta.destination().to_string(),
            network: meta.network,
        }));
        debug!(
            session_id = %id.short(),
            destination = %meta.destination(),
            inbound = %meta.inbound_tag,
            "Session accepted"
        );
        Self {
            id,
            state: SessionState::Accepted,
            started: Instant::now(),
            events,
        }
    }

    fn advance(&mut self, next: SessionState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "invalid session transition {:?} -> {:?}",
            self.state,
            next
        );
        self.state = next;
    }

    fn fail(&mut self, node: Option<&str>, error: &dyn std::fmt::Display) {
        info!(
            session_id = %self.id.short(),
            stage = ?self.state,
            node = node.unwrap_or("-"),
            error = %error,
            "Session failed"
        );
        self.events.publish(EventPayload::SessionFailed(SessionFailedPayload {
            session_id: self.id,
            stage: self.state,
            node: node.map(str::to_string),
            error: error.to_string(),
        }));
        self.advance(SessionState::Failed);
    }

    fn close(&mut self, summary: &SessionSummary) {
        self.advance(SessionState::Closed);
        info!(
            session_id = %self.id.short(),
            node = %summary.node,
            retries = summary.retries,
            bytes_up = summary.bytes_up,
            bytes_down = summary.bytes_down,
            duration_ms = summary.duration.as_millis() as u64,
            "Session closed"
        );
        self.events.publish(EventPayload::SessionClosed(SessionClosedPayload {
            session_id: self.id,
            node: summary.node.clone(),
            bytes_up: summary.bytes_up,
            bytes_down: summary.bytes_down,
            duration_ms: summary.duration.as_millis() as u64,
        }));
    }
}
