//! Event type definitions for all engine events.
//!
//! Each event type has a corresponding payload struct with the event-specific
//! data. [`EventPayload`] is the closed set the engine publishes.

use serde::{Deserialize, Serialize};
use switchyard_id::{ProbeRoundId, SessionId};

// =============================================================================
// Event Type Constants
// =============================================================================

/// All event type names as constants.
pub mod event_types {
    // Session
    pub const SESSION_OPENED: &str = "session.opened";
    pub const SESSION_ROUTED: &str = "session.routed";
    pub const SESSION_DIAL_FAILED: &str = "session.dial_failed";
    pub const SESSION_RELAYING: &str = "session.relaying";
    pub const SESSION_CLOSED: &str = "session.closed";
    pub const SESSION_FAILED: &str = "session.failed";

    // Health
    pub const HEALTH_CHECKED: &str = "health.checked";

    // Configuration
    pub const CONFIG_APPLIED: &str = "config.applied";
    pub const CONFIG_REJECTED: &str = "config.rejected";

    // Engine
    pub const ENGINE_STARTED: &str = "engine.started";
    pub const ENGINE_STOPPED: &str = "engine.stopped";
}

// =============================================================================
// Shared enums
// =============================================================================

/// Lifecycle state of a dispatched session.
///
/// `Accepted -> Routed -> Dialing -> Relaying -> Closed`, with `Failed`
/// reachable from `Dialing` and `Relaying`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Accepted,
    Routed,
    Dialing,
    Relaying,
    Closed,
    Failed,
}

impl SessionState {
    /// Whether the session can move from `self` to `next`.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Accepted, Routed)
                | (Accepted, Failed)
                | (Routed, Dialing)
                | (Dialing, Dialing)
                | (Dialing, Relaying)
                | (Dialing, Failed)
                | (Relaying, Closed)
                | (Relaying, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionState::Accepted => "accepted",
            SessionState::Routed => "routed",
            SessionState::Dialing => "dialing",
            SessionState::Relaying => "relaying",
            SessionState::Closed => "closed",
            SessionState::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// Transport of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    #[default]
    Tcp,
    Udp,
}

impl std::fmt::Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Network::Tcp => write!(f, "tcp"),
            Network::Udp => write!(f, "udp"),
        }
    }
}

// =============================================================================
// Session Events
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionOpenedPayload {
    pub session_id: SessionId,
    pub inbound_tag: String,
    pub source: String,
    /// `host:port` as requested by the client.
    pub destination: String,
    pub network: Network,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRoutedPayload {
    pub session_id: SessionId,
    /// Rule that matched, or `None` when the default target was used.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule: Option<String>,
    /// Group or node name the rule points at.
    pub target: String,
    /// Node picked for the first dial.
    pub node: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDialFailedPayload {
    pub session_id: SessionId,
    pub node: String,
    /// 1-based attempt number.
    pub attempt: u32,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRelayingPayload {
    pub session_id: SessionId,
    pub node: String,
    pub retries: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionClosedPayload {
    pub session_id: SessionId,
    pub node: String,
    pub bytes_up: u64,
    pub bytes_down: u64,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionFailedPayload {
    pub session_id: SessionId,
    /// State the session was in when it failed.
    pub stage: SessionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
    pub error: String,
}

// =============================================================================
// Health Events
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckedPayload {
    pub round_id: ProbeRoundId,
    pub group: String,
    pub node: String,
    pub alive: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// =============================================================================
// Config Events
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigAppliedPayload {
    pub nodes: usize,
    pub groups: usize,
    pub rules: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigRejectedPayload {
    pub error: String,
}

// =============================================================================
// Engine Events
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStartedPayload {
    pub home_dir: String,
    /// Listener addresses that were bound.
    pub listeners: Vec<String>,
}

// =============================================================================
// Payload union
// =============================================================================

/// Every payload the engine publishes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventPayload {
    SessionOpened(SessionOpenedPayload),
    SessionRouted(SessionRoutedPayload),
    SessionDialFailed(SessionDialFailedPayload),
    SessionRelaying(SessionRelayingPayload),
    SessionClosed(SessionClosedPayload),
    SessionFailed(SessionFailedPayload),
    HealthChecked(HealthCheckedPayload),
    ConfigApplied(ConfigAppliedPayload),
    ConfigRejected(ConfigRejectedPayload),
    EngineStarted(EngineStartedPayload),
    EngineStopped,
}

impl EventPayload {
    /// The dotted event type name for this payload.
    pub fn event_type(&self) -> &'static str {
        match self {
            EventPayload::SessionOpened(_) => event_types::SESSION_OPENED,
            EventPayload::SessionRouted(_) => event_types::SESSION_ROUTED,
            EventPayload::SessionDialFailed(_) => event_types::SESSION_DIAL_FAILED,
            EventPayload::SessionRelaying(_) => event_types::SESSION_RELAYING,
            EventPayload::SessionClosed(_) => event_types::SESSION_CLOSED,
            EventPayload::SessionFailed(_) => event_types::SESSION_FAILED,
            EventPayload::HealthChecked(_) => event_types::HEALTH_CHECKED,
            EventPayload::ConfigApplied(_) => event_types::CONFIG_APPLIED,
            EventPayload::ConfigRejected(_) => event_types::CONFIG_REJECTED,
            EventPayload::EngineStarted(_) => event_types::ENGINE_STARTED,
            EventPayload::EngineStopped => event_types::ENGINE_STOPPED,
        }
    }

    /// The session this event belongs to, if any.
    pub fn session_id(&self) -> Option<SessionId> {
        match self {
            EventPayload::SessionOpened(p) => Some(p.session_id),
            EventPayload::SessionRouted(p) => Some(p.session_id),
            EventPayload::SessionDialFailed(p) => Some(p.session_id),
            EventPayload::SessionRelaying(p) => Some(p.session_id),
            EventPayload::SessionClosed(p) => Some(p.session_id),
            EventPayload::SessionFailed(p) => Some(p.session_id),
            _ => None,
        }
    }
}
