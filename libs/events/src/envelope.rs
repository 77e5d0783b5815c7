//! Event envelope - the common wrapper for all events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use switchyard_id::EventSeq;

use crate::error::EventError;
use crate::types::EventPayload;

/// The event envelope - common metadata for all events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope<P = EventPayload> {
    /// Process-wide monotonic sequence number.
    pub seq: EventSeq,

    /// When the event occurred.
    pub occurred_at: DateTime<Utc>,

    /// The event type (e.g., "session.closed", "health.checked").
    pub event_type: String,

    /// Event-specific payload.
    pub payload: P,
}

impl<P> EventEnvelope<P> {
    /// Serialize the envelope as a single JSON line.
    pub fn to_json(&self) -> Result<String, EventError>
    where
        P: Serialize,
    {
        Ok(serde_json::to_string(self)?)
    }
}

impl EventEnvelope<EventPayload> {
    /// Wrap an engine payload, stamping it with `seq` and the current time.
    pub fn wrap(seq: EventSeq, payload: EventPayload) -> Self {
        Self {
            seq,
            occurred_at: Utc::now(),
            event_type: payload.event_type().to_string(),
            payload,
        }
    }
}
