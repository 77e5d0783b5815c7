//! In-process event bus.
//!
//! Every published payload is wrapped in an envelope carrying a monotonic
//! sequence number and fanned out to all live subscribers over a tokio
//! broadcast channel. Slow subscribers lose the oldest events rather than
//! slowing the engine down.

use std::sync::Arc;

use switchyard_events::{EventEnvelope, EventPayload};
use switchyard_id::EventSeqCounter;
use tokio::sync::broadcast;

/// Events buffered per subscriber before the oldest are dropped.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EventEnvelope>,
    seq: Arc<EventSeqCounter>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            seq: Arc::new(EventSeqCounter::new()),
        }
    }

    /// Publish a payload. Returns the envelope that was sent.
    pub fn publish(&self, payload: EventPayload) -> EventEnvelope {
        let envelope = EventEnvelope::wrap(self.seq.next(), payload);
        // No subscribers is fine.
        let _ = self.tx.send(envelope.clone());
        envelope
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
