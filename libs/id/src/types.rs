//! Identifier definitions.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::define_id;

define_id!(
    /// Identifies one dispatched connection from accept to close.
    SessionId,
    "sess"
);

define_id!(
    /// Identifies one health-check round over the members of a proxy group.
    ProbeRoundId,
    "probe"
);

// =============================================================================
// Event Sequence
// =============================================================================

/// Monotonic sequence number stamped on every published event.
///
/// Not ULID-based: subscribers use it to detect gaps after lagging behind
/// the broadcast bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventSeq(u64);

impl EventSeq {
    /// The first sequence number handed out by a fresh counter.
    pub const FIRST: Self = Self(1);

    /// Creates an EventSeq from a raw value.
    #[must_use]
    pub const fn new(seq: u64) -> Self {
        Self(seq)
    }

    /// Returns the underlying value.
    #[must_use]
    pub const fn value(&self) -> u64 {
        self.0
    }

    /// Number of sequence numbers strictly between `self` and `later`.
    #[must_use]
    pub const fn gap_to(&self, later: EventSeq) -> u64 {
        later.0.saturating_sub(self.0).saturating_sub(1)
    }
}

impl std::fmt::Display for EventSeq {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for EventSeq {
    fn from(seq: u64) -> Self {
        Self(seq)
    }
}

impl serde::Serialize for EventSeq {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_u64(self.0)
    }
}

impl<'de> serde::Deserialize<'de> for EventSeq {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Self)
    }
}

/// Thread-safe generator of [`EventSeq`] values.
#[derive(Debug)]
pub struct EventSeqCounter {
    next: AtomicU64,
}

impl EventSeqCounter {
    /// Creates a counter whose first value is [`EventSeq::FIRST`].
    pub const fn new() -> Self {
        Self {
            next: AtomicU64::new(EventSeq::FIRST.0),
        }
    }

    /// Hands out the next sequence number.
    pub fn next(&self) -> EventSeq {
        EventSeq(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for EventSeqCounter {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
