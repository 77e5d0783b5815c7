//! # switchyard-events
//!
//! Event type definitions and serialization for the switchyard engine.
//!
//! ## Design Principles
//!
//! - Events are immutable records of things the engine already did
//! - Events never contain credentials (node names only, never passwords)
//! - Every event carries a process-wide monotonic sequence number
//!
//! ## Event Envelope
//!
//! All events share a common envelope with:
//! - Ordering (`seq`)
//! - Wall-clock time (`occurred_at`)
//! - A dotted type name (`event_type`)
//! - The payload
//!
//! ## Event Types
//!
//! - Session events (`session.*`)
//! - Health check events (`health.*`)
//! - Configuration events (`config.*`)
//! - Engine lifecycle events (`engine.*`)

mod envelope;
mod error;
mod types;

pub use envelope::*;
pub use error::EventError;
pub use types::*;
