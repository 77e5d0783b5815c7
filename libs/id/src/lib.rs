//! # switchyard-id
//!
//! Typed identifiers used across the switchyard routing core.
//!
//! ## ID Format
//!
//! Identifiers for runtime objects use a prefixed format: `{prefix}_{ulid}`
//!
//! Examples:
//! - `sess_01HV4Z2WQXKJNM8GPQY6VBKC3D` (one dispatched connection)
//! - `probe_01HV4Z3MXNKPQR9HSTZ7WCLD4E` (one health-check round of a group)
//!
//! The prefix keeps log lines greppable per object kind and the ULID keeps
//! identifiers time-ordered, so sorting session IDs sorts them by accept time.
//!
//! Event sequence numbers are plain monotonic integers ([`EventSeq`]).

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
