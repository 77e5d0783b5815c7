//! Routing core.
//!
//! ## Architecture
//!
//! ```text
//! Client -> Listener -> Inbound handshake -> Dispatcher -> Router -> Group select
//!                                                 |                      |
//!                                                 +-- dial (retry) <-----+
//!                                                 |
//!                                                 +-- relay <-> Outbound node
//! ```
//!
//! The router reads one immutable [`Snapshot`] per session. Node health is
//! updated independently by each group's [`HealthChecker`] and by dial
//! reports from the dispatcher.

mod dispatcher;
mod geoip;
mod group;
mod health;
mod listener;
mod metadata;
mod node;
mod relay;
mod router;
mod rules;

pub use dispatcher::{DispatchError, Dispatcher, SessionSummary};
pub use geoip::{matches_country, GeoIpResolver, StaticGeoIp, LAN};
pub use group::{HealthCheckSettings, ProxyGroup};
pub use health::{probe_node, HealthChecker, ProbeError, ProbeTarget};
pub use listener::{Listener, ListenerConfig, ListenerStats};
pub use metadata::ConnMetadata;
pub use node::{
    HealthRecord, Liveness, NodeIndex, NodeRegistry, OutboundNode, Outcome, DIRECT, REJECT,
};
pub use relay::{relay, RelayCounters};
pub use router::{Router, RoutingDecision, Snapshot};
pub use rules::{Predicate, RoutingTable, Rule, RuleSpec, Target};
