//! Outbound nodes and the node registry.
//!
//! A node pairs one protocol adapter with a health record. The record is a
//! single immutable value behind an `ArcSwap`, so readers always see
//! latency, liveness and check time from the same write.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use tracing::debug;

use crate::adapter::{
    AdapterContext, AdapterRegistry, DirectAdapter, ProtocolAdapter, RejectAdapter,
};
use crate::config::ProxyConfig;
use crate::error::ConfigError;

/// Name of the built-in direct node.
pub const DIRECT: &str = "DIRECT";

/// Name of the built-in reject node.
pub const REJECT: &str = "REJECT";

/// Liveness of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// Not probed or dialed yet.
    Unknown,
    Alive,
    Dead,
}

/// One health observation. Latency is only ever present on an alive record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthRecord {
    liveness: Liveness,
    latency: Option<Duration>,
    checked_at: Option<Instant>,
}

impl HealthRecord {
    pub const fn unknown() -> Self {
        Self {
            liveness: Liveness::Unknown,
            latency: None,
            checked_at: None,
        }
    }

    /// Alive with a measured latency.
    pub fn alive(latency: Duration, checked_at: Instant) -> Self {
        Self {
            liveness: Liveness::Alive,
            latency: Some(latency),
            checked_at: Some(checked_at),
        }
    }

    /// Alive without a measurement (successful dial).
    pub fn reachable(latency: Option<Duration>, checked_at: Instant) -> Self {
        Self {
            liveness: Liveness::Alive,
            latency,
            checked_at: Some(checked_at),
        }
    }

    pub fn dead(checked_at: Instant) -> Self {
        Self {
            liveness: Liveness::Dead,
            latency: None,
            checked_at: Some(checked_at),
        }
    }

    pub fn liveness(&self) -> Liveness {
        self.liveness
    }

    pub fn is_alive(&self) -> bool {
        self.liveness == Liveness::Alive
    }

    pub fn latency(&self) -> Option<Duration> {
        self.latency
    }

    pub fn checked_at(&self) -> Option<Instant> {
        self.checked_at
    }
}

impl Default for HealthRecord {
    fn default() -> Self {
        Self::unknown()
    }
}

/// Outcome of using a node, reported by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

/// One outbound node.
pub struct OutboundNode {
    name: String,
    adapter: Arc<dyn ProtocolAdapter>,
    /// Definition the node was built from; `None` for built-ins.
    definition: Option<(ProxyConfig, AdapterContext)>,
    health: ArcSwap<HealthRecord>,
}

impl OutboundNode {
    pub fn new(name: impl Into<String>, adapter: Arc<dyn ProtocolAdapter>) -> Self {
        Self {
            name: name.into(),
            adapter,
            definition: None,
            health: ArcSwap::from_pointee(HealthRecord::unknown()),
        }
    }

    fn from_definition(
        config: &ProxyConfig,
        ctx: &AdapterContext,
        adapters: &AdapterRegistry,
    ) -> Result<Self, ConfigError> {
        let adapter = adapters.build(config, ctx)?;
        let mut node = Self::new(config.name.clone(), adapter);
        node.definition = Some((config.clone(), *ctx));
        Ok(node)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &'static str {
        self.adapter.kind()
    }

    pub fn adapter(&self) -> &Arc<dyn ProtocolAdapter> {
        &self.adapter
    }

    /// Current health record.
    pub fn health(&self) -> HealthRecord {
        **self.health.load()
    }

    /// Store `record` unless a newer observation is already in place.
    ///
    /// Returns whether the record was applied.
    pub fn record(&self, record: HealthRecord) -> bool {
        let mut applied = false;
        self.health.rcu(|current| {
            applied = match (current.checked_at, record.checked_at) {
                (Some(existing), Some(incoming)) => incoming >= existing,
                (None, _) => true,
                (Some(_), None) => false,
            };
            if applied {
                Arc::new(record)
            } else {
                Arc::clone(current)
            }
        });
        applied
    }

    /// Apply a dial outcome immediately.
    ///
    /// A success keeps the last measured latency.
    pub fn report(&self, outcome: Outcome) {
        let now = Instant::now();
        let record = match outcome {
            Outcome::Success => HealthRecord::reachable(self.health().latency(), now),
            Outcome::Failure => HealthRecord::dead(now),
        };
        self.record(record);
        debug!(node = %self.name, outcome = ?outcome, "Node health reported");
    }
}

impl fmt::Debug for OutboundNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutboundNode")
            .field("name", &self.name)
            .field("kind", &self.kind())
            .field("health", &self.health())
            .finish()
    }
}

/// Index of a node in its registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeIndex(usize);

impl NodeIndex {
    pub fn get(self) -> usize {
        self.0
    }
}

/// Arena of every node in one configuration, including `DIRECT` and
/// `REJECT`. Groups refer to nodes by [`NodeIndex`].
#[derive(Debug, Default)]
pub struct NodeRegistry {
    nodes: Vec<Arc<OutboundNode>>,
    by_name: HashMap<String, NodeIndex>,
}

impl NodeRegistry {
    /// Build a registry from node definitions.
    ///
    /// Nodes whose definition is unchanged from `previous` are carried over
    /// as-is, keeping their health record.
    pub fn build(
        proxies: &[ProxyConfig],
        ctx: &AdapterContext,
        adapters: &AdapterRegistry,
        previous: Option<&NodeRegistry>,
    ) -> Result<Self, ConfigError> {
        let mut registry = Self::default();

        let carried = |name: &str| previous.and_then(|p| p.get_by_name(name)).cloned();

        // Built-ins are rebuilt so they pick up the current connect timeout.
        let direct = OutboundNode::new(DIRECT, Arc::new(DirectAdapter::new(ctx.connect_timeout)));
        let reject = OutboundNode::new(REJECT, Arc::new(RejectAdapter));
        for builtin in [direct, reject] {
            if let Some(old) = carried(builtin.name()) {
                builtin.health.store(old.health.load_full());
            }
            registry.insert(Arc::new(builtin))?;
        }

        for config in proxies {
            if registry.by_name.contains_key(&config.name) {
                return Err(ConfigError::DuplicateNode(config.name.clone()));
            }
            let reused = carried(&config.name).filter(|node| {
                node.definition
                    .as_ref()
                    .is_some_and(|(c, x)| c == config && x == ctx)
            });
            let node = match reused {
                Some(node) => node,
                None => Arc::new(OutboundNode::from_definition(config, ctx, adapters)?),
            };
            registry.insert(node)?;
        }

        Ok(registry)
    }

    /// Registry of the built-ins followed by already-built `nodes`.
    pub fn from_nodes(nodes: Vec<Arc<OutboundNode>>) -> Result<Self, ConfigError> {
        let mut registry = Self::build(
            &[],
            &AdapterContext::default(),
            &AdapterRegistry::empty(),
            None,
        )?;
        for node in nodes {
            registry.insert(node)?;
        }
        Ok(registry)
    }

    fn insert(&mut self, node: Arc<OutboundNode>) -> Result<NodeIndex, ConfigError> {
        if self.by_name.contains_key(node.name()) {
            return Err(ConfigError::DuplicateNode(node.name().to_string()));
        }
        let index = NodeIndex(self.nodes.len());
        self.by_name.insert(node.name().to_string(), index);
        self.nodes.push(node);
        Ok(index)
    }

    pub fn get(&self, index: NodeIndex) -> Option<&Arc<OutboundNode>> {
        self.nodes.get(index.0)
    }

    pub fn index_of(&self, name: &str) -> Option<NodeIndex> {
        self.by_name.get(name).copied()
    }

    pub fn get_by_name(&self, name: &str) -> Option<&Arc<OutboundNode>> {
        self.index_of(name).and_then(|i| self.get(i))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeIndex, &Arc<OutboundNode>)> {
        self.nodes.iter().enumerate().map(|(i, n)| (NodeIndex(i), n))
    }
}
