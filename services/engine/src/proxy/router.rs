//! Runtime snapshot and routing decisions.
//!
//! Everything a routing decision reads (node registry, groups, rules, GEOIP
//! table) lives in one immutable [`Snapshot`]. The [`Router`] publishes it
//! through an `ArcSwap`:
//! - Readers load the current snapshot without locking.
//! - A reload builds and validates a complete new snapshot first, then swaps
//!   it in with a single pointer store. A rejected config never becomes
//!   visible.
//! - Sessions keep the `Arc<Snapshot>` they were routed with, so a reload
//!   never pulls nodes out from under an established connection.
//!
//! Per-node health is not part of the snapshot; it is swapped per node by
//! the health checker and by dial reports.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tracing::{debug, info};

use super::geoip::{GeoIpResolver, StaticGeoIp};
use super::group::{HealthCheckSettings, ProxyGroup};
use super::health::ProbeTarget;
use super::metadata::ConnMetadata;
use super::node::{NodeIndex, NodeRegistry, OutboundNode, DIRECT};
use super::rules::{RoutingTable, Target};
use crate::adapter::{AdapterContext, AdapterRegistry};
use crate::config::{DispatcherConfig, EngineConfig, Policy, ProxyGroupConfig};
use crate::error::{ConfigError, SelectError};

/// Result of routing one connection.
#[derive(Debug, Clone)]
pub struct RoutingDecision {
    /// Text of the matched rule; `None` when the default target was used.
    pub rule: Option<String>,
    /// Name of the group or node the rule points at.
    pub target: String,
    /// The group that chose `node`, if the target is a group.
    pub group: Option<Arc<ProxyGroup>>,
    pub node: NodeIndex,
}

/// Immutable view of one applied configuration.
#[derive(Debug)]
pub struct Snapshot {
    registry: Arc<NodeRegistry>,
    groups: Vec<Arc<ProxyGroup>>,
    group_by_name: HashMap<String, usize>,
    table: RoutingTable,
    geoip: Arc<dyn GeoIpResolver>,
    dispatcher: DispatcherConfig,
}

impl Snapshot {
    /// Validate `config` and build a snapshot from it.
    ///
    /// Unchanged nodes and manual selections are carried over from
    /// `previous`.
    pub fn build(
        config: &EngineConfig,
        adapters: &AdapterRegistry,
        previous: Option<&Snapshot>,
    ) -> Result<Self, ConfigError> {
        let ctx = AdapterContext {
            connect_timeout: config.dispatcher.connect_timeout(),
        };
        let registry = Arc::new(NodeRegistry::build(
            &config.proxies,
            &ctx,
            adapters,
            previous.map(|p| p.registry.as_ref()),
        )?);

        let mut groups = Vec::with_capacity(config.proxy_groups.len());
        let mut group_by_name = HashMap::with_capacity(config.proxy_groups.len());
        for group_config in &config.proxy_groups {
            if registry.index_of(&group_config.name).is_some()
                || group_by_name.contains_key(&group_config.name)
            {
                return Err(ConfigError::NameCollision(group_config.name.clone()));
            }

            let group = build_group(group_config, &registry)?;
            if let Some(pinned) = previous.and_then(|p| p.pinned_selection(&group_config.name)) {
                if group.set_manual_selection(&registry, &pinned).is_ok() {
                    debug!(group = %group.name(), node = %pinned, "Carried over manual selection");
                }
            }

            group_by_name.insert(group_config.name.clone(), groups.len());
            groups.push(Arc::new(group));
        }

        let direct = registry
            .index_of(DIRECT)
            .ok_or_else(|| ConfigError::UnknownTarget {
                rule: "MATCH".to_string(),
                target: DIRECT.to_string(),
            })?;
        let table = RoutingTable::build(&config.rules, Target::Node(direct), |name| {
            group_by_name
                .get(name)
                .map(|&g| Target::Group(g))
                .or_else(|| registry.index_of(name).map(Target::Node))
        })?;

        Ok(Self {
            registry,
            groups,
            group_by_name,
            table,
            geoip: Arc::new(StaticGeoIp::new(&config.geoip)),
            dispatcher: config.dispatcher.clone(),
        })
    }

    /// Snapshot with only the built-in nodes; everything goes `DIRECT`.
    pub fn empty() -> Result<Self, ConfigError> {
        Self::build(&EngineConfig::default(), &AdapterRegistry::empty(), None)
    }

    /// Replace the GEOIP resolver.
    pub fn with_geoip(mut self, geoip: Arc<dyn GeoIpResolver>) -> Self {
        self.geoip = geoip;
        self
    }

    /// Route `meta`: first matching rule wins, groups pick a member.
    pub fn route(&self, meta: &ConnMetadata) -> Result<RoutingDecision, SelectError> {
        let (rule, target) = match self.table.first_match(meta, self.geoip.as_ref()) {
            Some(rule) => (Some(rule.text.clone()), rule.target),
            None => (None, self.table.default_target()),
        };

        let decision = match target {
            Target::Node(node) => RoutingDecision {
                rule,
                target: self.node_name(node).to_string(),
                group: None,
                node,
            },
            Target::Group(g) => {
                let group = self
                    .groups
                    .get(g)
                    .ok_or_else(|| SelectError::UnknownGroup(g.to_string()))?;
                let node = group.select(&self.registry)?;
                RoutingDecision {
                    rule,
                    target: group.name().to_string(),
                    group: Some(Arc::clone(group)),
                    node,
                }
            }
        };

        debug!(
            rule = decision.rule.as_deref().unwrap_or("default"),
            target = %decision.target,
            node = %self.node_name(decision.node),
            "Routed connection"
        );
        Ok(decision)
    }

    /// Pin `node` in the select group `group`.
    pub fn select_proxy(&self, group: &str, node: &str) -> Result<(), SelectError> {
        self.group(group)
            .ok_or_else(|| SelectError::UnknownGroup(group.to_string()))?
            .set_manual_selection(&self.registry, node)
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn groups(&self) -> &[Arc<ProxyGroup>] {
        &self.groups
    }

    pub fn group(&self, name: &str) -> Option<&Arc<ProxyGroup>> {
        self.group_by_name.get(name).and_then(|&g| self.groups.get(g))
    }

    pub fn node(&self, index: NodeIndex) -> Option<&Arc<OutboundNode>> {
        self.registry.get(index)
    }

    pub fn table(&self) -> &RoutingTable {
        &self.table
    }

    pub fn dispatcher(&self) -> &DispatcherConfig {
        &self.dispatcher
    }

    fn node_name(&self, index: NodeIndex) -> &str {
        self.registry.get(index).map(|n| n.name()).unwrap_or("?")
    }

    fn pinned_selection(&self, group: &str) -> Option<String> {
        let group = self.group(group)?;
        if group.policy() != Policy::Select {
            return None;
        }
        group.pinned_name(&self.registry).map(str::to_string)
    }
}

fn build_group(
    config: &ProxyGroupConfig,
    registry: &NodeRegistry,
) -> Result<ProxyGroup, ConfigError> {
    let members = config
        .proxies
        .iter()
        .map(|member| {
            registry
                .index_of(member)
                .ok_or_else(|| ConfigError::UnknownMember {
                    group: config.name.clone(),
                    member: member.clone(),
                })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let target = ProbeTarget::parse(&config.url).ok_or_else(|| ConfigError::InvalidProbeUrl {
        group: config.name.clone(),
        url: config.url.clone(),
    })?;

    let health_check = HealthCheckSettings {
        target,
        interval: (config.interval > 0).then(|| Duration::from_secs(config.interval)),
        timeout: Duration::from_millis(config.timeout),
        expected_status: config.expected_status.clone(),
    };

    ProxyGroup::new(config.name.clone(), config.policy, members, health_check)
}

/// Atomically swappable routing snapshot.
pub struct Router {
    snapshot: ArcSwap<Snapshot>,
}

impl Router {
    pub fn new(snapshot: Snapshot) -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(snapshot),
        }
    }

    /// Current snapshot. Hold the `Arc` for as long as a session needs a
    /// consistent view.
    pub fn load(&self) -> Arc<Snapshot> {
        self.snapshot.load_full()
    }

    /// Build a snapshot from `config` and swap it in. On error the current
    /// snapshot stays in place. Returns the replaced snapshot.
    pub fn reload(
        &self,
        config: &EngineConfig,
        adapters: &AdapterRegistry,
    ) -> Result<Arc<Snapshot>, ConfigError> {
        let current = self.snapshot.load_full();
        let next = Arc::new(Snapshot::build(config, adapters, Some(&current))?);

        info!(
            nodes = next.registry.len(),
            groups = next.groups.len(),
            rules = next.table.len(),
            "Routing snapshot swapped atomically"
        );
        Ok(self.snapshot.swap(next))
    }

    /// Swap in an already-built snapshot.
    pub fn store(&self, snapshot: Arc<Snapshot>) -> Arc<Snapshot> {
        self.snapshot.swap(snapshot)
    }

    pub fn route(&self, meta: &ConnMetadata) -> Result<RoutingDecision, SelectError> {
        self.snapshot.load().route(meta)
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router").field("snapshot", &self.snapshot.load()).finish()
    }
}
