//! Proxy groups and selection policies.
//!
//! A group holds indices into the node registry, never the nodes
//! themselves. Every `select` reads each member's health record once, so a
//! decision is made against one consistent view even while the health
//! checker is writing.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, info};

use super::health::ProbeTarget;
use super::node::{HealthRecord, Liveness, NodeIndex, NodeRegistry, Outcome};
use crate::config::Policy;
use crate::error::{ConfigError, SelectError};

/// Health-check settings of one group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthCheckSettings {
    pub target: ProbeTarget,
    /// `None` disables periodic probing; triggered rounds still run.
    pub interval: Option<Duration>,
    pub timeout: Duration,
    /// Statuses counted as alive; empty accepts any.
    pub expected_status: Vec<u16>,
}

impl HealthCheckSettings {
    pub fn accepts(&self, status: u16) -> bool {
        self.expected_status.is_empty() || self.expected_status.contains(&status)
    }
}

/// A named set of nodes with a selection policy.
#[derive(Debug)]
pub struct ProxyGroup {
    name: String,
    policy: Policy,
    members: Vec<NodeIndex>,
    /// Position in `members` chosen by manual selection.
    pinned: AtomicUsize,
    rr_counter: AtomicUsize,
    health_check: HealthCheckSettings,
    trigger: Arc<Notify>,
}

impl ProxyGroup {
    pub fn new(
        name: impl Into<String>,
        policy: Policy,
        members: Vec<NodeIndex>,
        health_check: HealthCheckSettings,
    ) -> Result<Self, ConfigError> {
        let name = name.into();
        if members.is_empty() {
            return Err(ConfigError::EmptyGroup(name));
        }
        Ok(Self {
            name,
            policy,
            members,
            pinned: AtomicUsize::new(0),
            rr_counter: AtomicUsize::new(0),
            health_check,
            trigger: Arc::new(Notify::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn policy(&self) -> Policy {
        self.policy
    }

    pub fn members(&self) -> &[NodeIndex] {
        &self.members
    }

    pub fn health_check(&self) -> &HealthCheckSettings {
        &self.health_check
    }

    /// Pick the node for the next connection.
    pub fn select(&self, registry: &NodeRegistry) -> Result<NodeIndex, SelectError> {
        self.select_excluding(registry, &[])
    }

    /// Pick a node, skipping `excluded` (nodes already tried by a session).
    pub fn select_excluding(
        &self,
        registry: &NodeRegistry,
        excluded: &[NodeIndex],
    ) -> Result<NodeIndex, SelectError> {
        let candidates: Vec<(NodeIndex, HealthRecord)> = self
            .members
            .iter()
            .filter(|index| !excluded.contains(index))
            .filter_map(|&index| registry.get(index).map(|node| (index, node.health())))
            .collect();

        let first_with = |liveness: Liveness| {
            candidates
                .iter()
                .find(|(_, health)| health.liveness() == liveness)
                .map(|(index, _)| *index)
        };

        let chosen = match self.policy {
            // Manual pins ignore health.
            Policy::Select => {
                let pinned = self.pinned_index();
                (!excluded.contains(&pinned)).then_some(pinned)
            }
            Policy::UrlTest => candidates
                .iter()
                .filter(|(_, health)| health.is_alive())
                .filter_map(|(index, health)| health.latency().map(|latency| (*index, latency)))
                .min_by_key(|(_, latency)| *latency)
                .map(|(index, _)| index)
                .or_else(|| first_with(Liveness::Alive))
                .or_else(|| first_with(Liveness::Unknown)),
            Policy::Fallback => {
                first_with(Liveness::Alive).or_else(|| first_with(Liveness::Unknown))
            }
            Policy::RoundRobin => {
                let usable: Vec<NodeIndex> = candidates
                    .iter()
                    .filter(|(_, health)| health.liveness() != Liveness::Dead)
                    .map(|(index, _)| *index)
                    .collect();
                if usable.is_empty() {
                    None
                } else {
                    let turn = self.rr_counter.fetch_add(1, Ordering::Relaxed);
                    Some(usable[turn % usable.len()])
                }
            }
        };

        chosen.ok_or_else(|| self.no_available())
    }

    /// Pin `node_name` for a select group.
    pub fn set_manual_selection(
        &self,
        registry: &NodeRegistry,
        node_name: &str,
    ) -> Result<(), SelectError> {
        if self.policy != Policy::Select {
            return Err(SelectError::NotSelectable {
                group: self.name.clone(),
            });
        }

        let position = self
            .members
            .iter()
            .position(|&index| registry.get(index).is_some_and(|node| node.name() == node_name))
            .ok_or_else(|| SelectError::UnknownNode {
                group: self.name.clone(),
                node: node_name.to_string(),
            })?;

        self.pinned.store(position, Ordering::Release);
        info!(group = %self.name, node = %node_name, "Manual selection updated");
        Ok(())
    }

    /// Node currently pinned by manual selection (select groups only).
    pub fn pinned_name<'a>(&self, registry: &'a NodeRegistry) -> Option<&'a str> {
        if self.policy != Policy::Select {
            return None;
        }
        registry.get(self.pinned_index()).map(|node| node.name())
    }

    /// Record a dial outcome for a member so the next `select` sees it.
    pub fn report(&self, registry: &NodeRegistry, node: NodeIndex, outcome: Outcome) {
        if !self.members.contains(&node) {
            return;
        }
        if let Some(node) = registry.get(node) {
            node.report(outcome);
            debug!(
                group = %self.name,
                node = %node.name(),
                outcome = ?outcome,
                "Group member reported"
            );
        }
    }

    /// Ask the group's health checker for an immediate probe round.
    pub fn trigger_probe(&self) {
        self.trigger.notify_one();
    }

    pub(crate) fn trigger(&self) -> Arc<Notify> {
        Arc::clone(&self.trigger)
    }

    fn pinned_index(&self) -> NodeIndex {
        let position = self.pinned.load(Ordering::Acquire);
        self.members
            .get(position)
            .copied()
            .unwrap_or(self.members[0])
    }

    fn no_available(&self) -> SelectError {
        SelectError::NoAvailableNode {
            group: self.name.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::RejectAdapter;
    use crate::proxy::node::OutboundNode;
    use rstest::rstest;
    use std::time::Instant;

    fn settings() -> HealthCheckSettings {
        HealthCheckSettings {
            target: ProbeTarget::parse("http://probe.test/generate_204").unwrap(),
            interval: None,
            timeout: Duration::from_secs(1),
            expected_status: Vec::new(),
        }
    }

    /// Registry with DIRECT, REJECT and `names`; returns the member indices.
    fn registry(names: &[&str]) -> (NodeRegistry, Vec<NodeIndex>) {
        let mut nodes = Vec::new();
        for name in names {
            nodes.push(Arc::new(OutboundNode::new(*name, Arc::new(RejectAdapter))));
        }
        let registry = NodeRegistry::from_nodes(nodes).unwrap();
        let indices = names.iter().map(|n| registry.index_of(n).unwrap()).collect();
        (registry, indices)
    }

    fn group(policy: Policy, members: Vec<NodeIndex>) -> ProxyGroup {
        ProxyGroup::new("g", policy, members, settings()).unwrap()
    }

    fn set(registry: &NodeRegistry, name: &str, record: HealthRecord) {
        registry.get_by_name(name).unwrap().record(record);
    }

    fn name(registry: &NodeRegistry, index: NodeIndex) -> &str {
        registry.get(index).unwrap().name()
    }

    #[test]
    fn test_empty_group_rejected() {
        let err = ProxyGroup::new("g", Policy::Fallback, vec![], settings()).unwrap_err();
        assert_eq!(err, ConfigError::EmptyGroup("g".to_string()));
    }

    #[test]
    fn test_url_test_picks_lowest_latency() {
        let (reg, members) = registry(&["a", "b", "c"]);
        let now = Instant::now();
        set(&reg, "a", HealthRecord::alive(Duration::from_millis(80), now));
        set(&reg, "b", HealthRecord::alive(Duration::from_millis(20), now));
        set(&reg, "c", HealthRecord::dead(now));

        let g = group(Policy::UrlTest, members);
        assert_eq!(name(&reg, g.select(&reg).unwrap()), "b");
    }

    #[test]
    fn test_url_test_ties_break_by_list_order() {
        let (reg, members) = registry(&["a", "b"]);
        let now = Instant::now();
        set(&reg, "a", HealthRecord::alive(Duration::from_millis(20), now));
        set(&reg, "b", HealthRecord::alive(Duration::from_millis(20), now));

        let g = group(Policy::UrlTest, members);
        assert_eq!(name(&reg, g.select(&reg).unwrap()), "a");
    }

    #[test]
    fn test_url_test_falls_back_to_unknown() {
        let (reg, members) = registry(&["a", "b"]);
        set(&reg, "a", HealthRecord::dead(Instant::now()));

        let g = group(Policy::UrlTest, members);
        assert_eq!(name(&reg, g.select(&reg).unwrap()), "b");
    }

    #[rstest]
    #[case(Policy::UrlTest)]
    #[case(Policy::Fallback)]
    #[case(Policy::RoundRobin)]
    fn test_all_dead_is_no_available_node(#[case] policy: Policy) {
        let (reg, members) = registry(&["a", "b"]);
        let now = Instant::now();
        set(&reg, "a", HealthRecord::dead(now));
        set(&reg, "b", HealthRecord::dead(now));

        let g = group(policy, members);
        assert_eq!(
            g.select(&reg).unwrap_err(),
            SelectError::NoAvailableNode {
                group: "g".to_string()
            }
        );
    }

    #[test]
    fn test_fallback_prefers_first_alive() {
        let (reg, members) = registry(&["a", "b", "c"]);
        let now = Instant::now();
        set(&reg, "a", HealthRecord::dead(now));
        set(&reg, "c", HealthRecord::alive(Duration::from_millis(5), now));

        let g = group(Policy::Fallback, members);
        assert_eq!(name(&reg, g.select(&reg).unwrap()), "c");
    }

    #[test]
    fn test_report_failure_affects_next_select() {
        let (reg, members) = registry(&["a", "b"]);
        let g = group(Policy::Fallback, members.clone());

        assert_eq!(name(&reg, g.select(&reg).unwrap()), "a");
        g.report(&reg, members[0], Outcome::Failure);
        assert_eq!(name(&reg, g.select(&reg).unwrap()), "b");
        g.report(&reg, members[0], Outcome::Success);
        assert_eq!(name(&reg, g.select(&reg).unwrap()), "a");
    }

    #[test]
    fn test_round_robin_rotates_and_skips_dead() {
        let (reg, members) = registry(&["a", "b", "c"]);
        set(&reg, "b", HealthRecord::dead(Instant::now()));
        let g = group(Policy::RoundRobin, members);

        let picks: Vec<_> = (0..4)
            .map(|_| name(&reg, g.select(&reg).unwrap()).to_string())
            .collect();
        assert_eq!(picks, vec!["a", "c", "a", "c"]);
    }

    #[test]
    fn test_select_excluding() {
        let (reg, members) = registry(&["a", "b"]);
        let g = group(Policy::Fallback, members.clone());
        assert_eq!(name(&reg, g.select_excluding(&reg, &[members[0]]).unwrap()), "b");
        assert!(g.select_excluding(&reg, &members).is_err());
    }

    #[test]
    fn test_manual_selection() {
        let (reg, members) = registry(&["a", "b"]);
        let g = group(Policy::Select, members);
        assert_eq!(name(&reg, g.select(&reg).unwrap()), "a");

        g.set_manual_selection(&reg, "b").unwrap();
        assert_eq!(name(&reg, g.select(&reg).unwrap()), "b");
        assert_eq!(g.pinned_name(&reg), Some("b"));

        // Health does not override a manual pin.
        set(&reg, "b", HealthRecord::dead(Instant::now()));
        assert_eq!(name(&reg, g.select(&reg).unwrap()), "b");

        assert_eq!(
            g.set_manual_selection(&reg, "zzz").unwrap_err(),
            SelectError::UnknownNode {
                group: "g".to_string(),
                node: "zzz".to_string()
            }
        );
        // DIRECT exists in the registry but is not a member.
        assert!(g.set_manual_selection(&reg, "DIRECT").is_err());
    }

    #[test]
    fn test_manual_selection_requires_select_policy() {
        let (reg, members) = registry(&["a", "b"]);
        let g = group(Policy::UrlTest, members);
        assert_eq!(
            g.set_manual_selection(&reg, "b").unwrap_err(),
            SelectError::NotSelectable {
                group: "g".to_string()
            }
        );
    }

    #[test]
    fn test_expected_status() {
        let mut s = settings();
        assert!(s.accepts(500));
        s.expected_status = vec![204];
        assert!(s.accepts(204));
        assert!(!s.accepts(200));
    }
}
