//! Replica placement.
//!
//! Placement is computed, never stored: for an object key and one topology
//! version, the replica set is the ring primary of each selected domain.
//! The only moving input is the health snapshot, so a retry after a health
//! flip may retarget a node inside a domain; availability is preferred over
//! perfect key stability.

use std::collections::BTreeSet;

use tracing::{debug, warn};

use crate::health::HealthMonitor;
use crate::topology::Topology;

/// One selected replica location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaTarget {
    pub domain: String,
    pub node: String,
}

/// Outcome of a placement computation.
#[derive(Debug, Clone, Default)]
pub struct PlacementDecision {
    /// Selected (domain, node) targets, in domain priority order.
    pub targets: Vec<ReplicaTarget>,
    /// Active domains that were skipped as unavailable for writes.
    pub unavailable_domains: Vec<String>,
    /// True when the standby domain was promoted into the write path.
    pub promoted_standby: bool,
}

impl PlacementDecision {
    pub fn domains_written(&self) -> BTreeSet<&str> {
        self.targets.iter().map(|t| t.domain.as_str()).collect()
    }
}

/// A domain is available for writes iff it accepts writes and its healthy
/// membership meets the configured floor.
pub fn domain_available_for_writes(
    topology: &Topology,
    health: &HealthMonitor,
    domain_name: &str,
) -> bool {
    match topology.domain(domain_name) {
        Some(domain) => {
            domain.accepts_writes && health.healthy_node_count(&domain.members) >= domain.min_nodes
        }
        None => false,
    }
}

/// Whether the standby domain could take writes right now. The standby's
/// `accepts_writes` flag is ignored here: promotion is exactly the act of
/// overriding it while an active domain is down.
fn standby_available(topology: &Topology, health: &HealthMonitor) -> bool {
    match topology.standby_domain().and_then(|s| topology.domain(s)) {
        Some(domain) => health.healthy_node_count(&domain.members) >= domain.min_nodes.max(1),
        None => false,
    }
}

/// Select one target node per domain for `key`.
///
/// Active domains are considered in priority order, filtered to those
/// available for writes, and the first `effective_replication_factor()` are
/// taken. When fewer active domains are available than the factor requires,
/// `allow_standby_promotion` is set, and a standby domain is healthy, the
/// standby is promoted into the write path; promoted writes count as
/// degraded and must be tracked for reconciliation by the caller.
///
/// Within each selected domain the ring primary is used, walking to ring
/// successors when the primary is offline; a domain with no online node
/// contributes no target.
pub fn replicas_for(
    key: &str,
    topology: &Topology,
    health: &HealthMonitor,
    allow_standby_promotion: bool,
) -> PlacementDecision {
    let factor = topology.effective_replication_factor();
    let mut decision = PlacementDecision::default();

    let mut selected_domains: Vec<&str> = Vec::with_capacity(factor);
    for domain_name in topology.active_domains() {
        if selected_domains.len() == factor {
            break;
        }
        if domain_available_for_writes(topology, health, domain_name) {
            selected_domains.push(domain_name);
        } else {
            decision.unavailable_domains.push(domain_name.clone());
            warn!(domain = domain_name.as_str(), "domain unavailable for writes");
        }
    }

    if selected_domains.len() < factor
        && allow_standby_promotion
        && standby_available(topology, health)
    {
        if let Some(standby) = topology.standby_domain() {
            debug!(
                standby,
                available = selected_domains.len(),
                required = factor,
                "promoting standby domain into the write path"
            );
            selected_domains.push(standby);
            decision.promoted_standby = true;
        }
    }

    for domain_name in selected_domains {
        let Some(ring) = topology.ring(domain_name) else {
            continue;
        };
        match ring.primary_where(key, |node| health.is_online(node)) {
            Some(node) => decision.targets.push(ReplicaTarget {
                domain: domain_name.to_string(),
                node: node.to_string(),
            }),
            None => {
                warn!(domain = domain_name, "no online node in domain for key placement");
            }
        }
    }

    decision
}

/// Candidate nodes for reads: every domain in priority order (standby last),
/// each contributing its ring candidates primary-first.
pub fn read_candidates<'a>(
    key: &str,
    topology: &'a Topology,
) -> Vec<(&'a str, Vec<String>)> {
    topology
        .all_domains()
        .filter_map(|domain_name| {
            let ring = topology.ring(domain_name)?;
            let candidates: Vec<String> =
                ring.candidates(key).into_iter().map(str::to_string).collect();
            if candidates.is_empty() {
                None
            } else {
                Some((domain_name, candidates))
            }
        })
        .collect()
}

/// Conservative delete fan-out: the ring primary of every domain, active or
/// standby, that a live or historical placement could have used.
pub fn delete_targets(key: &str, topology: &Topology) -> Vec<ReplicaTarget> {
    topology
        .all_domains()
        .filter_map(|domain_name| {
            let ring = topology.ring(domain_name)?;
            ring.primary(key).map(|node| ReplicaTarget {
                domain: domain_name.to_string(),
                node: node.to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::cluster::{ClusterHandle, ClusterState};
    use crate::config::{DomainConfig, NodeConfig, StorageConfig};

    fn node(name: &str, domain: &str) -> NodeConfig {
        NodeConfig {
            name: name.to_string(),
            endpoint: "http://127.0.0.1:9000".to_string(),
            access_key: "ak".to_string(),
            secret_key: "sk".to_string(),
            fault_domain: domain.to_string(),
            enabled: true,
        }
    }

    /// Two active domains with two nodes each, plus a single-node standby.
    fn test_config() -> StorageConfig {
        StorageConfig {
            nodes: vec![
                node("a1", "dc-a"),
                node("a2", "dc-a"),
                node("b1", "dc-b"),
                node("b2", "dc-b"),
                node("r1", "dc-reserve"),
            ],
            domains: vec![
                DomainConfig {
                    name: "dc-a".to_string(),
                    min_nodes: 1,
                    replica_count: 1,
                    accepts_writes: true,
                },
                DomainConfig {
                    name: "dc-b".to_string(),
                    min_nodes: 1,
                    replica_count: 1,
                    accepts_writes: true,
                },
                DomainConfig {
                    name: "dc-reserve".to_string(),
                    min_nodes: 1,
                    replica_count: 1,
                    accepts_writes: false,
                },
            ],
            active_domains: vec!["dc-a".to_string(), "dc-b".to_string()],
            standby_domain: "dc-reserve".to_string(),
            ..Default::default()
        }
    }

    fn setup() -> (Arc<ClusterHandle>, Arc<HealthMonitor>) {
        let state = ClusterState::build(test_config()).unwrap();
        let cluster = Arc::new(ClusterHandle::new(state));
        let monitor = Arc::new(HealthMonitor::new(cluster.clone()));
        (cluster, monitor)
    }

    #[test]
    fn one_target_per_active_domain() {
        let (cluster, health) = setup();
        let state = cluster.load();
        let decision = replicas_for("hash123", &state.topology, &health, true);

        assert_eq!(decision.targets.len(), 2);
        assert_eq!(decision.targets[0].domain, "dc-a");
        assert_eq!(decision.targets[1].domain, "dc-b");
        assert!(!decision.promoted_standby);
        assert!(decision.unavailable_domains.is_empty());
    }

    #[test]
    fn placement_is_deterministic() {
        let (cluster, health) = setup();
        let state = cluster.load();
        let first = replicas_for("hash123", &state.topology, &health, true);
        let second = replicas_for("hash123", &state.topology, &health, true);
        assert_eq!(first.targets, second.targets);
    }

    #[test]
    fn offline_primary_falls_back_to_domain_sibling() {
        let (cluster, health) = setup();
        let state = cluster.load();

        let baseline = replicas_for("hash123", &state.topology, &health, true);
        let primary_a = baseline
            .targets
            .iter()
            .find(|t| t.domain == "dc-a")
            .unwrap()
            .node
            .clone();
        health.force_offline(&primary_a);

        let rerouted = replicas_for("hash123", &state.topology, &health, true);
        let new_a = rerouted
            .targets
            .iter()
            .find(|t| t.domain == "dc-a")
            .unwrap();
        assert_ne!(new_a.node, primary_a);
        assert!(state
            .topology
            .nodes_in("dc-a")
            .unwrap()
            .contains(&new_a.node));
    }

    #[test]
    fn fully_offline_domain_promotes_standby() {
        let (cluster, health) = setup();
        let state = cluster.load();

        health.force_offline("b1");
        health.force_offline("b2");

        let decision = replicas_for("hash123", &state.topology, &health, true);
        assert!(decision.promoted_standby);
        assert_eq!(decision.unavailable_domains, vec!["dc-b"]);
        let domains = decision.domains_written();
        assert!(domains.contains("dc-a"));
        assert!(domains.contains("dc-reserve"));
    }

    #[test]
    fn promotion_disabled_leaves_target_list_short() {
        let (cluster, health) = setup();
        let state = cluster.load();

        health.force_offline("b1");
        health.force_offline("b2");

        let decision = replicas_for("hash123", &state.topology, &health, false);
        assert!(!decision.promoted_standby);
        assert_eq!(decision.targets.len(), 1);
        assert_eq!(decision.targets[0].domain, "dc-a");
    }

    #[test]
    fn no_standby_means_short_target_list() {
        let mut config = test_config();
        config.standby_domain = String::new();
        let state = ClusterState::build(config).unwrap();
        let cluster = Arc::new(ClusterHandle::new(state));
        let health = HealthMonitor::new(cluster.clone());

        health.force_offline("b1");
        health.force_offline("b2");

        let state = cluster.load();
        let decision = replicas_for("hash123", &state.topology, &health, true);
        assert_eq!(decision.targets.len(), 1);
        assert!(!decision.promoted_standby);
    }

    #[test]
    fn read_candidates_cover_all_domains_primary_first() {
        let (cluster, _health) = setup();
        let state = cluster.load();
        let candidates = read_candidates("hash123", &state.topology);

        assert_eq!(candidates.len(), 3);
        assert_eq!(candidates[0].0, "dc-a");
        assert_eq!(candidates[2].0, "dc-reserve");
        assert_eq!(
            candidates[0].1[0],
            state.topology.ring("dc-a").unwrap().primary("hash123").unwrap()
        );
    }

    #[test]
    fn delete_targets_include_standby() {
        let (cluster, _health) = setup();
        let state = cluster.load();
        let targets = delete_targets("hash123", &state.topology);
        assert_eq!(targets.len(), 3);
        assert!(targets.iter().any(|t| t.domain == "dc-reserve"));
    }
}
