//! Fault-domain topology.
//!
//! A [`Topology`] is an immutable snapshot built from configuration: the
//! domain membership, one consistent-hash ring per domain, and the resolved
//! replication factor and quorum. Configuration reloads build a new snapshot
//! and swap a single reference, so in-flight requests always observe one
//! consistent version. Placement is a pure function of (key, topology,
//! health snapshot), which is what lets independent callers agree on replica
//! sets without a placement-metadata store.

use std::collections::{BTreeMap, BTreeSet};

use tracing::warn;

use crate::config::StorageConfig;
use crate::error::StoreResult;
use crate::ring::HashRing;

/// One fault domain: a group of nodes assumed to fail together as a unit.
#[derive(Debug, Clone)]
pub struct FaultDomain {
    pub name: String,
    pub members: BTreeSet<String>,
    /// Health floor below which the domain is unavailable for writes.
    pub min_nodes: usize,
    pub replica_count: usize,
    pub accepts_writes: bool,
}

/// Immutable topology snapshot.
#[derive(Debug, Clone)]
pub struct Topology {
    domains: BTreeMap<String, FaultDomain>,
    rings: BTreeMap<String, HashRing>,
    active_domains: Vec<String>,
    standby_domain: Option<String>,
    replication_factor: usize,
    quorum: usize,
}

impl Topology {
    /// Build a snapshot from validated configuration.
    ///
    /// A replication factor above the active-domain count is clamped down
    /// (and logged) rather than rejected: fewer replicas is a safe
    /// degradation, an invalid topology is not.
    pub fn build(config: &StorageConfig) -> StoreResult<Topology> {
        config.validate()?;

        let mut members_by_domain: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for node in config.nodes.iter().filter(|n| n.enabled) {
            members_by_domain
                .entry(node.fault_domain.clone())
                .or_default()
                .insert(node.name.clone());
        }

        let standby_domain = if config.is_standby_enabled() {
            Some(config.standby_domain.clone())
        } else {
            None
        };

        // Every referenced domain gets an entry; an active domain without an
        // explicit [[domains]] block falls back to defaults.
        let mut referenced: Vec<String> = config.active_domains.clone();
        if let Some(standby) = &standby_domain {
            referenced.push(standby.clone());
        }
        for name in members_by_domain.keys() {
            if !referenced.contains(name) {
                warn!(
                    domain = name.as_str(),
                    "nodes assigned to a domain that is neither active nor standby"
                );
            }
        }

        let mut domains = BTreeMap::new();
        let mut rings = BTreeMap::new();
        for name in &referenced {
            let members = members_by_domain.remove(name).unwrap_or_default();
            let domain_config = config.domain(name);
            let domain = FaultDomain {
                name: name.clone(),
                min_nodes: domain_config.map(|d| d.min_nodes).unwrap_or(1),
                replica_count: domain_config.map(|d| d.replica_count).unwrap_or(1),
                accepts_writes: domain_config.map(|d| d.accepts_writes).unwrap_or(true),
                members: members.clone(),
            };
            rings.insert(
                name.clone(),
                HashRing::build(&members, config.virtual_nodes_per_node),
            );
            domains.insert(name.clone(), domain);
        }

        let active_count = config.active_domains.len();
        let replication_factor = match config.replication.factor {
            None => active_count.max(1),
            Some(factor) if factor > active_count => {
                warn!(
                    configured = factor,
                    active_domains = active_count,
                    "replication factor exceeds active-domain count, clamping"
                );
                active_count.max(1)
            }
            Some(factor) => factor.max(1),
        };
        let quorum = config.replication.effective_quorum(replication_factor);

        if active_count == 1 {
            warn!(
                domain = config.active_domains[0].as_str(),
                "single-domain mode: data will not be replicated across domains"
            );
        }

        Ok(Topology {
            domains,
            rings,
            active_domains: config.active_domains.clone(),
            standby_domain,
            replication_factor,
            quorum,
        })
    }

    pub fn is_initialized(&self) -> bool {
        !self.active_domains.is_empty()
    }

    /// Active domains in priority order.
    pub fn active_domains(&self) -> &[String] {
        &self.active_domains
    }

    pub fn standby_domain(&self) -> Option<&str> {
        self.standby_domain.as_deref()
    }

    pub fn is_standby_enabled(&self) -> bool {
        self.standby_domain.is_some()
    }

    /// Active domains followed by the standby domain, the order reads and
    /// deletes visit replicas.
    pub fn all_domains(&self) -> impl Iterator<Item = &str> {
        self.active_domains
            .iter()
            .map(String::as_str)
            .chain(self.standby_domain.as_deref())
    }

    pub fn domain(&self, name: &str) -> Option<&FaultDomain> {
        self.domains.get(name)
    }

    pub fn nodes_in(&self, name: &str) -> Option<&BTreeSet<String>> {
        self.domains.get(name).map(|d| &d.members)
    }

    pub fn ring(&self, name: &str) -> Option<&HashRing> {
        self.rings.get(name)
    }

    /// Domain a node belongs to, if any.
    pub fn node_domain(&self, node_name: &str) -> Option<&str> {
        self.domains
            .values()
            .find(|d| d.members.contains(node_name))
            .map(|d| d.name.as_str())
    }

    pub fn effective_replication_factor(&self) -> usize {
        self.replication_factor
    }

    pub fn effective_quorum(&self) -> usize {
        self.quorum
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;

    fn config(active: &[&str], standby: &str, factor: Option<usize>, quorum: &str) -> StorageConfig {
        let mut text = String::new();
        text.push_str(&format!(
            "active_domains = [{}]\n",
            active
                .iter()
                .map(|d| format!("\"{}\"", d))
                .collect::<Vec<_>>()
                .join(", ")
        ));
        if !standby.is_empty() {
            text.push_str(&format!("standby_domain = \"{}\"\n", standby));
        }
        if let Some(f) = factor {
            text.push_str(&format!("[replication]\nfactor = {}\nquorum = \"{}\"\n", f, quorum));
        } else {
            text.push_str(&format!("[replication]\nquorum = \"{}\"\n", quorum));
        }
        let mut config = StorageConfig::from_toml_str(&text).unwrap();
        for (i, domain) in active.iter().enumerate() {
            config.nodes.push(crate::config::NodeConfig {
                name: format!("node-{}", i),
                endpoint: format!("http://10.0.{}.1:9000", i),
                access_key: "ak".to_string(),
                secret_key: "sk".to_string(),
                fault_domain: domain.to_string(),
                enabled: true,
            });
        }
        config
    }

    #[test]
    fn quorum_never_exceeds_factor_or_domain_count() {
        for factor in 1..=4usize {
            for quorum in ["auto", "majority", "all", "1", "7"] {
                let config = config(&["a", "b", "c", "d"], "", Some(factor), quorum);
                let topology = Topology::build(&config).unwrap();
                let f = topology.effective_replication_factor();
                let q = topology.effective_quorum();
                assert!(q >= 1 && q <= f, "quorum {} factor {} mode {}", q, f, quorum);
                assert!(f <= topology.active_domains().len());
            }
        }
    }

    #[test]
    fn factor_clamped_to_active_domain_count() {
        let config = config(&["a", "b"], "", Some(5), "auto");
        let topology = Topology::build(&config).unwrap();
        assert_eq!(topology.effective_replication_factor(), 2);
        assert_eq!(topology.effective_quorum(), 2);
    }

    #[test]
    fn default_factor_is_active_domain_count() {
        let config = config(&["a", "b", "c"], "", None, "auto");
        let topology = Topology::build(&config).unwrap();
        assert_eq!(topology.effective_replication_factor(), 3);
        // auto with factor 3 is majority
        assert_eq!(topology.effective_quorum(), 2);
    }

    #[test]
    fn standby_is_tracked_separately_from_active() {
        let config = config(&["a", "b"], "reserve", None, "auto");
        let topology = Topology::build(&config).unwrap();
        assert!(topology.is_standby_enabled());
        assert_eq!(topology.standby_domain(), Some("reserve"));
        assert_eq!(
            topology.all_domains().collect::<Vec<_>>(),
            vec!["a", "b", "reserve"]
        );
    }

    #[test]
    fn node_domain_lookup() {
        let config = config(&["a", "b"], "", None, "auto");
        let topology = Topology::build(&config).unwrap();
        assert_eq!(topology.node_domain("node-0"), Some("a"));
        assert_eq!(topology.node_domain("node-1"), Some("b"));
        assert_eq!(topology.node_domain("ghost"), None);
    }

    #[test]
    fn uninitialized_topology() {
        let topology = Topology::build(&StorageConfig::default()).unwrap();
        assert!(!topology.is_initialized());
    }

    #[test]
    fn active_domain_without_explicit_config_gets_defaults() {
        let config = config(&["a"], "", None, "auto");
        let topology = Topology::build(&config).unwrap();
        let domain = topology.domain("a").unwrap();
        assert_eq!(domain.min_nodes, 1);
        assert!(domain.accepts_writes);
    }
}
