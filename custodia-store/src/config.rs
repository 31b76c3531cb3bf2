//! Storage topology configuration
//!
//! Loads the node/domain layout from a TOML file and validates it at
//! construction. The configuration can be hot-reloaded: a reload builds a
//! fresh [`crate::topology::Topology`] snapshot and swaps it atomically, so
//! request processing never observes a half-updated layout.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{StoreError, StoreResult};

/// A single S3-compatible storage node. The node's `name` doubles as the
/// bucket name used on that node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeConfig {
    pub name: String,
    pub endpoint: String,
    pub access_key: String,
    pub secret_key: String,
    /// Fault domain this node belongs to.
    pub fault_domain: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Behavior of one fault domain.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DomainConfig {
    pub name: String,
    /// Health floor: below this many healthy nodes the domain is treated as
    /// unavailable for writes.
    #[serde(default = "default_one")]
    pub min_nodes: usize,
    #[serde(default = "default_one")]
    pub replica_count: usize,
    #[serde(default = "default_true")]
    pub accepts_writes: bool,
}

/// Replica placement strategy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReplicationConfig {
    /// Replica count per object; defaults to the active-domain count.
    pub factor: Option<usize>,
    /// Quorum strategy: "auto" | "majority" | "all" | an explicit number.
    pub quorum: String,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            factor: None,
            quorum: "auto".to_string(),
        }
    }
}

impl ReplicationConfig {
    /// Resolve the quorum strategy against an effective replication factor.
    /// An unparseable value falls back to "auto" with a warning.
    pub fn effective_quorum(&self, effective_factor: usize) -> usize {
        let auto = |f: usize| if f <= 2 { f } else { f / 2 + 1 };
        match self.quorum.trim().to_lowercase().as_str() {
            "" | "auto" => auto(effective_factor),
            "majority" => effective_factor / 2 + 1,
            "all" => effective_factor,
            other => match other.parse::<usize>() {
                Ok(n) => n.clamp(1, effective_factor),
                Err(_) => {
                    warn!("invalid quorum config '{}', using 'auto'", self.quorum);
                    auto(effective_factor)
                }
            },
        }
    }
}

/// Degraded-write policy: whether a write may proceed with fewer replicas
/// than the configured factor when a domain is unavailable.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DegradedWriteConfig {
    pub enabled: bool,
    /// Writes are rejected outright below this replica count.
    pub min_replicas: usize,
    /// Record degraded writes so missing replicas are backfilled once the
    /// domain recovers.
    pub track_for_sync: bool,
}

impl Default for DegradedWriteConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min_replicas: 1,
            track_for_sync: true,
        }
    }
}

/// Health probe settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HealthConfig {
    #[serde(with = "humantime_serde")]
    pub probe_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub probe_timeout: Duration,
    /// Consecutive probe failures before a node flips offline.
    pub failure_threshold: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(5),
            failure_threshold: 3,
        }
    }
}

/// Anti-entropy repair settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RepairConfig {
    pub enabled: bool,
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Bounded lease on the cluster-wide repair lock.
    #[serde(with = "humantime_serde")]
    pub lock_lease: Duration,
    /// Concurrency cap for immediate (post-write) repair tasks.
    pub immediate_concurrency: usize,
    /// Retry attempts for a single immediate repair.
    pub immediate_max_retries: u32,
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(3600),
            lock_lease: Duration::from_secs(600),
            immediate_concurrency: 10,
            immediate_max_retries: 3,
        }
    }
}

/// Complete storage layer configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    pub nodes: Vec<NodeConfig>,
    pub domains: Vec<DomainConfig>,
    /// Active domains in priority order. Required whenever nodes or domains
    /// are configured.
    pub active_domains: Vec<String>,
    /// Empty string disables the standby domain.
    pub standby_domain: String,
    pub virtual_nodes_per_node: usize,
    pub replication: ReplicationConfig,
    pub degraded_write: DegradedWriteConfig,
    pub health: HealthConfig,
    pub repair: RepairConfig,
    /// Per-node request timeout for object operations.
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Overrides node endpoints when generating externally reachable URLs.
    pub external_endpoint: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_one() -> usize {
    1
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            domains: Vec::new(),
            active_domains: Vec::new(),
            standby_domain: String::new(),
            virtual_nodes_per_node: 150,
            replication: ReplicationConfig::default(),
            degraded_write: DegradedWriteConfig::default(),
            health: HealthConfig::default(),
            repair: RepairConfig::default(),
            request_timeout: Duration::from_secs(30),
            external_endpoint: None,
        }
    }
}

impl StorageConfig {
    pub fn from_file(path: impl AsRef<Path>) -> StoreResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> StoreResult<Self> {
        let config: StorageConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Fail fast on an invalid topology. A fully empty configuration is
    /// permitted (minimal local deployment); the engine then reports
    /// "topology not initialized" instead of serving requests.
    pub fn validate(&self) -> StoreResult<()> {
        if self.active_domains.is_empty() {
            if !self.nodes.is_empty() || !self.domains.is_empty() {
                return Err(StoreError::Config(
                    "active_domains must name at least one domain when nodes/domains are configured"
                        .to_string(),
                ));
            }
            warn!("active_domains is not configured; storage topology is not initialized");
            return Ok(());
        }

        for node in &self.nodes {
            if node.name.is_empty() {
                return Err(StoreError::Config("node with empty name".to_string()));
            }
            if node.fault_domain.is_empty() {
                return Err(StoreError::Config(format!(
                    "node '{}' has no fault_domain",
                    node.name
                )));
            }
        }

        if self.is_standby_enabled() && self.active_domains.contains(&self.standby_domain) {
            return Err(StoreError::Config(format!(
                "standby domain '{}' is also listed in active_domains",
                self.standby_domain
            )));
        }

        if self.degraded_write.min_replicas == 0 {
            return Err(StoreError::Config(
                "degraded_write.min_replicas must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    pub fn is_standby_enabled(&self) -> bool {
        !self.standby_domain.is_empty()
    }

    pub fn node(&self, name: &str) -> Option<&NodeConfig> {
        self.nodes.iter().find(|n| n.name == name)
    }

    pub fn domain(&self, name: &str) -> Option<&DomainConfig> {
        self.domains.iter().find(|d| d.name == name)
    }

    pub fn external_endpoint(&self) -> Option<&str> {
        self.external_endpoint
            .as_deref()
            .filter(|e| !e.is_empty())
            .map(|e| e.trim_end_matches('/'))
    }
}
