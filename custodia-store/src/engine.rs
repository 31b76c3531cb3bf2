//! Quorum write/read coordinator.
//!
//! Writes fan out to one node per selected fault domain and return as soon
//! as the quorum threshold is met; reads walk domains in priority order and
//! stop at the first success. Quorum on write is the only consistency gate
//! in this engine — reads have no quorum, which is why the background repair
//! service is mandatory rather than optional.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::catalog::ClientFactory;
use crate::cluster::{ClusterHandle, ClusterState};
use crate::config::StorageConfig;
use crate::error::{StoreError, StoreResult};
use crate::health::{HealthMonitor, HealthState};
use crate::metrics::{self, MetricsRegistry};
use crate::placement;
use crate::repair;
use crate::tracker::DegradedWriteTracker;

/// Result of a successful (possibly degraded) quorum write.
#[derive(Debug, Clone)]
pub struct WriteReceipt {
    /// Nodes that acknowledged the write before the coordinator returned.
    pub acked: Vec<String>,
    pub quorum_met: bool,
    /// True when the write proceeded with fewer replicas than the
    /// configured factor, or leaned on the promoted standby domain.
    pub degraded: bool,
}

/// Per-domain health detail for the operational health surface.
#[derive(Debug, Clone, Serialize)]
pub struct DomainHealth {
    pub total_nodes: usize,
    pub healthy_nodes: usize,
    pub status: String,
    pub nodes: Vec<(String, bool)>,
}

/// Aggregate cluster health report.
#[derive(Debug, Clone, Serialize)]
pub struct ClusterHealth {
    pub state: String,
    pub domains: Vec<(String, DomainHealth)>,
}

/// Validity window for presigned download URLs.
const PRESIGNED_URL_EXPIRY: Duration = Duration::from_secs(24 * 60 * 60);

/// The storage engine: placement, quorum coordination, and the operational
/// surface other subsystems program against. Object keys arrive already
/// tenant-prefixed and are treated as opaque.
pub struct StorageEngine {
    cluster: Arc<ClusterHandle>,
    health: Arc<HealthMonitor>,
    tracker: Arc<DegradedWriteTracker>,
    metrics: MetricsRegistry,
    factory: Arc<ClientFactory>,
    immediate_repairs: Arc<Semaphore>,
}

impl StorageEngine {
    pub fn new(config: StorageConfig) -> StoreResult<Self> {
        Self::with_client_factory(config, crate::catalog::NodeCatalog::default_factory())
    }

    /// Engine with an injected node-client factory (the test seam).
    pub fn with_client_factory(
        config: StorageConfig,
        factory: Arc<ClientFactory>,
    ) -> StoreResult<Self> {
        let immediate_concurrency = config.repair.immediate_concurrency.max(1);
        let state = ClusterState::build_with_factory(config, factory.clone())?;
        let cluster = Arc::new(ClusterHandle::new(state));
        let health = Arc::new(HealthMonitor::new(cluster.clone()));
        Ok(Self {
            cluster,
            health,
            tracker: Arc::new(DegradedWriteTracker::new()),
            metrics: MetricsRegistry::new(),
            factory,
            immediate_repairs: Arc::new(Semaphore::new(immediate_concurrency)),
        })
    }

    pub fn cluster(&self) -> Arc<ClusterHandle> {
        self.cluster.clone()
    }

    pub fn health_monitor(&self) -> Arc<HealthMonitor> {
        self.health.clone()
    }

    pub fn tracker(&self) -> Arc<DegradedWriteTracker> {
        self.tracker.clone()
    }

    pub fn metrics(&self) -> MetricsRegistry {
        self.metrics.clone()
    }

    /// Rebuild topology and catalog from new configuration and install the
    /// snapshot atomically. In-flight requests keep the version they loaded.
    pub fn reload(&self, config: StorageConfig) -> StoreResult<()> {
        let state = ClusterState::build_with_factory(config, self.factory.clone())?;
        self.cluster.install(state);
        Ok(())
    }

    /// Spawn the recurring health-probe loop.
    pub fn start(&self) -> JoinHandle<()> {
        self.health.spawn()
    }

    /// Store an object on one node per selected fault domain, returning once
    /// the quorum threshold is acknowledged.
    pub async fn put(&self, key: &str, payload: Bytes) -> StoreResult<WriteReceipt> {
        let state = self.cluster.load();
        if !state.topology.is_initialized() {
            return Err(StoreError::Config(
                "storage topology is not initialized".to_string(),
            ));
        }
        self.metrics.increment_counter(metrics::WRITES_TOTAL);

        let decision = placement::replicas_for(
            key,
            &state.topology,
            &self.health,
            state.config.degraded_write.enabled,
        );
        let factor = state.topology.effective_replication_factor();
        let mut quorum = state.topology.effective_quorum();
        let short_of_factor = decision.targets.len() < factor;

        if short_of_factor {
            let policy = &state.config.degraded_write;
            if policy.enabled
                && !decision.targets.is_empty()
                && decision.targets.len() >= policy.min_replicas
            {
                // In degraded mode every remaining replica must ack.
                quorum = decision.targets.len();
                warn!(
                    key,
                    required = factor,
                    available = decision.targets.len(),
                    "degraded write: proceeding with reduced replica set"
                );
            } else {
                let required = if policy.enabled {
                    policy.min_replicas
                } else {
                    factor
                };
                error!(
                    key,
                    available = decision.targets.len(),
                    required,
                    "not enough healthy domains for write, no I/O attempted"
                );
                return Err(StoreError::InsufficientReplicas {
                    available: decision.targets.len(),
                    required,
                });
            }
        }

        let total = decision.targets.len();
        let timeout = state.config.request_timeout;
        let (tx, mut rx) = mpsc::unbounded_channel::<(String, Result<(), String>)>();
        for target in &decision.targets {
            let tx = tx.clone();
            let state = state.clone();
            let node = target.node.clone();
            let key = key.to_string();
            let payload = payload.clone();
            tokio::spawn(async move {
                let outcome = write_to_node(&state, &node, &key, payload, timeout).await;
                let _ = tx.send((node, outcome));
            });
        }
        drop(tx);

        // First-N-of-M join: return as soon as quorum is met, or as soon as
        // quorum has become unreachable.
        let mut acked: Vec<String> = Vec::with_capacity(total);
        let mut failed: Vec<String> = Vec::new();
        while acked.len() < quorum {
            match rx.recv().await {
                Some((node, Ok(()))) => {
                    debug!(node = node.as_str(), key, acked = acked.len() + 1, quorum, "replica acked");
                    acked.push(node);
                }
                Some((node, Err(reason))) => {
                    warn!(node = node.as_str(), key, reason = reason.as_str(), "replica write failed");
                    failed.push(node);
                    if failed.len() > total - quorum {
                        break;
                    }
                }
                None => break,
            }
        }

        if acked.len() < quorum {
            self.metrics
                .increment_counter(metrics::WRITE_QUORUM_FAILURES);
            error!(
                key,
                acked = acked.len(),
                quorum,
                "write quorum not reached"
            );
            return Err(StoreError::QuorumNotReached {
                acked: acked.len(),
                required: quorum,
                acked_nodes: acked,
                failed_nodes: failed,
            });
        }

        // Stragglers resolve in the background (each bounded by its own
        // per-call deadline); any that failed are healed from an acked
        // replica without blocking the caller.
        self.spawn_write_finisher(key, rx, acked.clone(), failed);

        // A write that leaned on the promoted standby is degraded too: an
        // active domain is still missing its replica.
        let degraded = short_of_factor || decision.promoted_standby;
        if degraded {
            self.metrics.increment_counter(metrics::WRITES_DEGRADED);
        }
        if degraded && state.config.degraded_write.track_for_sync {
            let acked_domains: BTreeSet<&str> = decision
                .targets
                .iter()
                .filter(|t| acked.contains(&t.node))
                .map(|t| t.domain.as_str())
                .collect();
            let missing: Vec<String> = state
                .topology
                .active_domains()
                .iter()
                .filter(|d| !acked_domains.contains(d.as_str()))
                .cloned()
                .collect();
            self.tracker.record(key, acked.clone(), missing);
            self.metrics
                .set_gauge(metrics::DEGRADED_PENDING, self.tracker.pending_count() as f64);
        }

        info!(
            key,
            acked = acked.len(),
            total,
            degraded,
            "object stored with quorum"
        );
        Ok(WriteReceipt {
            acked,
            quorum_met: true,
            degraded,
        })
    }

    /// Fetch an object, attempting domains in priority order and ring
    /// successors within each domain. No quorum on reads.
    pub async fn get(&self, key: &str) -> StoreResult<Bytes> {
        let state = self.cluster.load();
        if !state.topology.is_initialized() {
            return Err(StoreError::Config(
                "storage topology is not initialized".to_string(),
            ));
        }
        self.metrics.increment_counter(metrics::READS_TOTAL);

        let mut attempts = 0usize;
        for (domain, nodes) in placement::read_candidates(key, &state.topology) {
            for node in nodes {
                if !self.health.is_online(&node) {
                    continue;
                }
                let client = match state.catalog.client(&node) {
                    Ok(client) => client,
                    Err(e) => {
                        warn!(node = node.as_str(), error = %e, "no client for candidate node");
                        continue;
                    }
                };
                attempts += 1;
                match tokio::time::timeout(state.config.request_timeout, client.get(key)).await {
                    Ok(Ok(bytes)) => {
                        if attempts > 1 {
                            self.metrics.increment_counter(metrics::READ_FAILOVERS);
                        }
                        debug!(key, node = node.as_str(), domain, "object read");
                        return Ok(bytes);
                    }
                    Ok(Err(StoreError::NotFound(_))) => {
                        debug!(key, node = node.as_str(), "object not on candidate node");
                    }
                    Ok(Err(e)) => {
                        warn!(key, node = node.as_str(), error = %e, "read failed, trying next candidate");
                    }
                    Err(_) => {
                        warn!(key, node = node.as_str(), "read timed out, trying next candidate");
                    }
                }
            }
        }

        Err(StoreError::NotFound(key.to_string()))
    }

    /// Best-effort delete across every domain's primary for the key. Not
    /// quorum-gated; a replica missed here can be resurrected by repair
    /// until tombstone propagation exists (see DESIGN.md).
    pub async fn delete(&self, key: &str) -> StoreResult<()> {
        let state = self.cluster.load();
        if !state.topology.is_initialized() {
            return Err(StoreError::Config(
                "storage topology is not initialized".to_string(),
            ));
        }
        self.metrics.increment_counter(metrics::DELETES_TOTAL);

        let targets = placement::delete_targets(key, &state.topology);
        let deletes = targets.into_iter().map(|target| {
            let state = state.clone();
            let health = self.health.clone();
            let key = key.to_string();
            async move {
                if !health.is_online(&target.node) {
                    warn!(
                        node = target.node.as_str(),
                        key, "node offline, skipping delete"
                    );
                    return;
                }
                let client = match state.catalog.client(&target.node) {
                    Ok(client) => client,
                    Err(e) => {
                        warn!(node = target.node.as_str(), error = %e, "no client for delete");
                        return;
                    }
                };
                match tokio::time::timeout(state.config.request_timeout, client.delete(&key)).await
                {
                    Ok(Ok(())) => debug!(node = target.node.as_str(), key, "replica deleted"),
                    Ok(Err(e)) => {
                        warn!(node = target.node.as_str(), key, error = %e, "delete failed")
                    }
                    Err(_) => warn!(node = target.node.as_str(), key, "delete timed out"),
                }
            }
        });
        futures::future::join_all(deletes).await;
        Ok(())
    }

    /// Time-limited download URL for an object, served by the first online
    /// replica that holds it. Fails over across candidates like `get`.
    pub async fn presigned_url(&self, key: &str) -> StoreResult<String> {
        let state = self.cluster.load();
        if !state.topology.is_initialized() {
            return Err(StoreError::Config(
                "storage topology is not initialized".to_string(),
            ));
        }

        for (_domain, nodes) in placement::read_candidates(key, &state.topology) {
            for node in nodes {
                if !self.health.is_online(&node) {
                    continue;
                }
                let Ok(client) = state.catalog.client(&node) else {
                    continue;
                };
                match tokio::time::timeout(state.config.request_timeout, client.exists(key)).await {
                    Ok(Ok(true)) => {}
                    Ok(Ok(false)) => continue,
                    Ok(Err(e)) => {
                        warn!(node = node.as_str(), key, error = %e, "exists check failed");
                        continue;
                    }
                    Err(_) => continue,
                }
                match client.presigned_get_url(key, PRESIGNED_URL_EXPIRY).await {
                    Ok(url) => return Ok(url),
                    Err(e) => {
                        warn!(node = node.as_str(), key, error = %e, "presigning failed, trying next candidate")
                    }
                }
            }
        }

        Err(StoreError::NotFound(key.to_string()))
    }

    /// Nodes that actually hold a replica of `key` right now.
    pub async fn replica_locations(&self, key: &str) -> StoreResult<Vec<String>> {
        let state = self.cluster.load();
        let mut locations = Vec::new();
        for (_domain, nodes) in placement::read_candidates(key, &state.topology) {
            for node in nodes {
                if !self.health.is_online(&node) {
                    continue;
                }
                let Ok(client) = state.catalog.client(&node) else {
                    continue;
                };
                match tokio::time::timeout(state.config.request_timeout, client.exists(key)).await {
                    Ok(Ok(true)) => locations.push(node),
                    Ok(Ok(false)) => {}
                    Ok(Err(e)) => warn!(node = node.as_str(), key, error = %e, "exists check failed"),
                    Err(_) => warn!(node = node.as_str(), key, "exists check timed out"),
                }
            }
        }
        Ok(locations)
    }

    /// Operational health surface: aggregate state plus per-domain and
    /// per-node detail.
    pub fn cluster_health(&self) -> ClusterHealth {
        let state = self.cluster.load();
        if !state.topology.is_initialized() {
            return ClusterHealth {
                state: HealthState::Unknown.as_str().to_string(),
                domains: Vec::new(),
            };
        }

        let mut domains = Vec::new();
        let mut any_degraded = false;
        let mut all_active_down = true;
        for domain_name in state.topology.all_domains() {
            let members = state
                .topology
                .nodes_in(domain_name)
                .cloned()
                .unwrap_or_default();
            let healthy = self.health.healthy_node_count(&members);
            let total = members.len();
            let status = if total == 0 {
                "empty"
            } else if healthy == total {
                "healthy"
            } else if healthy > 0 {
                "degraded"
            } else {
                "down"
            };
            if status != "healthy" {
                any_degraded = true;
            }
            if state.topology.active_domains().iter().any(|d| d == domain_name) && healthy > 0 {
                all_active_down = false;
            }
            domains.push((
                domain_name.to_string(),
                DomainHealth {
                    total_nodes: total,
                    healthy_nodes: healthy,
                    status: status.to_string(),
                    nodes: members
                        .iter()
                        .map(|n| (n.clone(), self.health.is_online(n)))
                        .collect(),
                },
            ));
        }

        let overall = if all_active_down {
            HealthState::Down
        } else if any_degraded {
            HealthState::Degraded
        } else {
            HealthState::Up
        };
        self.metrics.set_gauge(
            metrics::NODES_ONLINE,
            self.health.online_nodes().len() as f64,
        );

        ClusterHealth {
            state: overall.as_str().to_string(),
            domains,
        }
    }

    /// Drain straggler outcomes after quorum was met and heal any replicas
    /// that failed, copying from an acked node.
    fn spawn_write_finisher(
        &self,
        key: &str,
        mut rx: mpsc::UnboundedReceiver<(String, Result<(), String>)>,
        acked: Vec<String>,
        mut failed: Vec<String>,
    ) {
        let cluster = self.cluster.clone();
        let health = self.health.clone();
        let semaphore = self.immediate_repairs.clone();
        let metrics = self.metrics.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            while let Some((node, outcome)) = rx.recv().await {
                match outcome {
                    Ok(()) => debug!(node = node.as_str(), key = key.as_str(), "straggler replica acked"),
                    Err(reason) => {
                        warn!(
                            node = node.as_str(),
                            key = key.as_str(),
                            reason = reason.as_str(),
                            "straggler replica failed"
                        );
                        failed.push(node);
                    }
                }
            }

            let Some(source) = acked.first().cloned() else {
                return;
            };
            for target in failed {
                repair::spawn_immediate_repair(
                    cluster.clone(),
                    health.clone(),
                    semaphore.clone(),
                    metrics.clone(),
                    key.clone(),
                    source.clone(),
                    target,
                );
            }
        });
    }
}

impl std::fmt::Debug for StorageEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageEngine").finish_non_exhaustive()
    }
}

/// Write one replica. The node call runs as its own task so a deadline miss
/// counts as failed for quorum purposes while the call itself resolves in
/// the background (bounded by the client's own timeout) and is logged.
async fn write_to_node(
    state: &Arc<ClusterState>,
    node: &str,
    key: &str,
    payload: Bytes,
    deadline: Duration,
) -> Result<(), String> {
    let client = match state.catalog.client(node) {
        Ok(client) => client,
        Err(e) => return Err(e.to_string()),
    };

    let task_key = key.to_string();
    let mut task = tokio::spawn(async move {
        client.ensure_bucket().await?;
        client.put(&task_key, payload).await
    });

    match tokio::time::timeout(deadline, &mut task).await {
        Ok(Ok(Ok(()))) => Ok(()),
        Ok(Ok(Err(e))) => Err(e.to_string()),
        Ok(Err(join_err)) => Err(format!("write task failed: {}", join_err)),
        Err(_) => {
            let node = node.to_string();
            let key = key.to_string();
            tokio::spawn(async move {
                match task.await {
                    Ok(Ok(())) => info!(
                        node = node.as_str(),
                        key = key.as_str(),
                        "write completed after deadline; repair will reconcile it"
                    ),
                    Ok(Err(e)) => debug!(node = node.as_str(), key = key.as_str(), error = %e, "late write failed"),
                    Err(_) => {}
                }
            });
            Err(format!("write timed out after {:?}", deadline))
        }
    }
}
