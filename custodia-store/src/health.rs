//! Node health monitoring.
//!
//! The monitor is the single writer of per-node health state; every other
//! component takes lock-free snapshots. A node flips offline only after a
//! small run of consecutive probe failures, so one transient timeout cannot
//! reshuffle placement across a whole domain. State is not persisted: on
//! restart all nodes start assumed-online and the first probe cycle corrects
//! the map.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cluster::ClusterHandle;

/// Composite health states reported by components and the aggregate probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HealthState {
    Up,
    Unknown,
    Degraded,
    Down,
}

impl HealthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthState::Up => "UP",
            HealthState::Unknown => "UNKNOWN",
            HealthState::Degraded => "DEGRADED",
            HealthState::Down => "DOWN",
        }
    }
}

/// Outcome of one component health check.
#[derive(Debug, Clone)]
pub struct HealthReport {
    pub state: HealthState,
    pub details: Vec<(String, String)>,
}

impl HealthReport {
    pub fn up() -> Self {
        Self {
            state: HealthState::Up,
            details: Vec::new(),
        }
    }

    pub fn with_state(state: HealthState) -> Self {
        Self {
            state,
            details: Vec::new(),
        }
    }

    pub fn detail(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.details.push((key.into(), value.to_string()));
        self
    }
}

/// Explicit health-check interface implemented by each long-lived component
/// and composed by [`HealthAggregator`].
#[async_trait]
pub trait HealthCheckable: Send + Sync {
    fn name(&self) -> &'static str;
    async fn check(&self) -> HealthReport;
}

/// Combines component reports; the aggregate state is the worst component
/// state.
pub struct HealthAggregator {
    checks: Vec<Arc<dyn HealthCheckable>>,
}

impl HealthAggregator {
    pub fn new(checks: Vec<Arc<dyn HealthCheckable>>) -> Self {
        Self { checks }
    }

    pub async fn check_all(&self) -> (HealthState, Vec<(&'static str, HealthReport)>) {
        let mut overall = HealthState::Up;
        let mut reports = Vec::with_capacity(self.checks.len());
        for check in &self.checks {
            let report = check.check().await;
            overall = overall.max(report.state);
            reports.push((check.name(), report));
        }
        (overall, reports)
    }
}

/// Transient per-node health record.
#[derive(Debug, Clone)]
pub struct NodeHealth {
    pub online: bool,
    pub consecutive_failures: u32,
    pub last_checked: Option<Instant>,
}

impl Default for NodeHealth {
    fn default() -> Self {
        Self {
            online: true,
            consecutive_failures: 0,
            last_checked: None,
        }
    }
}

/// Periodically probes each configured node and owns the online/offline map.
pub struct HealthMonitor {
    cluster: Arc<ClusterHandle>,
    states: DashMap<String, NodeHealth>,
    recovery_subscribers: Mutex<Vec<mpsc::UnboundedSender<String>>>,
}

impl HealthMonitor {
    pub fn new(cluster: Arc<ClusterHandle>) -> Self {
        Self {
            cluster,
            states: DashMap::new(),
            recovery_subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Online status snapshot. Unprobed nodes are assumed online so a fresh
    /// process does not reject writes before its first probe cycle.
    pub fn is_online(&self, node_name: &str) -> bool {
        self.states
            .get(node_name)
            .map(|h| h.online)
            .unwrap_or(true)
    }

    pub fn node_health(&self, node_name: &str) -> Option<NodeHealth> {
        self.states.get(node_name).map(|h| h.clone())
    }

    pub fn online_nodes(&self) -> BTreeSet<String> {
        let state = self.cluster.load();
        state
            .catalog
            .node_names()
            .filter(|n| self.is_online(n))
            .map(str::to_string)
            .collect()
    }

    /// Number of currently healthy nodes among `members`.
    pub fn healthy_node_count(&self, members: &BTreeSet<String>) -> usize {
        members.iter().filter(|n| self.is_online(n)).count()
    }

    /// Receive node names as they transition offline -> online. Used to
    /// backfill degraded writes as soon as a domain recovers.
    pub fn subscribe_recoveries(&self) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.recovery_subscribers.lock().push(tx);
        rx
    }

    /// Operator override; also corrected by the next probe cycle.
    pub fn force_offline(&self, node_name: &str) {
        let threshold = self.cluster.load().config.health.failure_threshold;
        let mut entry = self.states.entry(node_name.to_string()).or_default();
        entry.online = false;
        entry.consecutive_failures = threshold;
        warn!(node = node_name, "node forced offline");
    }

    /// Operator override; also corrected by the next probe cycle.
    pub fn force_online(&self, node_name: &str) {
        let was_online = self.is_online(node_name);
        let mut entry = self.states.entry(node_name.to_string()).or_default();
        entry.online = true;
        entry.consecutive_failures = 0;
        drop(entry);
        if !was_online {
            self.notify_recovery(node_name);
        }
    }

    /// One probe cycle over every configured node.
    pub async fn probe_all(&self) {
        let state = self.cluster.load();
        let node_names: Vec<String> = state.catalog.node_names().map(str::to_string).collect();
        if node_names.is_empty() {
            self.states.clear();
            return;
        }

        let probe_timeout = state.config.health.probe_timeout;
        let probes = node_names.iter().map(|name| {
            let state = state.clone();
            let name = name.clone();
            async move {
                let outcome = match state.catalog.client(&name) {
                    Ok(client) => {
                        match tokio::time::timeout(probe_timeout, client.bucket_exists()).await {
                            Ok(Ok(_)) => Ok(()),
                            Ok(Err(e)) => Err(e.to_string()),
                            Err(_) => Err(format!("probe timed out after {:?}", probe_timeout)),
                        }
                    }
                    Err(e) => Err(e.to_string()),
                };
                (name, outcome)
            }
        });

        let threshold = state.config.health.failure_threshold;
        for (name, outcome) in join_all(probes).await {
            match outcome {
                Ok(()) => self.record_success(&name),
                Err(reason) => self.record_failure(&name, &reason, threshold),
            }
        }

        // Drop state for nodes that left the configuration.
        self.states
            .retain(|name, _| node_names.iter().any(|n| n == name));
    }

    /// Spawn the recurring probe loop.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move {
            let interval = monitor.cluster.load().config.health.probe_interval;
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                monitor.probe_all().await;
            }
        })
    }

    fn record_success(&self, node_name: &str) {
        let mut entry = self.states.entry(node_name.to_string()).or_default();
        let was_online = entry.online;
        entry.online = true;
        entry.consecutive_failures = 0;
        entry.last_checked = Some(Instant::now());
        drop(entry);

        if !was_online {
            info!(node = node_name, "node is back ONLINE");
            self.notify_recovery(node_name);
        }
    }

    fn record_failure(&self, node_name: &str, reason: &str, threshold: u32) {
        let mut entry = self.states.entry(node_name.to_string()).or_default();
        entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
        entry.last_checked = Some(Instant::now());

        if entry.online && entry.consecutive_failures >= threshold {
            entry.online = false;
            warn!(
                node = node_name,
                failures = entry.consecutive_failures,
                reason,
                "node is now OFFLINE"
            );
        } else {
            debug!(
                node = node_name,
                failures = entry.consecutive_failures,
                reason,
                "node probe failed"
            );
        }
    }

    fn notify_recovery(&self, node_name: &str) {
        let mut subscribers = self.recovery_subscribers.lock();
        subscribers.retain(|tx| tx.send(node_name.to_string()).is_ok());
    }
}

#[async_trait]
impl HealthCheckable for HealthMonitor {
    fn name(&self) -> &'static str {
        "node-health"
    }

    async fn check(&self) -> HealthReport {
        let state = self.cluster.load();
        let total = state.catalog.len();
        if total == 0 {
            return HealthReport::with_state(HealthState::Unknown).detail("nodes", 0);
        }

        let online = state
            .catalog
            .node_names()
            .filter(|n| self.is_online(n))
            .count();
        let health_state = if online == total {
            HealthState::Up
        } else if online == 0 {
            HealthState::Down
        } else {
            HealthState::Degraded
        };
        HealthReport::with_state(health_state)
            .detail("nodes_total", total)
            .detail("nodes_online", online)
    }
}
