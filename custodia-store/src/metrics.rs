//! In-process metrics for the storage engine.
//!
//! Write/read/repair counters and health gauges, collected behind cheap
//! locks and exported as a snapshot for logging or scraping by the host
//! process.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

// Metric names used across the engine.
pub const WRITES_TOTAL: &str = "store.writes.total";
pub const WRITES_DEGRADED: &str = "store.writes.degraded";
pub const WRITE_QUORUM_FAILURES: &str = "store.writes.quorum_failures";
pub const READS_TOTAL: &str = "store.reads.total";
pub const READ_FAILOVERS: &str = "store.reads.failovers";
pub const DELETES_TOTAL: &str = "store.deletes.total";
pub const REPAIR_KEYS_REPAIRED: &str = "repair.keys.repaired";
pub const REPAIR_FAILURES: &str = "repair.failures";
pub const REPAIR_RUNS: &str = "repair.runs";
pub const NODES_ONLINE: &str = "health.nodes.online";
pub const DEGRADED_PENDING: &str = "store.degraded.pending";

/// Shared counter/gauge registry.
#[derive(Debug, Clone, Default)]
pub struct MetricsRegistry {
    counters: Arc<RwLock<HashMap<String, u64>>>,
    gauges: Arc<RwLock<HashMap<String, f64>>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_counter(&self, name: &str) {
        self.increment_counter_by(name, 1);
    }

    pub fn increment_counter_by(&self, name: &str, value: u64) {
        let mut counters = self.counters.write();
        *counters.entry(name.to_string()).or_insert(0) += value;
    }

    pub fn set_gauge(&self, name: &str, value: f64) {
        self.gauges.write().insert(name.to_string(), value);
    }

    pub fn get_counter(&self, name: &str) -> u64 {
        self.counters.read().get(name).copied().unwrap_or(0)
    }

    pub fn get_gauge(&self, name: &str) -> f64 {
        self.gauges.read().get(name).copied().unwrap_or(0.0)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            counters: self.counters.read().clone(),
            gauges: self.gauges.read().clone(),
        }
    }
}

/// Point-in-time copy of all metrics.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub counters: HashMap<String, u64>,
    pub gauges: HashMap<String, f64>,
}
