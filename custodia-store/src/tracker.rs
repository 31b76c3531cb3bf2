//! Degraded-write tracking.
//!
//! When a write proceeds without one or more active domains (degraded mode
//! or standby promotion), the missing replicas must be backfilled once the
//! domain recovers. Each such write is recorded here and drained by the
//! repair service, either immediately on a node-recovery event or during the
//! next scheduled pass. Records live in memory only: the scheduled repair
//! diff re-detects anything lost across a process restart.

use std::time::SystemTime;

use dashmap::DashMap;
use tracing::{debug, info};

/// One write that is still missing replicas in some domains.
#[derive(Debug, Clone)]
pub struct DegradedWriteRecord {
    pub object_key: String,
    /// Nodes that acknowledged the write.
    pub written_nodes: Vec<String>,
    /// Domains that did not receive a replica.
    pub missing_domains: Vec<String>,
    pub recorded_at: SystemTime,
}

/// In-memory ledger of writes awaiting replica backfill.
#[derive(Debug, Default)]
pub struct DegradedWriteTracker {
    records: DashMap<String, DegradedWriteRecord>,
}

impl DegradedWriteTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a degraded write. A no-op when no domain is actually missing.
    pub fn record(&self, object_key: &str, written_nodes: Vec<String>, missing_domains: Vec<String>) {
        if missing_domains.is_empty() {
            debug!(key = object_key, "no missing domains, skip tracking");
            return;
        }
        info!(
            key = object_key,
            written = ?written_nodes,
            missing = ?missing_domains,
            "recorded degraded write for later sync"
        );
        self.records.insert(
            object_key.to_string(),
            DegradedWriteRecord {
                object_key: object_key.to_string(),
                written_nodes,
                missing_domains,
                recorded_at: SystemTime::now(),
            },
        );
    }

    pub fn pending(&self) -> Vec<DegradedWriteRecord> {
        self.records.iter().map(|r| r.clone()).collect()
    }

    pub fn pending_for_domain(&self, domain: &str) -> Vec<DegradedWriteRecord> {
        self.records
            .iter()
            .filter(|r| r.missing_domains.iter().any(|d| d == domain))
            .map(|r| r.clone())
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.records.len()
    }

    /// Drop the record entirely, regardless of remaining domains.
    pub fn mark_synced(&self, object_key: &str) {
        if self.records.remove(object_key).is_some() {
            info!(key = object_key, "degraded write fully synced");
        }
    }

    /// One missing domain has been healed; the record is dropped once no
    /// domain remains.
    pub fn domain_synced(&self, object_key: &str, domain: &str) {
        let fully_synced = match self.records.get_mut(object_key) {
            Some(mut record) => {
                record.missing_domains.retain(|d| d != domain);
                record.missing_domains.is_empty()
            }
            None => false,
        };
        if fully_synced {
            self.mark_synced(object_key);
        } else {
            debug!(key = object_key, domain, "degraded write partially synced");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_and_drain_by_domain() {
        let tracker = DegradedWriteTracker::new();
        tracker.record(
            "hash123",
            vec!["a1".to_string()],
            vec!["dc-b".to_string(), "dc-c".to_string()],
        );
        tracker.record("hash456", vec!["a2".to_string()], vec!["dc-b".to_string()]);

        assert_eq!(tracker.pending_count(), 2);
        assert_eq!(tracker.pending_for_domain("dc-b").len(), 2);
        assert_eq!(tracker.pending_for_domain("dc-c").len(), 1);

        tracker.domain_synced("hash123", "dc-b");
        assert_eq!(tracker.pending_for_domain("dc-b").len(), 1);
        // Still pending: dc-c not yet healed.
        assert_eq!(tracker.pending_count(), 2);

        tracker.domain_synced("hash123", "dc-c");
        assert_eq!(tracker.pending_count(), 1);

        tracker.mark_synced("hash456");
        assert_eq!(tracker.pending_count(), 0);
    }

    #[test]
    fn empty_missing_set_is_not_recorded() {
        let tracker = DegradedWriteTracker::new();
        tracker.record("hash123", vec!["a1".to_string()], vec![]);
        assert_eq!(tracker.pending_count(), 0);
    }
}
