//! Quorum write behavior against in-memory nodes: quorum arithmetic,
//! degraded writes, pre-flight rejection, and post-write healing of the
//! replica that missed the quorum window.

mod common;

use std::time::Duration;

use bytes::Bytes;
use custodia_store::StoreError;

use common::build_cluster;

fn three_domain_cluster(quorum: &str) -> common::TestCluster {
    build_cluster(
        &[("alpha", "dc-a"), ("beta", "dc-b"), ("gamma", "dc-c")],
        &["dc-a", "dc-b", "dc-c"],
        "",
        |config| {
            config.replication.quorum = quorum.to_string();
        },
    )
}

#[tokio::test]
async fn write_lands_on_one_node_per_domain() {
    let cluster = three_domain_cluster("auto");
    let receipt = cluster
        .engine
        .put("hash123", Bytes::from_static(b"payload"))
        .await
        .unwrap();

    assert!(receipt.quorum_met);
    assert!(!receipt.degraded);
    // Quorum is 2 of 3; at least the quorum must have acked synchronously.
    assert!(receipt.acked.len() >= 2);

    // All three replicas land eventually (stragglers are fire-and-forget).
    for node in ["alpha", "beta", "gamma"] {
        for _ in 0..50 {
            if cluster.store(node).contains("hash123") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(cluster.store(node).contains("hash123"), "missing on {}", node);
    }
}

#[tokio::test]
async fn quorum_met_with_one_replica_failing() {
    let cluster = three_domain_cluster("auto");
    cluster.store("gamma").set_fail_puts(true);

    let receipt = cluster
        .engine
        .put("hash123", Bytes::from_static(b"payload"))
        .await
        .unwrap();

    assert!(receipt.quorum_met);
    assert!(!receipt.degraded);
    assert!(!receipt.acked.contains(&"gamma".to_string()));
    assert!(cluster.store("alpha").contains("hash123"));
    assert!(cluster.store("beta").contains("hash123"));
}

#[tokio::test]
async fn quorum_not_reached_with_two_replicas_failing() {
    let cluster = three_domain_cluster("auto");
    cluster.store("beta").set_fail_puts(true);
    cluster.store("gamma").set_fail_puts(true);

    let err = cluster
        .engine
        .put("hash123", Bytes::from_static(b"payload"))
        .await
        .unwrap_err();

    match err {
        StoreError::QuorumNotReached {
            acked,
            required,
            acked_nodes,
            failed_nodes,
        } => {
            assert_eq!(required, 2);
            assert!(acked <= 1);
            assert!(acked_nodes.len() <= 1);
            assert!(!failed_nodes.is_empty());
        }
        other => panic!("expected QuorumNotReached, got {:?}", other),
    }
}

#[tokio::test]
async fn quorum_all_requires_every_replica() {
    let cluster = three_domain_cluster("all");
    cluster.store("gamma").set_fail_puts(true);

    let err = cluster
        .engine
        .put("hash123", Bytes::from_static(b"payload"))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::QuorumNotReached { required: 3, .. }));
}

#[tokio::test]
async fn degraded_write_succeeds_when_enabled() {
    let cluster = common::two_domain_cluster(|config| {
        config.degraded_write.enabled = true;
        config.degraded_write.min_replicas = 1;
    });
    cluster.engine.health_monitor().force_offline("beta");

    let receipt = cluster
        .engine
        .put("hash123", Bytes::from_static(b"payload"))
        .await
        .unwrap();

    assert!(receipt.quorum_met);
    assert!(receipt.degraded);
    assert_eq!(receipt.acked, vec!["alpha".to_string()]);
    assert!(cluster.store("alpha").contains("hash123"));
    assert!(!cluster.store("beta").contains("hash123"));

    // The missing domain is tracked for backfill.
    let pending = cluster.engine.tracker().pending_for_domain("dc-b");
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].written_nodes, vec!["alpha".to_string()]);
}

#[tokio::test]
async fn insufficient_replicas_without_degraded_mode() {
    let cluster = common::two_domain_cluster(|_| {});
    cluster.engine.health_monitor().force_offline("beta");

    let err = cluster
        .engine
        .put("hash123", Bytes::from_static(b"payload"))
        .await
        .unwrap_err();

    match err {
        StoreError::InsufficientReplicas { available, required } => {
            assert_eq!(available, 1);
            assert_eq!(required, 2);
        }
        other => panic!("expected InsufficientReplicas, got {:?}", other),
    }
    // Pre-flight failure: no I/O was attempted anywhere.
    assert!(!cluster.store("alpha").contains("hash123"));
    assert!(!cluster.store("beta").contains("hash123"));
}

#[tokio::test]
async fn degraded_write_below_min_replicas_is_rejected() {
    let cluster = three_domain_cluster("auto");
    {
        // Reconfigure: degraded writes allowed, but at least 2 replicas.
        let mut config = cluster.engine.cluster().load().config.clone();
        config.degraded_write.enabled = true;
        config.degraded_write.min_replicas = 2;
        cluster.engine.reload(config).unwrap();
    }
    let health = cluster.engine.health_monitor();
    health.force_offline("beta");
    health.force_offline("gamma");

    let err = cluster
        .engine
        .put("hash123", Bytes::from_static(b"payload"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        StoreError::InsufficientReplicas {
            available: 1,
            required: 2
        }
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_replica_is_healed_after_quorum_write() {
    let cluster = build_cluster(
        &[("alpha", "dc-a"), ("beta", "dc-b"), ("gamma", "dc-c")],
        &["dc-a", "dc-b", "dc-c"],
        "",
        |config| {
            config.replication.quorum = "majority".to_string();
        },
    );
    cluster.store("gamma").set_fail_puts(true);

    let receipt = cluster
        .engine
        .put("hash123", Bytes::from_static(b"payload"))
        .await
        .unwrap();
    assert!(receipt.quorum_met);

    // Node recovers; the immediate repair path retries with backoff.
    cluster.store("gamma").set_fail_puts(false);
    for _ in 0..100 {
        if cluster.store("gamma").contains("hash123") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(cluster.store("gamma").contains("hash123"));
}

#[tokio::test]
async fn uninitialized_topology_rejects_writes() {
    let engine = custodia_store::StorageEngine::new(custodia_store::StorageConfig::default())
        .unwrap();
    let err = engine
        .put("hash123", Bytes::from_static(b"payload"))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Config(_)));
}
