//! Shared fixtures: an in-memory [`ObjectStore`] standing in for real
//! storage nodes, and builders for small multi-domain clusters.

// Each integration-test binary compiles this module separately and uses a
// different subset of it.
#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use custodia_store::config::{DomainConfig, NodeConfig};
use custodia_store::{
    ListPage, ObjectStore, StorageConfig, StorageEngine, StoreError, StoreResult,
};

/// Small page size so repair listings exercise pagination.
const PAGE_SIZE: usize = 2;

/// In-memory node. Failure flags simulate an unreachable node
/// (`fail_all`, which also fails health probes) or write-path failures only
/// (`fail_puts`).
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<BTreeMap<String, Bytes>>,
    bucket_created: AtomicBool,
    fail_all: AtomicBool,
    fail_puts: AtomicBool,
}

impl MemoryObjectStore {
    pub fn set_unreachable(&self, unreachable: bool) {
        self.fail_all.store(unreachable, Ordering::SeqCst);
    }

    pub fn set_fail_puts(&self, fail: bool) {
        self.fail_puts.store(fail, Ordering::SeqCst);
    }

    pub fn insert(&self, key: &str, data: &[u8]) {
        self.bucket_created.store(true, Ordering::SeqCst);
        self.objects
            .lock()
            .insert(key.to_string(), Bytes::copy_from_slice(data));
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects.lock().contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects.lock().keys().cloned().collect()
    }

    pub fn object_count(&self) -> usize {
        self.objects.lock().len()
    }

    fn check_reachable(&self) -> StoreResult<()> {
        if self.fail_all.load(Ordering::SeqCst) {
            Err(StoreError::Client {
                node: "memory".to_string(),
                message: "connection refused".to_string(),
            })
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, key: &str, data: Bytes) -> StoreResult<()> {
        self.check_reachable()?;
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(StoreError::Client {
                node: "memory".to_string(),
                message: "injected put failure".to_string(),
            });
        }
        self.objects.lock().insert(key.to_string(), data);
        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<Bytes> {
        self.check_reachable()?;
        self.objects
            .lock()
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.check_reachable()?;
        self.objects.lock().remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        self.check_reachable()?;
        Ok(self.objects.lock().contains_key(key))
    }

    async fn list_page(&self, token: Option<&str>) -> StoreResult<ListPage> {
        self.check_reachable()?;
        let objects = self.objects.lock();
        let keys: Vec<String> = match token {
            Some(after) => objects
                .range(after.to_string()..)
                .filter(|(k, _)| k.as_str() != after)
                .take(PAGE_SIZE)
                .map(|(k, _)| k.clone())
                .collect(),
            None => objects.keys().take(PAGE_SIZE).cloned().collect(),
        };
        let next_token = if keys.len() == PAGE_SIZE {
            keys.last().cloned()
        } else {
            None
        };
        Ok(ListPage { keys, next_token })
    }

    async fn bucket_exists(&self) -> StoreResult<bool> {
        self.check_reachable()?;
        Ok(self.bucket_created.load(Ordering::SeqCst))
    }

    async fn ensure_bucket(&self) -> StoreResult<()> {
        self.check_reachable()?;
        self.bucket_created.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn presigned_get_url(
        &self,
        key: &str,
        expires_in: std::time::Duration,
    ) -> StoreResult<String> {
        self.check_reachable()?;
        Ok(format!("memory:///{}?expires={}", key, expires_in.as_secs()))
    }
}

/// An engine wired to in-memory nodes, with direct access to each node's
/// store for seeding and assertions.
pub struct TestCluster {
    pub engine: Arc<StorageEngine>,
    pub stores: HashMap<String, Arc<MemoryObjectStore>>,
}

impl TestCluster {
    pub fn store(&self, node: &str) -> &Arc<MemoryObjectStore> {
        &self.stores[node]
    }
}

pub fn node_config(name: &str, domain: &str) -> NodeConfig {
    NodeConfig {
        name: name.to_string(),
        endpoint: format!("http://127.0.0.1:9000/{}", name),
        access_key: "test-access".to_string(),
        secret_key: "test-secret".to_string(),
        fault_domain: domain.to_string(),
        enabled: true,
    }
}

pub fn domain_config(name: &str, accepts_writes: bool) -> DomainConfig {
    DomainConfig {
        name: name.to_string(),
        min_nodes: 1,
        replica_count: 1,
        accepts_writes,
    }
}

/// Build an engine over in-memory nodes described as (node, domain) pairs.
pub fn build_cluster(
    nodes: &[(&str, &str)],
    active_domains: &[&str],
    standby_domain: &str,
    tweak: impl FnOnce(&mut StorageConfig),
) -> TestCluster {
    let mut config = StorageConfig::default();
    for (node, domain) in nodes {
        config.nodes.push(node_config(node, domain));
    }
    let mut domain_names: Vec<&str> = active_domains.to_vec();
    if !standby_domain.is_empty() {
        domain_names.push(standby_domain);
    }
    for domain in &domain_names {
        config
            .domains
            .push(domain_config(domain, *domain != standby_domain));
    }
    config.active_domains = active_domains.iter().map(|d| d.to_string()).collect();
    config.standby_domain = standby_domain.to_string();

    tweak(&mut config);

    let stores: HashMap<String, Arc<MemoryObjectStore>> = nodes
        .iter()
        .map(|(node, _)| (node.to_string(), Arc::new(MemoryObjectStore::default())))
        .collect();

    let factory_stores = stores.clone();
    let engine = StorageEngine::with_client_factory(
        config,
        Arc::new(move |node, _config| {
            factory_stores
                .get(&node.name)
                .cloned()
                .map(|store| store as Arc<dyn ObjectStore>)
                .ok_or_else(|| StoreError::UnknownNode(node.name.clone()))
        }),
    )
    .expect("valid test cluster config");

    TestCluster {
        engine: Arc::new(engine),
        stores,
    }
}

/// Two active single-node domains and no standby; the common fixture.
pub fn two_domain_cluster(tweak: impl FnOnce(&mut StorageConfig)) -> TestCluster {
    build_cluster(&[("alpha", "dc-a"), ("beta", "dc-b")], &["dc-a", "dc-b"], "", tweak)
}
