//! Node catalog: per-node connection facts and cached storage clients.
//!
//! Purely a connection factory. No health awareness or retries live here;
//! callers consult the health monitor and own their retry policy.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;

use crate::config::{NodeConfig, StorageConfig};
use crate::error::{StoreError, StoreResult};
use crate::s3_client::S3CompatClient;

/// One page of a key listing.
#[derive(Debug, Clone, Default)]
pub struct ListPage {
    pub keys: Vec<String>,
    pub next_token: Option<String>,
}

/// Object operations against a single node's bucket. Implemented by the
/// S3-compatible HTTP client in production and by an in-memory store in
/// tests.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, key: &str, data: Bytes) -> StoreResult<()>;

    /// Fetch an object; `StoreError::NotFound` when absent.
    async fn get(&self, key: &str) -> StoreResult<Bytes>;

    async fn delete(&self, key: &str) -> StoreResult<()>;

    async fn exists(&self, key: &str) -> StoreResult<bool>;

    /// One page of object keys; pass the previous page's `next_token` to
    /// continue. Pagination bounds memory when diffing large buckets.
    async fn list_page(&self, token: Option<&str>) -> StoreResult<ListPage>;

    /// Lightweight existence check used as the health probe.
    async fn bucket_exists(&self) -> StoreResult<bool>;

    /// Create the bucket if it does not exist yet.
    async fn ensure_bucket(&self) -> StoreResult<()>;

    /// Externally reachable, time-limited download URL for an object the
    /// node is known to hold.
    async fn presigned_get_url(&self, key: &str, expires_in: Duration) -> StoreResult<String>;
}

/// Drain every page of a listing into a single key set.
pub async fn list_all_keys(store: &Arc<dyn ObjectStore>) -> StoreResult<Vec<String>> {
    let mut keys = Vec::new();
    let mut token: Option<String> = None;
    loop {
        let page = store.list_page(token.as_deref()).await?;
        keys.extend(page.keys);
        match page.next_token {
            Some(next) => token = Some(next),
            None => break,
        }
    }
    Ok(keys)
}

/// Builds an [`ObjectStore`] for a configured node.
pub type ClientFactory =
    dyn Fn(&NodeConfig, &StorageConfig) -> StoreResult<Arc<dyn ObjectStore>> + Send + Sync;

/// Catalog of configured nodes. Clients are constructed once per node name
/// and cached. The node name doubles as the bucket name on that node.
pub struct NodeCatalog {
    nodes: HashMap<String, NodeConfig>,
    clients: DashMap<String, Arc<dyn ObjectStore>>,
    factory: Arc<ClientFactory>,
    config: StorageConfig,
}

impl NodeCatalog {
    /// Factory producing the production S3-compatible HTTP client.
    pub fn default_factory() -> Arc<ClientFactory> {
        Arc::new(|node, config| {
            let client = S3CompatClient::new(node, config.request_timeout)?
                .with_external_endpoint(config.external_endpoint())?;
            Ok(Arc::new(client) as Arc<dyn ObjectStore>)
        })
    }

    /// Production catalog backed by the S3-compatible HTTP client.
    pub fn new(config: &StorageConfig) -> Self {
        Self::with_factory(config, Self::default_factory())
    }

    /// Catalog with an injected client factory. This is the seam tests use
    /// to substitute in-memory stores for real nodes.
    pub fn with_factory(config: &StorageConfig, factory: Arc<ClientFactory>) -> Self {
        let nodes = config
            .nodes
            .iter()
            .filter(|n| n.enabled)
            .map(|n| (n.name.clone(), n.clone()))
            .collect();
        Self {
            nodes,
            clients: DashMap::new(),
            factory,
            config: config.clone(),
        }
    }

    /// The bucket used on a node is the node's own name.
    pub fn bucket_name(node_name: &str) -> &str {
        node_name
    }

    pub fn node_names(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Cached client for a configured node; `UnknownNode` for anything not
    /// in configuration.
    pub fn client(&self, node_name: &str) -> StoreResult<Arc<dyn ObjectStore>> {
        if let Some(client) = self.clients.get(node_name) {
            return Ok(client.clone());
        }
        let node = self
            .nodes
            .get(node_name)
            .ok_or_else(|| StoreError::UnknownNode(node_name.to_string()))?;
        let client = (self.factory)(node, &self.config)?;
        self.clients.insert(node_name.to_string(), client.clone());
        Ok(client)
    }
}

impl std::fmt::Debug for NodeCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeCatalog")
            .field("nodes", &self.nodes.keys().collect::<Vec<_>>())
            .field("cached_clients", &self.clients.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_node(name: &str, enabled: bool) -> StorageConfig {
        StorageConfig {
            nodes: vec![NodeConfig {
                name: name.to_string(),
                endpoint: "http://127.0.0.1:9000".to_string(),
                access_key: "ak".to_string(),
                secret_key: "sk".to_string(),
                fault_domain: "dc-a".to_string(),
                enabled,
            }],
            active_domains: vec!["dc-a".to_string()],
            ..Default::default()
        }
    }

    #[test]
    fn unknown_node_is_rejected() {
        let catalog = NodeCatalog::new(&config_with_node("alpha", true));
        let err = catalog.client("ghost").err().unwrap();
        assert!(matches!(err, StoreError::UnknownNode(name) if name == "ghost"));
    }

    #[test]
    fn clients_are_cached_per_node() {
        let catalog = NodeCatalog::new(&config_with_node("alpha", true));
        let first = catalog.client("alpha").unwrap();
        let second = catalog.client("alpha").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn bucket_name_is_the_node_name() {
        assert_eq!(NodeCatalog::bucket_name("alpha"), "alpha");
    }

    #[test]
    fn disabled_nodes_are_absent() {
        let catalog = NodeCatalog::new(&config_with_node("alpha", false));
        assert!(catalog.is_empty());
        assert!(catalog.client("alpha").is_err());
    }
}
