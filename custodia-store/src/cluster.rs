//! Versioned cluster state.
//!
//! Configuration, topology, and the node catalog are rebuilt together on
//! every reload and published as one immutable [`ClusterState`]. Readers
//! take a cheap `Arc` snapshot; a reload installs a new `Arc` in one swap,
//! never mutating a live snapshot field-by-field.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;

use crate::catalog::{ClientFactory, NodeCatalog};
use crate::config::StorageConfig;
use crate::error::StoreResult;
use crate::topology::Topology;

/// One immutable version of the cluster layout.
#[derive(Debug)]
pub struct ClusterState {
    pub config: StorageConfig,
    pub topology: Topology,
    pub catalog: NodeCatalog,
}

impl ClusterState {
    pub fn build(config: StorageConfig) -> StoreResult<Self> {
        let topology = Topology::build(&config)?;
        let catalog = NodeCatalog::new(&config);
        Ok(Self {
            config,
            topology,
            catalog,
        })
    }

    pub fn build_with_factory(
        config: StorageConfig,
        factory: Arc<ClientFactory>,
    ) -> StoreResult<Self> {
        let topology = Topology::build(&config)?;
        let catalog = NodeCatalog::with_factory(&config, factory);
        Ok(Self {
            config,
            topology,
            catalog,
        })
    }
}

/// Read-mostly handle to the current [`ClusterState`].
pub struct ClusterHandle {
    current: RwLock<Arc<ClusterState>>,
}

impl ClusterHandle {
    pub fn new(state: ClusterState) -> Self {
        Self {
            current: RwLock::new(Arc::new(state)),
        }
    }

    /// Snapshot of the current state. The snapshot stays consistent for as
    /// long as the caller holds it, even across a concurrent reload.
    pub fn load(&self) -> Arc<ClusterState> {
        self.current.read().clone()
    }

    /// Install a new state version.
    pub fn install(&self, state: ClusterState) {
        let domains = state.topology.active_domains().join(", ");
        *self.current.write() = Arc::new(state);
        info!(active_domains = domains.as_str(), "installed new topology version");
    }
}

impl std::fmt::Debug for ClusterHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterHandle").finish_non_exhaustive()
    }
}
