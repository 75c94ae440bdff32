//! Static map of storage node clients
//!
//! Populated from configuration at start-up. Membership sync only changes
//! the ring; a node's client stays registered so that it can be re-added.

use crate::grpc::NodeClient;
use crate::node::StorageNode;
use cirrus_common::{NodeEndpoint, NodeId, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// Shared handle to a storage node client
pub type NodeHandle = Arc<dyn StorageNode>;

/// Node ID to client map
#[derive(Default)]
pub struct NodePool {
    nodes: RwLock<HashMap<NodeId, NodeHandle>>,
}

impl NodePool {
    /// Create a new empty pool
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build lazily connecting gRPC clients for every endpoint.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn from_endpoints(endpoints: &[NodeEndpoint]) -> Result<Self> {
        let pool = Self::new();
        for endpoint in endpoints {
            let client = NodeClient::connect_lazy(endpoint.id.clone(), &endpoint.address)?;
            pool.insert(endpoint.id.clone(), Arc::new(client));
            info!(node = %endpoint.id, address = %endpoint.address, "registered storage node");
        }
        Ok(pool)
    }

    /// Register (or replace) the client for `id`
    pub fn insert(&self, id: NodeId, client: NodeHandle) {
        self.nodes.write().insert(id, client);
    }

    pub fn remove(&self, id: &NodeId) -> Option<NodeHandle> {
        self.nodes.write().remove(id)
    }

    #[must_use]
    pub fn get(&self, id: &NodeId) -> Option<NodeHandle> {
        self.nodes.read().get(id).cloned()
    }

    #[must_use]
    pub fn contains(&self, id: &NodeId) -> bool {
        self.nodes.read().contains_key(id)
    }

    /// Registered node IDs, sorted
    #[must_use]
    pub fn ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<_> = self.nodes.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Snapshot of all registered clients
    #[must_use]
    pub fn clients(&self) -> Vec<(NodeId, NodeHandle)> {
        self.nodes
            .read()
            .iter()
            .map(|(id, client)| (id.clone(), client.clone()))
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }
}

impl std::fmt::Debug for NodePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodePool").field("nodes", &self.ids()).finish()
    }
}
