//! Replicating coordinator
//!
//! Every object is stored on the `N` ring owners of `bucket/key`. Writes are
//! stamped with the coordinator's wall clock and succeed once `W = N/2 + 1`
//! replicas acknowledge. Reads ask every replica, serve the highest
//! timestamp and repair stale replicas in the background.
//!
//! ```text
//!            ┌──────────────┐
//!  write ───►│ Coordinator  │── ring.get_nodes(bucket/key, N)
//!            └──────┬───────┘
//!        ┌──────────┼──────────┐     Store{data, ts} in parallel,
//!        ▼          ▼          ▼     each bounded by request_timeout
//!    ┌───────┐  ┌───────┐  ┌───────┐
//!    │ node a│  │ node b│  │ node c│
//!    └───────┘  └───────┘  └───────┘
//! ```

use crate::membership::{self, SyncTask};
use bytes::{Bytes, BytesMut};
use cirrus_client::{NodeHandle, NodePool, ReplicaWrite, StoredObject};
use cirrus_common::{CoordinatorConfig, Error, NodeId, Result, StorageConfig, now_nanos};
use cirrus_placement::{HashRing, placement_key};
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, info, warn};

/// Coordinator over a static set of storage nodes
pub struct Coordinator {
    config: CoordinatorConfig,
    ring: Arc<RwLock<HashRing>>,
    nodes: Arc<NodePool>,
    sync: Mutex<Option<SyncTask>>,
}

impl Coordinator {
    /// Create a coordinator whose ring holds every node in `nodes`
    #[must_use]
    pub fn new(config: CoordinatorConfig, nodes: Arc<NodePool>) -> Self {
        let ring = HashRing::with_nodes(config.virtual_nodes, &nodes.ids());
        info!(
            nodes = ring.len(),
            replicas = config.replica_count,
            write_quorum = config.write_quorum(),
            "coordinator ready"
        );
        Self {
            config,
            ring: Arc::new(RwLock::new(ring)),
            nodes,
            sync: Mutex::new(None),
        }
    }

    /// Build gRPC clients for the configured nodes.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn from_config(config: &StorageConfig) -> Result<Self> {
        if config.nodes.is_empty() {
            return Err(Error::invalid_input(
                "distributed storage requires at least one node",
            ));
        }
        let nodes = NodePool::from_endpoints(&config.nodes)?;
        Ok(Self::new(config.coordinator(), Arc::new(nodes)))
    }

    #[must_use]
    pub const fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    #[must_use]
    pub fn nodes(&self) -> &Arc<NodePool> {
        &self.nodes
    }

    /// Ordered replica set of `(bucket, key)` under the current ring
    #[must_use]
    pub fn replicas(&self, bucket: &str, key: &str) -> Vec<NodeId> {
        self.ring
            .read()
            .get_nodes(&placement_key(bucket, key), self.config.replica_count)
    }

    /// Nodes currently on the ring, sorted
    #[must_use]
    pub fn ring_nodes(&self) -> Vec<NodeId> {
        self.ring.read().node_ids().cloned().collect()
    }

    /// Put a node back on the ring; its client must already be registered
    pub fn add_node(&self, id: &NodeId) -> Result<bool> {
        if !self.nodes.contains(id) {
            return Err(Error::invalid_input(format!("no client registered for node {id}")));
        }
        Ok(self.ring.write().add_node(id))
    }

    pub fn remove_node(&self, id: &NodeId) -> bool {
        self.ring.write().remove_node(id)
    }

    /// Drain `reader` and write it with a fresh timestamp
    pub async fn write<R>(&self, bucket: &str, key: &str, mut reader: R) -> Result<u64>
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut data = Vec::new();
        reader.read_to_end(&mut data).await?;
        self.write_bytes(bucket, key, Bytes::from(data)).await
    }

    /// Write `data` with a fresh timestamp; returns its size once a write
    /// quorum acknowledged
    pub async fn write_bytes(&self, bucket: &str, key: &str, data: Bytes) -> Result<u64> {
        let write = ReplicaWrite::new(bucket, key, data, now_nanos());
        self.write_replicas(&write).await
    }

    async fn write_replicas(&self, write: &ReplicaWrite) -> Result<u64> {
        let replicas = self.resolve(&write.bucket, &write.key)?;
        let quorum = self.config.write_quorum();

        let results = join_all(replicas.iter().map(|(id, client)| async move {
            let result = match client {
                Some(client) => self.timed(id, "store", client.store(write)).await,
                None => Err(no_client(id)),
            };
            (id, result)
        }))
        .await;

        let mut successes = 0;
        let mut last_err = None;
        for (id, result) in results {
            match result {
                Ok(()) => successes += 1,
                Err(e) => {
                    warn!(node = %id, bucket = %write.bucket, key = %write.key, error = %e, "replica write failed");
                    last_err = Some(e);
                }
            }
        }

        if successes >= quorum {
            debug!(
                bucket = %write.bucket,
                key = %write.key,
                timestamp = write.timestamp,
                successes,
                "write committed"
            );
            return Ok(write.data.len() as u64);
        }

        let last = last_err.map_or_else(|| "no replica reachable".to_string(), |e| e.to_string());
        Err(Error::internal(format!(
            "quorum failed ({successes}/{quorum}): {last}"
        )))
    }

    /// Read the newest copy of `(bucket, key)` across its replicas.
    ///
    /// Replicas that answered with nothing or an older timestamp are
    /// rewritten in the background.
    pub async fn read(&self, bucket: &str, key: &str) -> Result<StoredObject> {
        let replicas = self.resolve(bucket, key)?;

        let results = join_all(replicas.into_iter().map(|(id, client)| async move {
            let result = match &client {
                Some(c) => self.timed(&id, "retrieve", c.retrieve(bucket, key)).await,
                None => Err(no_client(&id)),
            };
            (id, client, result)
        }))
        .await;

        let mut best: Option<StoredObject> = None;
        let mut answered: Vec<(NodeId, NodeHandle, Option<i64>)> = Vec::new();
        let mut last_err = None;
        for (id, client, result) in results {
            match (client, result) {
                (Some(client), Ok(found)) => {
                    let timestamp = found.as_ref().map(|o| o.timestamp);
                    if let Some(obj) = found {
                        if best.as_ref().is_none_or(|b| obj.timestamp > b.timestamp) {
                            best = Some(obj);
                        }
                    }
                    answered.push((id, client, timestamp));
                }
                (_, Err(e)) => {
                    warn!(node = %id, bucket, key, error = %e, "replica read failed");
                    last_err = Some(e);
                }
                (None, Ok(_)) => {}
            }
        }

        if answered.is_empty() {
            let last = last_err.map_or_else(|| "no replica reachable".to_string(), |e| e.to_string());
            return Err(Error::internal(format!("read failed: {last}")));
        }
        let Some(best) = best else {
            return Err(Error::object_not_found(bucket, key));
        };

        let stale: Vec<(NodeId, NodeHandle)> = answered
            .into_iter()
            .filter(|(_, _, ts)| ts.is_none_or(|t| t < best.timestamp))
            .map(|(id, client, _)| (id, client))
            .collect();
        if !stale.is_empty() {
            self.spawn_repair(bucket, key, &best, stale);
        }

        Ok(best)
    }

    /// Read and return only the body
    pub async fn read_bytes(&self, bucket: &str, key: &str) -> Result<Bytes> {
        Ok(self.read(bucket, key).await?.data)
    }

    fn spawn_repair(
        &self,
        bucket: &str,
        key: &str,
        winner: &StoredObject,
        stale: Vec<(NodeId, NodeHandle)>,
    ) {
        let mut write = ReplicaWrite::new(bucket, key, winner.data.clone(), winner.timestamp);
        write.content_type.clone_from(&winner.content_type);
        let timeout = self.config.request_timeout();

        debug!(bucket, key, timestamp = write.timestamp, stale = stale.len(), "scheduling read-repair");
        tokio::spawn(async move {
            let write = &write;
            let results = join_all(stale.iter().map(|(id, client)| async move {
                let result = with_deadline(timeout, id, "repair", client.store(write)).await;
                (id, result)
            }))
            .await;
            for (id, result) in results {
                match result {
                    Ok(()) => debug!(node = %id, bucket = %write.bucket, key = %write.key, "replica repaired"),
                    Err(e) => {
                        warn!(node = %id, bucket = %write.bucket, key = %write.key, error = %e, "read-repair failed");
                    }
                }
            }
        });
    }

    /// Best-effort delete on every replica; succeeds if any acknowledged
    pub async fn delete(&self, bucket: &str, key: &str) -> Result<()> {
        let replicas = self.replicas(bucket, key);
        if replicas.is_empty() {
            warn!(bucket, key, "delete with an empty ring");
            return Ok(());
        }

        let results = join_all(replicas.iter().map(|id| async move {
            match self.nodes.get(id) {
                Some(client) => self.timed(id, "delete", client.delete(bucket, key)).await,
                None => Err(no_client(id)),
            }
        }))
        .await;

        let mut acked = 0;
        let mut last_err = None;
        for (id, result) in replicas.iter().zip(results) {
            match result {
                Ok(()) => acked += 1,
                Err(e) => {
                    warn!(node = %id, bucket, key, error = %e, "replica delete failed");
                    last_err = Some(e);
                }
            }
        }

        match last_err {
            Some(e) if acked == 0 => Err(e),
            _ => {
                debug!(bucket, key, acked, "deleted");
                Ok(())
            }
        }
    }

    /// Concatenate `parts` into `target`.
    ///
    /// Parts are placed independently on the ring, so each is read through
    /// the quorum read path and the result is written as one new object.
    /// Parts are deleted afterwards on a best-effort basis.
    pub async fn assemble(&self, bucket: &str, target: &str, parts: &[String]) -> Result<u64> {
        if parts.iter().any(|p| p == target) {
            return Err(Error::invalid_input(format!(
                "assemble target {target} is also listed as a part"
            )));
        }

        let mut body = BytesMut::new();
        for part in parts {
            match self.read(bucket, part).await {
                Ok(obj) => body.extend_from_slice(&obj.data),
                Err(e) if e.is_not_found() => {
                    return Err(Error::internal(format!(
                        "assemble {bucket}/{target}: part {part} is missing"
                    )));
                }
                Err(e) => return Err(e),
            }
        }

        let size = self.write_bytes(bucket, target, body.freeze()).await?;

        for part in parts {
            if let Err(e) = self.delete(bucket, part).await {
                warn!(bucket, part = %part, error = %e, "failed to remove assembled part");
            }
        }

        info!(bucket, target, parts = parts.len(), size, "assembled object");
        Ok(size)
    }

    /// Run one membership sync round; returns the nodes removed from the ring
    pub async fn sync_once(&self) -> Result<Vec<NodeId>> {
        membership::sync_round(&self.ring, &self.nodes, self.config.probe_timeout()).await
    }

    /// Start the background membership sync loop. No-op if already running.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self) {
        let mut sync = self.sync.lock();
        if sync.is_none() {
            *sync = Some(SyncTask::spawn(
                Arc::clone(&self.ring),
                Arc::clone(&self.nodes),
                self.config.sync_interval(),
                self.config.probe_timeout(),
            ));
        }
    }

    /// Stop the sync loop and wait for it to exit
    pub async fn stop(&self) {
        let task = self.sync.lock().take();
        if let Some(task) = task {
            task.shutdown().await;
        }
    }

    fn resolve(&self, bucket: &str, key: &str) -> Result<Vec<(NodeId, Option<NodeHandle>)>> {
        let replicas = self.replicas(bucket, key);
        if replicas.is_empty() {
            return Err(Error::internal("no storage nodes available"));
        }
        Ok(replicas
            .into_iter()
            .map(|id| {
                let client = self.nodes.get(&id);
                (id, client)
            })
            .collect())
    }

    async fn timed<T>(
        &self,
        node: &NodeId,
        op: &str,
        call: impl Future<Output = Result<T>> + Send,
    ) -> Result<T> {
        with_deadline(self.config.request_timeout(), node, op, call).await
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        if let Some(task) = self.sync.get_mut().take() {
            task.abort();
        }
    }
}

async fn with_deadline<T>(
    timeout: Duration,
    node: &NodeId,
    op: &str,
    call: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::time::timeout(timeout, call)
        .await
        .unwrap_or_else(|_| Err(Error::internal(format!("{op} on node {node} timed out after {timeout:?}"))))
}

fn no_client(id: &NodeId) -> Error {
    Error::internal(format!("no client registered for node {id}"))
}
