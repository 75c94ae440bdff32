//! In-memory storage node for coordinator tests

use async_trait::async_trait;
use bytes::Bytes;
use cirrus_client::{MemberDigest, MemberInfo, NodePool, ReplicaWrite, StorageNode, StoredObject};
use cirrus_common::{Error, MemberStatus, NodeId, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

#[derive(Default)]
pub struct FakeNode {
    objects: Mutex<HashMap<(String, String), StoredObject>>,
    stores: Mutex<Vec<ReplicaWrite>>,
    members: Mutex<HashMap<NodeId, MemberInfo>>,
    fail: AtomicBool,
    delay: Mutex<Option<Duration>>,
    pub status_calls: AtomicUsize,
}

impl FakeNode {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        let node = Self::new();
        node.set_failing(true);
        node
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    pub fn seed(&self, bucket: &str, key: &str, data: &str, timestamp: i64) {
        self.objects.lock().insert(
            (bucket.to_string(), key.to_string()),
            StoredObject {
                data: Bytes::copy_from_slice(data.as_bytes()),
                timestamp,
                content_type: None,
            },
        );
    }

    pub fn set_member(&self, id: &str, status: MemberStatus) {
        self.members.lock().insert(
            NodeId::from(id),
            MemberInfo {
                address: format!("http://{id}:7000"),
                status,
                last_heartbeat: 0,
            },
        );
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<StoredObject> {
        self.objects
            .lock()
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }

    /// Every `Store` this node accepted, in arrival order
    pub fn stores(&self) -> Vec<ReplicaWrite> {
        self.stores.lock().clone()
    }

    async fn enter(&self) -> Result<()> {
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::internal("injected failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl StorageNode for FakeNode {
    async fn store(&self, write: &ReplicaWrite) -> Result<()> {
        self.enter().await?;
        self.stores.lock().push(write.clone());

        let mut objects = self.objects.lock();
        let id = (write.bucket.clone(), write.key.clone());
        if objects.get(&id).is_none_or(|o| write.timestamp >= o.timestamp) {
            objects.insert(
                id,
                StoredObject {
                    data: write.data.clone(),
                    timestamp: write.timestamp,
                    content_type: write.content_type.clone(),
                },
            );
        }
        Ok(())
    }

    async fn retrieve(&self, bucket: &str, key: &str) -> Result<Option<StoredObject>> {
        self.enter().await?;
        Ok(self.object(bucket, key))
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<()> {
        self.enter().await?;
        self.objects
            .lock()
            .remove(&(bucket.to_string(), key.to_string()));
        Ok(())
    }

    async fn assemble(&self, bucket: &str, target: &str, parts: &[String]) -> Result<u64> {
        self.enter().await?;
        let mut objects = self.objects.lock();
        let mut body = Vec::new();
        for part in parts {
            let obj = objects
                .get(&(bucket.to_string(), part.clone()))
                .ok_or_else(|| Error::internal(format!("part {part} is missing")))?;
            body.extend_from_slice(&obj.data);
        }
        let size = body.len() as u64;
        objects.insert(
            (bucket.to_string(), target.to_string()),
            StoredObject {
                data: body.into(),
                timestamp: 0,
                content_type: None,
            },
        );
        Ok(size)
    }

    async fn gossip(&self, _from: &NodeId, _members: Vec<MemberDigest>) -> Result<Vec<MemberDigest>> {
        self.enter().await?;
        Ok(Vec::new())
    }

    async fn cluster_status(&self) -> Result<HashMap<NodeId, MemberInfo>> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        self.enter().await?;
        Ok(self.members.lock().clone())
    }
}

/// Register `nodes` under their names
pub fn pool(nodes: &[(&str, &Arc<FakeNode>)]) -> Arc<NodePool> {
    let pool = NodePool::new();
    for (id, node) in nodes {
        pool.insert(NodeId::from(*id), Arc::clone(*node) as Arc<dyn StorageNode>);
    }
    Arc::new(pool)
}

/// Poll `check` until it holds or `within` elapses
pub async fn eventually(within: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
