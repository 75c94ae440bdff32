//! Replica client seam

use async_trait::async_trait;
use bytes::Bytes;
use cirrus_common::{MemberStatus, NodeId, Result};
use std::collections::HashMap;

/// One replica write: body plus the coordinator-assigned timestamp
#[derive(Clone, Debug)]
pub struct ReplicaWrite {
    pub bucket: String,
    pub key: String,
    pub data: Bytes,
    /// Nanoseconds since the Unix epoch
    pub timestamp: i64,
    pub content_type: Option<String>,
}

impl ReplicaWrite {
    pub fn new(
        bucket: impl Into<String>,
        key: impl Into<String>,
        data: impl Into<Bytes>,
        timestamp: i64,
    ) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            data: data.into(),
            timestamp,
            content_type: None,
        }
    }
}

/// Body and version returned by a replica
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredObject {
    pub data: Bytes,
    pub timestamp: i64,
    pub content_type: Option<String>,
}

/// Gossip digest entry for one member
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemberDigest {
    pub id: NodeId,
    pub incarnation: i64,
    pub status: MemberStatus,
    /// Advertised RPC endpoint; empty when the sender does not know it
    pub address: String,
}

/// A member as reported by `ClusterStatus`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemberInfo {
    pub address: String,
    pub status: MemberStatus,
    /// Milliseconds since the Unix epoch
    pub last_heartbeat: i64,
}

/// Operations a coordinator or peer can invoke on a storage node
#[async_trait]
pub trait StorageNode: Send + Sync {
    /// Persist a replica if its timestamp is not older than the stored one
    async fn store(&self, write: &ReplicaWrite) -> Result<()>;

    /// Fetch the node's copy, `None` when it holds nothing for the key
    async fn retrieve(&self, bucket: &str, key: &str) -> Result<Option<StoredObject>>;

    /// Idempotent delete
    async fn delete(&self, bucket: &str, key: &str) -> Result<()>;

    /// Concatenate node-local parts into `target`, returning its size
    async fn assemble(&self, bucket: &str, target: &str, parts: &[String]) -> Result<u64>;

    /// Push our digest and receive the peer's
    async fn gossip(&self, from: &NodeId, members: Vec<MemberDigest>) -> Result<Vec<MemberDigest>>;

    /// The node's current membership view
    async fn cluster_status(&self) -> Result<HashMap<NodeId, MemberInfo>>;
}
