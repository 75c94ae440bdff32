//! gRPC-backed storage node client

use crate::convert::{digests_from_wire, error_from_status};
use crate::node::{MemberDigest, MemberInfo, ReplicaWrite, StorageNode, StoredObject};
use async_trait::async_trait;
use cirrus_common::{Error, NodeId, Result, config::with_scheme};
use cirrus_proto::storage as pb;
use cirrus_proto::storage::storage_service_client::StorageServiceClient;
use std::collections::HashMap;
use std::time::Duration;
use tonic::transport::{Channel, Endpoint};
use tracing::{debug, warn};

/// Increased message size limit for large objects (100 MB)
pub const MAX_MESSAGE_SIZE: usize = 100 * 1024 * 1024;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Client for one storage node's `StorageService`
#[derive(Clone)]
pub struct NodeClient {
    id: NodeId,
    address: String,
    client: StorageServiceClient<Channel>,
}

impl std::fmt::Debug for NodeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeClient")
            .field("id", &self.id)
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

impl NodeClient {
    /// Create a client that connects on first use.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn connect_lazy(id: NodeId, address: &str) -> Result<Self> {
        let address = with_scheme(address);
        let channel = endpoint(&address)?.connect_lazy();
        Ok(Self::from_channel(id, address, channel))
    }

    /// Create a client and establish the connection eagerly
    pub async fn connect(id: NodeId, address: &str) -> Result<Self> {
        let address = with_scheme(address);
        let channel = endpoint(&address)?.connect().await.map_err(|e| {
            Error::internal_with(format!("connect to {id} at {address} failed: {e}"), e)
        })?;
        debug!(node = %id, address = %address, "connected to storage node");
        Ok(Self::from_channel(id, address, channel))
    }

    fn from_channel(id: NodeId, address: String, channel: Channel) -> Self {
        let client = StorageServiceClient::new(channel)
            .max_decoding_message_size(MAX_MESSAGE_SIZE)
            .max_encoding_message_size(MAX_MESSAGE_SIZE);
        Self {
            id,
            address,
            client,
        }
    }

    #[must_use]
    pub const fn id(&self) -> &NodeId {
        &self.id
    }

    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    fn rpc_error(&self, op: &str, status: tonic::Status) -> Error {
        debug!(node = %self.id, op, code = ?status.code(), message = status.message(), "rpc failed");
        error_from_status(status)
    }
}

fn endpoint(address: &str) -> Result<Endpoint> {
    Endpoint::new(address.to_string())
        .map(|e| e.connect_timeout(CONNECT_TIMEOUT))
        .map_err(|e| Error::invalid_input(format!("bad node address '{address}': {e}")))
}

#[async_trait]
impl StorageNode for NodeClient {
    async fn store(&self, write: &ReplicaWrite) -> Result<()> {
        let request = pb::StoreRequest {
            bucket: write.bucket.clone(),
            key: write.key.clone(),
            data: write.data.to_vec(),
            timestamp: write.timestamp,
            content_type: write.content_type.clone(),
        };
        let response = self
            .client
            .clone()
            .store(request)
            .await
            .map_err(|s| self.rpc_error("store", s))?
            .into_inner();
        if response.success {
            Ok(())
        } else {
            Err(Error::internal(format!(
                "node {} rejected store of {}/{}",
                self.id, write.bucket, write.key
            )))
        }
    }

    async fn retrieve(&self, bucket: &str, key: &str) -> Result<Option<StoredObject>> {
        let request = pb::RetrieveRequest {
            bucket: bucket.to_string(),
            key: key.to_string(),
        };
        let response = self
            .client
            .clone()
            .retrieve(request)
            .await
            .map_err(|s| self.rpc_error("retrieve", s))?
            .into_inner();
        if !response.found {
            return Ok(None);
        }
        Ok(Some(StoredObject {
            data: response.data.into(),
            timestamp: response.timestamp,
            content_type: response.content_type,
        }))
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<()> {
        let request = pb::DeleteRequest {
            bucket: bucket.to_string(),
            key: key.to_string(),
        };
        let response = self
            .client
            .clone()
            .delete(request)
            .await
            .map_err(|s| self.rpc_error("delete", s))?
            .into_inner();
        if !response.success {
            warn!(node = %self.id, bucket, key, "delete reported no success");
        }
        Ok(())
    }

    async fn assemble(&self, bucket: &str, target: &str, parts: &[String]) -> Result<u64> {
        let request = pb::AssembleRequest {
            bucket: bucket.to_string(),
            target_key: target.to_string(),
            part_keys: parts.to_vec(),
        };
        let response = self
            .client
            .clone()
            .assemble(request)
            .await
            .map_err(|s| self.rpc_error("assemble", s))?
            .into_inner();
        u64::try_from(response.size)
            .map_err(|_| Error::internal(format!("node {} returned negative size", self.id)))
    }

    async fn gossip(&self, from: &NodeId, members: Vec<MemberDigest>) -> Result<Vec<MemberDigest>> {
        let request = pb::GossipRequest {
            from: from.to_string(),
            members: members.iter().map(pb::MemberDigest::from).collect(),
        };
        let response = self
            .client
            .clone()
            .gossip(request)
            .await
            .map_err(|s| self.rpc_error("gossip", s))?
            .into_inner();
        Ok(digests_from_wire(response.members))
    }

    async fn cluster_status(&self) -> Result<HashMap<NodeId, MemberInfo>> {
        let response = self
            .client
            .clone()
            .cluster_status(pb::ClusterStatusRequest {})
            .await
            .map_err(|s| self.rpc_error("cluster_status", s))?
            .into_inner();

        let mut members = HashMap::with_capacity(response.members.len());
        for (id, info) in response.members {
            match MemberInfo::try_from(info) {
                Ok(info) => {
                    members.insert(NodeId::new(id), info);
                }
                Err(e) => warn!(node = %self.id, member = %id, error = %e, "ignoring member"),
            }
        }
        Ok(members)
    }
}
