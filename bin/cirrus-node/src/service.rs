//! Storage node gRPC service implementation

use crate::gossip::Gossiper;
use cirrus_client::convert::digests_from_wire;
use cirrus_client::status_from_error;
use cirrus_common::{Error, NodeId, Result, now_nanos};
use cirrus_proto::storage::{
    AssembleRequest, AssembleResponse, ClusterStatusRequest, ClusterStatusResponse, DeleteRequest,
    DeleteResponse, GossipRequest, GossipResponse, MemberDigest, MemberInfo, RetrieveRequest,
    RetrieveResponse, StoreRequest, StoreResponse, storage_service_server::StorageService,
};
use cirrus_storage::{BlobStore, ObjectVersion, VersionIndex};
use dashmap::DashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tonic::{Request, Response, Status};
use tracing::{debug, error, info};

/// Directory under the data dir that holds node bookkeeping
pub const RESERVED_DIR: &str = ".cirrus";

const INDEX_FILE: &str = "index.redb";

type KeyLocks = DashMap<(String, String), Arc<Mutex<()>>>;

/// gRPC service for one storage node
pub struct NodeService {
    blobs: BlobStore,
    index: VersionIndex,
    /// Serialises check-then-write per `(bucket, key)`
    locks: KeyLocks,
    gossip: Arc<Gossiper>,
}

impl NodeService {
    /// Open the blob store and version index under `data_dir`
    pub fn open(data_dir: impl AsRef<Path>, gossip: Arc<Gossiper>) -> Result<Self> {
        let data_dir = data_dir.as_ref();
        let blobs = BlobStore::open(data_dir)?;
        let index = VersionIndex::open(blobs.base().join(RESERVED_DIR).join(INDEX_FILE))?;
        info!(data_dir = %blobs.base().display(), "storage node opened");
        Ok(Self {
            blobs,
            index,
            locks: DashMap::new(),
            gossip,
        })
    }

    #[must_use]
    pub const fn blobs(&self) -> &BlobStore {
        &self.blobs
    }

    #[must_use]
    pub const fn gossiper(&self) -> &Arc<Gossiper> {
        &self.gossip
    }

    fn validate(&self, bucket: &str, key: &str) -> Result<()> {
        if bucket == RESERVED_DIR {
            return Err(Error::invalid_input(format!("bucket name '{bucket}' is reserved")));
        }
        self.blobs.resolve(bucket, key).map(|_| ())
    }

    async fn lock(&self, bucket: &str, key: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry((bucket.to_string(), key.to_string()))
            .or_default()
            .clone();
        lock.lock_owned().await
    }

    /// Drop the lock entry once nobody else holds or waits on it
    fn release(&self, bucket: &str, key: &str, guard: OwnedMutexGuard<()>) {
        drop(guard);
        self.locks
            .remove_if(&(bucket.to_string(), key.to_string()), |_, lock| {
                Arc::strong_count(lock) == 1
            });
    }

    async fn store_object(&self, req: StoreRequest) -> Result<bool> {
        self.validate(&req.bucket, &req.key)?;
        let guard = self.lock(&req.bucket, &req.key).await;
        let result = self.store_locked(&req).await;
        self.release(&req.bucket, &req.key, guard);
        result
    }

    /// Returns `false` when a newer version was already stored
    async fn store_locked(&self, req: &StoreRequest) -> Result<bool> {
        if let Some(current) = self.index.get(&req.bucket, &req.key)? {
            if req.timestamp < current.timestamp {
                debug!(
                    bucket = %req.bucket,
                    key = %req.key,
                    timestamp = req.timestamp,
                    current = current.timestamp,
                    "ignoring stale write"
                );
                return Ok(false);
            }
        }

        let size = self
            .blobs
            .write_bytes(&req.bucket, &req.key, &req.data)
            .await?;
        let version = ObjectVersion {
            timestamp: req.timestamp,
            size,
            content_type: req.content_type.clone(),
        };
        self.index.put(&req.bucket, &req.key, &version)?;
        debug!(bucket = %req.bucket, key = %req.key, timestamp = req.timestamp, size, "stored object");
        Ok(true)
    }

    async fn retrieve_object(&self, bucket: &str, key: &str) -> Result<RetrieveResponse> {
        self.validate(bucket, key)?;
        let guard = self.lock(bucket, key).await;
        let result = self.retrieve_locked(bucket, key).await;
        self.release(bucket, key, guard);
        result
    }

    async fn retrieve_locked(&self, bucket: &str, key: &str) -> Result<RetrieveResponse> {
        let data = match self.blobs.read_all(bucket, key).await {
            Ok(data) => data,
            Err(e) if e.is_not_found() => {
                return Ok(RetrieveResponse {
                    found: false,
                    ..RetrieveResponse::default()
                });
            }
            Err(e) => return Err(e),
        };
        // Bodies written without the index (local mode) count as the oldest version
        let version = self.index.get(bucket, key)?;
        Ok(RetrieveResponse {
            found: true,
            data,
            timestamp: version.as_ref().map_or(0, |v| v.timestamp),
            content_type: version.and_then(|v| v.content_type),
        })
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<()> {
        self.validate(bucket, key)?;
        let guard = self.lock(bucket, key).await;
        let result = self.delete_locked(bucket, key).await;
        self.release(bucket, key, guard);
        result
    }

    async fn delete_locked(&self, bucket: &str, key: &str) -> Result<()> {
        self.blobs.delete(bucket, key).await?;
        self.index.remove(bucket, key)?;
        debug!(bucket, key, "deleted object");
        Ok(())
    }

    async fn assemble_object(&self, bucket: &str, target: &str, parts: &[String]) -> Result<u64> {
        self.validate(bucket, target)?;
        for part in parts {
            self.validate(bucket, part)?;
        }

        let guard = self.lock(bucket, target).await;
        let result = self.assemble_locked(bucket, target, parts).await;
        self.release(bucket, target, guard);
        result
    }

    async fn assemble_locked(&self, bucket: &str, target: &str, parts: &[String]) -> Result<u64> {
        let size = self.blobs.assemble(bucket, target, parts).await?;
        // The node stamps the assembled body itself
        let version = ObjectVersion {
            timestamp: now_nanos(),
            size,
            content_type: None,
        };
        self.index.put(bucket, target, &version)?;
        for part in parts {
            self.index.remove(bucket, part)?;
        }
        info!(bucket, target, parts = parts.len(), size, "assembled object");
        Ok(size)
    }
}

/// Log server-side failures and map them onto a status
fn rpc_error(op: &str, err: &Error) -> Status {
    if err.is_internal() {
        error!(op, error = %err, "request failed");
    } else {
        debug!(op, error = %err, "request rejected");
    }
    status_from_error(err)
}

#[tonic::async_trait]
impl StorageService for NodeService {
    async fn store(&self, request: Request<StoreRequest>) -> Result<Response<StoreResponse>, Status> {
        let req = request.into_inner();
        // Stale writes are acknowledged; the newer version already satisfies the writer
        self.store_object(req)
            .await
            .map_err(|e| rpc_error("store", &e))?;
        Ok(Response::new(StoreResponse { success: true }))
    }

    async fn retrieve(
        &self,
        request: Request<RetrieveRequest>,
    ) -> Result<Response<RetrieveResponse>, Status> {
        let req = request.into_inner();
        let response = self
            .retrieve_object(&req.bucket, &req.key)
            .await
            .map_err(|e| rpc_error("retrieve", &e))?;
        Ok(Response::new(response))
    }

    async fn delete(
        &self,
        request: Request<DeleteRequest>,
    ) -> Result<Response<DeleteResponse>, Status> {
        let req = request.into_inner();
        self.delete_object(&req.bucket, &req.key)
            .await
            .map_err(|e| rpc_error("delete", &e))?;
        Ok(Response::new(DeleteResponse { success: true }))
    }

    async fn assemble(
        &self,
        request: Request<AssembleRequest>,
    ) -> Result<Response<AssembleResponse>, Status> {
        let req = request.into_inner();
        let size = self
            .assemble_object(&req.bucket, &req.target_key, &req.part_keys)
            .await
            .map_err(|e| rpc_error("assemble", &e))?;
        Ok(Response::new(AssembleResponse {
            size: i64::try_from(size).unwrap_or(i64::MAX),
        }))
    }

    async fn gossip(
        &self,
        request: Request<GossipRequest>,
    ) -> Result<Response<GossipResponse>, Status> {
        let req = request.into_inner();
        if req.from.is_empty() {
            return Err(Status::invalid_argument("gossip without sender id"));
        }
        let digest = self
            .gossip
            .handle(&NodeId::new(req.from), &digests_from_wire(req.members));
        Ok(Response::new(GossipResponse {
            members: digest.iter().map(MemberDigest::from).collect(),
        }))
    }

    async fn cluster_status(
        &self,
        _request: Request<ClusterStatusRequest>,
    ) -> Result<Response<ClusterStatusResponse>, Status> {
        let members = self
            .gossip
            .membership()
            .cluster_status()
            .iter()
            .map(|(id, info)| (id.to_string(), MemberInfo::from(info)))
            .collect();
        Ok(Response::new(ClusterStatusResponse { members }))
    }
}
