//! `FileStore` facade
//!
//! The single storage interface consumed by the rest of the system. The
//! backend (local disk or replicated cluster) is a configuration decision.

use crate::coordinator::Coordinator;
use async_trait::async_trait;
use cirrus_common::{Result, StorageConfig, StorageMode};
use cirrus_storage::BlobStore;
use std::io::Cursor;
use std::pin::Pin;
use std::sync::Arc;
use tokio::io::AsyncRead;
use tracing::info;

/// Streaming object body
pub type ObjectReader = Pin<Box<dyn AsyncRead + Send>>;

/// Object storage operations shared by every backend
#[async_trait]
pub trait FileStore: Send + Sync {
    /// Store the full contents of `reader` at `(bucket, key)`, returning its size
    async fn write(
        &self,
        bucket: &str,
        key: &str,
        reader: &mut (dyn AsyncRead + Unpin + Send),
    ) -> Result<u64>;

    /// Open `(bucket, key)` for reading
    async fn read(&self, bucket: &str, key: &str) -> Result<ObjectReader>;

    /// Remove `(bucket, key)`; removing a missing object succeeds
    async fn delete(&self, bucket: &str, key: &str) -> Result<()>;

    /// Concatenate `parts` in order into `target` and remove the parts
    async fn assemble(&self, bucket: &str, target: &str, parts: &[String]) -> Result<u64>;
}

/// Single-node backend over the local blob store
#[derive(Debug, Clone)]
pub struct LocalFileStore {
    blobs: BlobStore,
}

impl LocalFileStore {
    #[must_use]
    pub const fn new(blobs: BlobStore) -> Self {
        Self { blobs }
    }

    #[must_use]
    pub const fn blobs(&self) -> &BlobStore {
        &self.blobs
    }
}

#[async_trait]
impl FileStore for LocalFileStore {
    async fn write(
        &self,
        bucket: &str,
        key: &str,
        reader: &mut (dyn AsyncRead + Unpin + Send),
    ) -> Result<u64> {
        self.blobs.write(bucket, key, reader).await
    }

    async fn read(&self, bucket: &str, key: &str) -> Result<ObjectReader> {
        Ok(Box::pin(self.blobs.read(bucket, key).await?))
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<()> {
        self.blobs.delete(bucket, key).await
    }

    async fn assemble(&self, bucket: &str, target: &str, parts: &[String]) -> Result<u64> {
        self.blobs.assemble(bucket, target, parts).await
    }
}

/// Replicated backend over the coordinator
#[derive(Clone)]
pub struct DistributedFileStore {
    coordinator: Arc<Coordinator>,
}

impl DistributedFileStore {
    #[must_use]
    pub const fn new(coordinator: Arc<Coordinator>) -> Self {
        Self { coordinator }
    }

    #[must_use]
    pub const fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }
}

#[async_trait]
impl FileStore for DistributedFileStore {
    async fn write(
        &self,
        bucket: &str,
        key: &str,
        reader: &mut (dyn AsyncRead + Unpin + Send),
    ) -> Result<u64> {
        self.coordinator.write(bucket, key, reader).await
    }

    async fn read(&self, bucket: &str, key: &str) -> Result<ObjectReader> {
        let data = self.coordinator.read_bytes(bucket, key).await?;
        Ok(Box::pin(Cursor::new(data)))
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<()> {
        self.coordinator.delete(bucket, key).await
    }

    async fn assemble(&self, bucket: &str, target: &str, parts: &[String]) -> Result<u64> {
        self.coordinator.assemble(bucket, target, parts).await
    }
}

/// Build the backend selected by `config`.
///
/// In distributed mode the coordinator's membership sync loop is started,
/// so this must be called from within a Tokio runtime.
pub fn build_file_store(config: &StorageConfig) -> Result<Arc<dyn FileStore>> {
    match config.effective_mode() {
        StorageMode::Local => {
            let blobs = BlobStore::open(&config.base)?;
            info!(base = %blobs.base().display(), "using local file store");
            Ok(Arc::new(LocalFileStore::new(blobs)))
        }
        StorageMode::Distributed => {
            let coordinator = Arc::new(Coordinator::from_config(config)?);
            coordinator.start();
            info!(nodes = config.nodes.len(), "using distributed file store");
            Ok(Arc::new(DistributedFileStore::new(coordinator)))
        }
    }
}
