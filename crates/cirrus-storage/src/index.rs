//! Persistent per-object version index backed by redb.
//!
//! Maps `(bucket, key)` to the write timestamp, size and content type of the
//! body currently on disk. Storage nodes consult it to decide whether an
//! incoming replica write supersedes what they hold. Reads are served from an
//! in-memory cache that is filled lazily from redb. Only present records are
//! cached.

use cirrus_common::Error;
use parking_lot::RwLock;
use redb::{Database, TableDefinition};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

const OBJECT_VERSIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("object_versions");

/// Error type for version index operations
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("redb error: {0}")]
    Redb(#[from] redb::DatabaseError),
    #[error("redb storage error: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("redb table error: {0}")]
    Table(#[from] redb::TableError),
    #[error("redb transaction error: {0}")]
    Transaction(Box<redb::TransactionError>),
    #[error("redb commit error: {0}")]
    Commit(#[from] redb::CommitError),
    #[error("bincode error: {0}")]
    Bincode(#[from] bincode::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<redb::TransactionError> for IndexError {
    fn from(e: redb::TransactionError) -> Self {
        Self::Transaction(Box::new(e))
    }
}

impl From<IndexError> for Error {
    fn from(e: IndexError) -> Self {
        Self::internal_with(format!("version index: {e}"), e)
    }
}

pub type IndexResult<T> = Result<T, IndexError>;

/// Version record for one stored object
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectVersion {
    /// Coordinator-assigned write timestamp (ns since epoch)
    pub timestamp: i64,
    /// Body size in bytes
    pub size: u64,
    pub content_type: Option<String>,
}

/// Version index for a node's blob store
pub struct VersionIndex {
    db: Database,
    cache: RwLock<HashMap<String, ObjectVersion>>,
}

impl VersionIndex {
    /// Open (or create) the index database at `path`
    pub fn open(path: impl AsRef<Path>) -> IndexResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;

        // Create the table eagerly so later read txns don't fail
        let write_txn = db.begin_write()?;
        {
            let _t = write_txn.open_table(OBJECT_VERSIONS)?;
        }
        write_txn.commit()?;

        Ok(Self {
            db,
            cache: RwLock::new(HashMap::new()),
        })
    }

    /// Look up the version of `(bucket, key)`
    pub fn get(&self, bucket: &str, key: &str) -> IndexResult<Option<ObjectVersion>> {
        let id = index_key(bucket, key);
        if let Some(cached) = self.cache.read().get(&id) {
            return Ok(Some(cached.clone()));
        }

        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(OBJECT_VERSIONS)?;
        let version = match table.get(id.as_str())? {
            Some(val) => Some(bincode::deserialize::<ObjectVersion>(val.value())?),
            None => None,
        };

        if let Some(version) = &version {
            self.cache.write().insert(id, version.clone());
        }
        Ok(version)
    }

    /// Record the version of `(bucket, key)`
    pub fn put(&self, bucket: &str, key: &str, version: &ObjectVersion) -> IndexResult<()> {
        let id = index_key(bucket, key);
        let bytes = bincode::serialize(version)?;

        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(OBJECT_VERSIONS)?;
            table.insert(id.as_str(), bytes.as_slice())?;
        }
        write_txn.commit()?;

        self.cache.write().insert(id, version.clone());
        Ok(())
    }

    /// Forget `(bucket, key)`; missing entries are not an error
    pub fn remove(&self, bucket: &str, key: &str) -> IndexResult<()> {
        let id = index_key(bucket, key);

        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(OBJECT_VERSIONS)?;
            table.remove(id.as_str())?;
        }
        write_txn.commit()?;

        self.cache.write().remove(&id);
        Ok(())
    }
}

/// Bucket names cannot contain NUL, so `bucket\0key` is unambiguous
fn index_key(bucket: &str, key: &str) -> String {
    format!("{bucket}\0{key}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn version(timestamp: i64) -> ObjectVersion {
        ObjectVersion {
            timestamp,
            size: 5,
            content_type: Some("text/plain".to_string()),
        }
    }

    #[test]
    fn test_put_get_remove() {
        let dir = tempdir().unwrap();
        let index = VersionIndex::open(dir.path().join("meta/versions.redb")).unwrap();

        assert_eq!(index.get("bk", "k").unwrap(), None);
        index.put("bk", "k", &version(10)).unwrap();
        assert_eq!(index.get("bk", "k").unwrap(), Some(version(10)));

        index.put("bk", "k", &version(20)).unwrap();
        assert_eq!(index.get("bk", "k").unwrap().unwrap().timestamp, 20);

        index.remove("bk", "k").unwrap();
        index.remove("bk", "k").unwrap();
        assert_eq!(index.get("bk", "k").unwrap(), None);
    }

    #[test]
    fn test_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("versions.redb");
        {
            let index = VersionIndex::open(&path).unwrap();
            index.put("bk", "a/b", &version(42)).unwrap();
        }
        let index = VersionIndex::open(&path).unwrap();
        assert_eq!(index.get("bk", "a/b").unwrap(), Some(version(42)));
        assert_eq!(index.get("bk", "a").unwrap(), None);
    }

    #[test]
    fn test_keys_do_not_collide() {
        let dir = tempdir().unwrap();
        let index = VersionIndex::open(dir.path().join("versions.redb")).unwrap();
        index.put("ab", "c", &version(1)).unwrap();
        assert_eq!(index.get("a", "bc").unwrap(), None);
    }

    #[test]
    fn test_misses_and_removals_leave_cache_empty() {
        let dir = tempdir().unwrap();
        let index = VersionIndex::open(dir.path().join("versions.redb")).unwrap();

        for i in 0..100 {
            assert_eq!(index.get("bk", &format!("missing-{i}")).unwrap(), None);
        }
        assert!(index.cache.read().is_empty());

        index.put("bk", "k", &version(1)).unwrap();
        assert_eq!(index.cache.read().len(), 1);
        index.remove("bk", "k").unwrap();
        assert!(index.cache.read().is_empty());
        assert_eq!(index.get("bk", "k").unwrap(), None);
    }
}
