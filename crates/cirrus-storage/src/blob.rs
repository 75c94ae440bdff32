//! On-disk blob store
//!
//! Objects live at `<base>/<bucket>/<key>`. Writes stream into a temporary
//! sibling file and are renamed into place, so a reader never observes a
//! partially written body.

use crate::path::resolve_object_path;
use cirrus_common::{Error, Result};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};
use uuid::Uuid;

/// Local filesystem blob store rooted at a base directory
#[derive(Debug, Clone)]
pub struct BlobStore {
    /// Canonical base directory
    base: PathBuf,
}

impl BlobStore {
    /// Open the store, creating the base directory if needed
    pub fn open(base: impl AsRef<Path>) -> Result<Self> {
        let base = base.as_ref();
        std::fs::create_dir_all(base).map_err(|e| {
            Error::internal_with(format!("cannot create storage base {}", base.display()), e)
        })?;
        let base = base.canonicalize().map_err(|e| {
            Error::internal_with(format!("cannot resolve storage base {}", base.display()), e)
        })?;
        Ok(Self { base })
    }

    /// Canonical base directory
    #[must_use]
    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Resolve `(bucket, key)` to its on-disk path
    pub fn resolve(&self, bucket: &str, key: &str) -> Result<PathBuf> {
        resolve_object_path(&self.base, bucket, key)
    }

    /// Stream `reader` into `(bucket, key)`, returning the number of bytes written
    pub async fn write<R>(&self, bucket: &str, key: &str, mut reader: R) -> Result<u64>
    where
        R: AsyncRead + Unpin + Send,
    {
        let path = self.resolve(bucket, key)?;
        self.ensure_parent(bucket, &path).await?;

        let tmp = temp_sibling(&path);
        let result = async {
            let mut file = File::create(&tmp).await?;
            let size = tokio::io::copy(&mut reader, &mut file).await?;
            file.flush().await?;
            file.sync_all().await?;
            drop(file);
            fs::rename(&tmp, &path).await?;
            Ok::<_, std::io::Error>(size)
        }
        .await;

        match result {
            Ok(size) => {
                debug!(bucket, key, size, "wrote object");
                Ok(size)
            }
            Err(e) => {
                remove_quietly(&tmp).await;
                Err(Error::internal_with(
                    format!("write {bucket}/{key} failed: {e}"),
                    e,
                ))
            }
        }
    }

    /// Write an in-memory body
    pub async fn write_bytes(&self, bucket: &str, key: &str, data: &[u8]) -> Result<u64> {
        self.write(bucket, key, data).await
    }

    /// Open `(bucket, key)` for streaming reads
    pub async fn read(&self, bucket: &str, key: &str) -> Result<File> {
        let path = self.resolve(bucket, key)?;
        match File::open(&path).await {
            Ok(file) => {
                let meta = file.metadata().await?;
                if meta.is_dir() {
                    return Err(Error::object_not_found(bucket, key));
                }
                Ok(file)
            }
            Err(e) if is_missing(&e) => Err(Error::object_not_found(bucket, key)),
            Err(e) => Err(Error::internal_with(
                format!("read {bucket}/{key} failed: {e}"),
                e,
            )),
        }
    }

    /// Read a whole object into memory
    pub async fn read_all(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        let mut file = self.read(bucket, key).await?;
        let mut data = Vec::new();
        file.read_to_end(&mut data).await?;
        Ok(data)
    }

    /// Check whether `(bucket, key)` holds an object
    pub async fn exists(&self, bucket: &str, key: &str) -> Result<bool> {
        let path = self.resolve(bucket, key)?;
        Ok(fs::metadata(&path).await.is_ok_and(|m| m.is_file()))
    }

    /// Delete `(bucket, key)`; missing objects are not an error
    pub async fn delete(&self, bucket: &str, key: &str) -> Result<()> {
        let path = self.resolve(bucket, key)?;
        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!(bucket, key, "deleted object");
                Ok(())
            }
            Err(e) if is_missing(&e) => Ok(()),
            Err(e) => Err(Error::internal_with(
                format!("delete {bucket}/{key} failed: {e}"),
                e,
            )),
        }
    }

    /// Concatenate `parts` (in the given order) into `target`, then delete the parts.
    ///
    /// Either the full concatenation is renamed into `target` or nothing
    /// changes there; the temporary file is removed on failure.
    pub async fn assemble(&self, bucket: &str, target: &str, parts: &[String]) -> Result<u64> {
        let target_path = self.resolve(bucket, target)?;
        let part_paths = parts
            .iter()
            .map(|p| self.resolve(bucket, p))
            .collect::<Result<Vec<_>>>()?;
        if part_paths.contains(&target_path) {
            return Err(Error::invalid_input(format!(
                "assemble target {target} is also listed as a part"
            )));
        }

        self.ensure_parent(bucket, &target_path).await?;
        let tmp = temp_sibling(&target_path);

        let result = async {
            let mut out = File::create(&tmp).await.map_err(|e| io_internal("create", &tmp, e))?;
            let mut size = 0u64;
            for (name, path) in parts.iter().zip(&part_paths) {
                let mut part = match File::open(path).await {
                    Ok(f) => f,
                    Err(e) if is_missing(&e) => {
                        return Err(Error::internal(format!(
                            "assemble {bucket}/{target}: part {name} is missing"
                        )));
                    }
                    Err(e) => return Err(io_internal("open", path, e)),
                };
                size += tokio::io::copy(&mut part, &mut out)
                    .await
                    .map_err(|e| io_internal("copy", path, e))?;
            }
            out.flush().await.map_err(|e| io_internal("flush", &tmp, e))?;
            out.sync_all().await.map_err(|e| io_internal("sync", &tmp, e))?;
            drop(out);
            fs::rename(&tmp, &target_path)
                .await
                .map_err(|e| io_internal("rename", &tmp, e))?;
            Ok(size)
        }
        .await;

        let size = match result {
            Ok(size) => size,
            Err(e) => {
                remove_quietly(&tmp).await;
                return Err(e);
            }
        };

        for (name, path) in parts.iter().zip(&part_paths) {
            if let Err(e) = fs::remove_file(path).await {
                if !is_missing(&e) {
                    warn!(bucket, part = %name, error = %e, "failed to remove assembled part");
                }
            }
        }

        debug!(bucket, target, parts = parts.len(), size, "assembled object");
        Ok(size)
    }

    /// Create the bucket directory (mode 0755) and any key subdirectories
    async fn ensure_parent(&self, bucket: &str, path: &Path) -> Result<()> {
        let bucket_dir = self.base.join(bucket);
        create_dir_all(&bucket_dir).await?;
        if let Some(parent) = path.parent() {
            if parent != bucket_dir {
                create_dir_all(parent).await?;
            }
        }
        Ok(())
    }
}

async fn create_dir_all(dir: &Path) -> Result<()> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    builder.mode(0o755);
    builder
        .create(dir)
        .await
        .map_err(|e| io_internal("create directory", dir, e))
}

/// `.<name>.tmp-<uuid>` next to `path`
fn temp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{name}.tmp-{}", Uuid::new_v4().simple()))
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = fs::remove_file(path).await {
        if !is_missing(&e) {
            warn!(path = ?path, error = %e, "failed to remove temporary file");
        }
    }
}

fn is_missing(e: &std::io::Error) -> bool {
    matches!(e.kind(), ErrorKind::NotFound)
}

fn io_internal(op: &str, path: &Path, e: std::io::Error) -> Error {
    Error::internal_with(format!("{op} {} failed: {e}", path.display()), e)
}
