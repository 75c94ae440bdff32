//! Object path resolution
//!
//! Every `(bucket, key)` is resolved against the store's base directory
//! before any I/O happens. Resolution fails with `InvalidInput` when the
//! result could land outside the base: `..` segments, absolute paths, NUL
//! bytes, or an existing symlink somewhere along the way that points out.
//!
//! Keys must also be canonical (no empty or `.` segments), so that distinct
//! keys never name the same file.

use cirrus_common::{Error, Result};
use std::path::{Component, Path, PathBuf};
use tracing::warn;

/// Resolve `(bucket, key)` to a path under `base`.
///
/// `base` must already be canonical (see [`crate::BlobStore::open`]).
pub fn resolve_object_path(base: &Path, bucket: &str, key: &str) -> Result<PathBuf> {
    validate_bucket(bucket)?;
    let relative = validate_key(key)?;

    let mut path = base.join(bucket);
    path.push(relative);

    ensure_within(base, &path)?;
    Ok(path)
}

fn validate_bucket(bucket: &str) -> Result<()> {
    if bucket.is_empty() {
        return Err(Error::invalid_input("bucket name is empty"));
    }
    if bucket == "." || bucket == ".." {
        return Err(rejected("bucket", bucket, "relative directory reference"));
    }
    if bucket.contains(['/', '\\']) {
        return Err(rejected("bucket", bucket, "path separator"));
    }
    if bucket.contains('\0') {
        return Err(rejected("bucket", bucket, "NUL byte"));
    }
    Ok(())
}

fn validate_key(key: &str) -> Result<PathBuf> {
    if key.is_empty() {
        return Err(Error::invalid_input("object key is empty"));
    }
    if key.contains('\0') {
        return Err(rejected("key", key, "NUL byte"));
    }
    if key.ends_with('/') {
        return Err(rejected("key", key, "trailing separator"));
    }
    for segment in key.split('/') {
        match segment {
            "" => return Err(rejected("key", key, "empty path segment")),
            "." => return Err(rejected("key", key, "current directory segment")),
            _ => {}
        }
    }

    let mut relative = PathBuf::new();
    for component in Path::new(key).components() {
        match component {
            Component::Normal(name) => relative.push(name),
            Component::ParentDir => return Err(rejected("key", key, "parent directory segment")),
            Component::RootDir | Component::Prefix(_) => {
                return Err(rejected("key", key, "absolute path"));
            }
            Component::CurDir => return Err(rejected("key", key, "current directory segment")),
        }
    }

    if relative.as_os_str().is_empty() {
        return Err(rejected("key", key, "no file name"));
    }
    Ok(relative)
}

/// Check that the deepest existing ancestor of `path` (or `path` itself)
/// canonicalizes to somewhere under `base`.
fn ensure_within(base: &Path, path: &Path) -> Result<()> {
    let mut probe = path;
    loop {
        // symlink_metadata so that a dangling link still counts as existing
        if probe.symlink_metadata().is_ok() {
            let resolved = probe.canonicalize().map_err(|_| {
                rejected("path", &path.to_string_lossy(), "unresolvable symbolic link")
            })?;
            if !resolved.starts_with(base) {
                warn!(path = ?path, resolved = ?resolved, "object path escapes storage base");
                return Err(rejected(
                    "path",
                    &path.to_string_lossy(),
                    "resolves outside the storage base",
                ));
            }
            return Ok(());
        }
        match probe.parent() {
            Some(parent) if parent.starts_with(base) => probe = parent,
            _ => {
                return Err(rejected(
                    "path",
                    &path.to_string_lossy(),
                    "storage base does not exist",
                ));
            }
        }
    }
}

fn rejected(what: &str, value: &str, reason: &str) -> Error {
    Error::invalid_input(format!("{what} '{}' rejected: {reason}", value.escape_debug()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn base() -> (tempfile::TempDir, PathBuf) {
        let dir = tempdir().unwrap();
        let base = dir.path().canonicalize().unwrap();
        (dir, base)
    }

    #[test]
    fn test_resolves_nested_keys() {
        let (_dir, base) = base();
        let path = resolve_object_path(&base, "bk", "k/file.bin").unwrap();
        assert_eq!(path, base.join("bk").join("k").join("file.bin"));

        let path = resolve_object_path(&base, "bk", ".multipart/u/00001").unwrap();
        assert_eq!(path, base.join("bk").join(".multipart").join("u").join("00001"));
    }

    #[test]
    fn test_rejects_traversal() {
        let (_dir, base) = base();
        for (bucket, key) in [
            ("..", "x"),
            ("bk", "../x"),
            ("bk", "a/../../x"),
            ("bk", "/etc/passwd"),
            ("a/b", "x"),
            ("bk", "x\0y"),
            ("b\0k", "x"),
            ("", "x"),
            ("bk", ""),
            ("bk", "dir/"),
            ("bk", "."),
            ("bk", "./a/b"),
            ("bk", "a/./b"),
            ("bk", "a//b"),
            ("bk", "a/b/."),
        ] {
            let err = resolve_object_path(&base, bucket, key).unwrap_err();
            assert!(
                matches!(err, Error::InvalidInput(_)),
                "expected InvalidInput for ({bucket:?}, {key:?}), got {err:?}"
            );
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_rejects_symlink_escape() {
        let (_dir, base) = base();
        let outside = tempdir().unwrap();

        std::fs::create_dir_all(base.join("bk")).unwrap();
        std::os::unix::fs::symlink(outside.path(), base.join("bk").join("link")).unwrap();

        let err = resolve_object_path(&base, "bk", "link/secret").unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));

        std::os::unix::fs::symlink(outside.path(), base.join("evil")).unwrap();
        let err = resolve_object_path(&base, "evil", "file").unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }
}
