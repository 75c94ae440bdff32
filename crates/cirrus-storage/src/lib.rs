//! Cirrus Storage - Local blob store
//!
//! This crate is the only part of Cirrus that touches the filesystem:
//! - Safe resolution of `(bucket, key)` to `<base>/<bucket>/<key>`
//! - Streaming writes with atomic replacement
//! - Assembly of multipart parts into a final object
//! - A persistent per-object version index used by storage nodes

pub mod blob;
pub mod index;
pub mod path;

// Re-exports
pub use blob::BlobStore;
pub use index::{IndexError, ObjectVersion, VersionIndex};
pub use path::resolve_object_path;
