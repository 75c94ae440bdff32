//! Cirrus Cluster - replicated object storage
//!
//! This crate provides:
//! - The [`Coordinator`]: quorum writes, newest-wins reads with read-repair,
//!   best-effort deletes and multipart assembly across storage nodes
//! - Background membership sync that drops dead nodes from the ring
//! - The [`FileStore`] facade with local and distributed backends

pub mod coordinator;
pub mod membership;
pub mod store;

#[cfg(test)]
mod testing;

// Re-exports
pub use coordinator::Coordinator;
pub use store::{DistributedFileStore, FileStore, LocalFileStore, ObjectReader, build_file_store};
