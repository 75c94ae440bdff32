//! Cirrus Client - storage-node RPC clients
//!
//! The coordinator and the gossip layer talk to storage nodes through the
//! [`StorageNode`] trait. [`NodeClient`] implements it over gRPC; tests
//! substitute in-memory fakes.

pub mod convert;
pub mod grpc;
pub mod node;
pub mod pool;

// Re-exports
pub use convert::{error_from_status, status_from_error};
pub use grpc::NodeClient;
pub use node::{MemberDigest, MemberInfo, ReplicaWrite, StorageNode, StoredObject};
pub use pool::{NodeHandle, NodePool};
