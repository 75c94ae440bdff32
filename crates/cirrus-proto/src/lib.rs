//! Cirrus Protocol - gRPC service definitions
//!
//! This crate contains the protobuf-generated code for the storage-node
//! RPC service.

/// Storage node service (Store/Retrieve/Delete/Assemble/Gossip/ClusterStatus)
pub mod storage {
    tonic::include_proto!("cirrus.storage");
}
