//! Cirrus storage node
//!
//! The daemon serves the storage-node RPC over a local blob store and runs
//! the gossip failure detector that backs `ClusterStatus`.

pub mod gossip;
pub mod membership;
pub mod service;

pub use gossip::{GossipTask, Gossiper};
pub use membership::{LearnedPeer, Membership};
pub use service::NodeService;
