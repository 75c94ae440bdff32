//! Cirrus Common - Shared types and utilities
//!
//! This crate provides the error taxonomy, identifiers, configuration and
//! small helpers shared by every crate on the object-storage data path.

pub mod config;
pub mod error;
pub mod multipart;
pub mod types;

pub use config::{CoordinatorConfig, GossipConfig, NodeEndpoint, StorageConfig, StorageMode};
pub use error::{Error, Result};
pub use multipart::PartKey;
pub use types::*;
