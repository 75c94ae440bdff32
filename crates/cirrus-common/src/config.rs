//! Configuration types for Cirrus
//!
//! Storage settings are read from the `STORAGE_*` environment variables;
//! coordinator and gossip tunables carry defaults and can be overridden from
//! a config file.

use crate::error::{Error, Result};
use crate::types::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

pub const ENV_BASE: &str = "STORAGE_BASE";
pub const ENV_REPLICA_COUNT: &str = "STORAGE_REPLICA_COUNT";
pub const ENV_VIRTUAL_NODES: &str = "STORAGE_VIRTUAL_NODES";
pub const ENV_SECRET: &str = "STORAGE_SECRET";
pub const ENV_NODES: &str = "STORAGE_NODES";
pub const ENV_MODE: &str = "STORAGE_MODE";

pub const DEFAULT_REPLICA_COUNT: usize = 3;
pub const DEFAULT_VIRTUAL_NODES: usize = 100;

/// Which `FileStore` backend serves requests
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageMode {
    /// Single-node deployment backed by the local blob store
    Local,
    /// Replicated deployment backed by the coordinator
    Distributed,
}

/// A statically configured storage node (`id=address`)
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeEndpoint {
    pub id: NodeId,
    pub address: String,
}

impl NodeEndpoint {
    /// Parse a comma-separated `id=address` list.
    ///
    /// Empty entries are skipped, addresses without a scheme get `http://`,
    /// and duplicate IDs are rejected.
    pub fn parse_list(raw: &str) -> Result<Vec<Self>> {
        let mut seen = HashSet::new();
        let mut nodes = Vec::new();

        for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (id, address) = entry.split_once('=').ok_or_else(|| {
                Error::invalid_input(format!("node entry '{entry}' is not of the form id=address"))
            })?;
            let (id, address) = (id.trim(), address.trim());
            if id.is_empty() || address.is_empty() {
                return Err(Error::invalid_input(format!(
                    "node entry '{entry}' has an empty id or address"
                )));
            }
            if !seen.insert(id.to_string()) {
                return Err(Error::invalid_input(format!("duplicate node id '{id}'")));
            }
            nodes.push(Self {
                id: NodeId::from(id),
                address: with_scheme(address),
            });
        }

        Ok(nodes)
    }
}

/// Prefix `http://` when the address carries no scheme
#[must_use]
pub fn with_scheme(address: &str) -> String {
    if address.starts_with("http://") || address.starts_with("https://") {
        address.to_string()
    } else {
        format!("http://{address}")
    }
}

/// Storage configuration shared by the node daemon and `FileStore` consumers
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root directory of the local blob store
    pub base: PathBuf,
    /// Number of replicas per object (N)
    pub replica_count: usize,
    /// Ring slots per physical node
    pub virtual_nodes: usize,
    /// HMAC key for presigned URLs
    pub secret: Option<String>,
    /// Static node list used to populate the ring and client map
    pub nodes: Vec<NodeEndpoint>,
    /// Explicit backend choice; derived from `nodes` when unset
    pub mode: Option<StorageMode>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base: PathBuf::from("./storage"),
            replica_count: DEFAULT_REPLICA_COUNT,
            virtual_nodes: DEFAULT_VIRTUAL_NODES,
            secret: None,
            nodes: Vec::new(),
            mode: None,
        }
    }
}

impl StorageConfig {
    /// Load settings from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load settings through an arbitrary variable lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(base) = lookup(ENV_BASE).filter(|v| !v.trim().is_empty()) {
            config.base = PathBuf::from(base.trim());
        }
        if let Some(raw) = lookup(ENV_REPLICA_COUNT) {
            config.replica_count = parse_positive(ENV_REPLICA_COUNT, &raw)?;
        }
        if let Some(raw) = lookup(ENV_VIRTUAL_NODES) {
            config.virtual_nodes = parse_positive(ENV_VIRTUAL_NODES, &raw)?;
        }
        config.secret = lookup(ENV_SECRET).filter(|s| !s.is_empty());
        if let Some(raw) = lookup(ENV_NODES) {
            config.nodes = NodeEndpoint::parse_list(&raw)?;
        }
        if let Some(raw) = lookup(ENV_MODE).filter(|v| !v.trim().is_empty()) {
            config.mode = Some(match raw.trim().to_ascii_lowercase().as_str() {
                "local" => StorageMode::Local,
                "distributed" => StorageMode::Distributed,
                other => {
                    return Err(Error::invalid_input(format!(
                        "{ENV_MODE} must be 'local' or 'distributed', got '{other}'"
                    )));
                }
            });
        }

        Ok(config)
    }

    /// Backend to use: explicit mode, else distributed iff nodes are configured
    #[must_use]
    pub fn effective_mode(&self) -> StorageMode {
        self.mode.unwrap_or(if self.nodes.is_empty() {
            StorageMode::Local
        } else {
            StorageMode::Distributed
        })
    }

    /// Derive coordinator settings from the storage settings
    #[must_use]
    pub fn coordinator(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            replica_count: self.replica_count,
            virtual_nodes: self.virtual_nodes,
            ..CoordinatorConfig::default()
        }
    }
}

fn parse_positive(name: &str, raw: &str) -> Result<usize> {
    match raw.trim().parse::<usize>() {
        Ok(0) | Err(_) => Err(Error::invalid_input(format!(
            "{name} must be a positive integer, got '{raw}'"
        ))),
        Ok(v) => Ok(v),
    }
}

/// Coordinator tunables
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Number of replicas per object (N)
    pub replica_count: usize,
    /// Ring slots per physical node
    pub virtual_nodes: usize,
    /// Deadline applied to every replica RPC (milliseconds)
    pub request_timeout_ms: u64,
    /// Membership sync period (milliseconds)
    pub sync_interval_ms: u64,
    /// Deadline for a single `ClusterStatus` probe (milliseconds)
    pub probe_timeout_ms: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            replica_count: DEFAULT_REPLICA_COUNT,
            virtual_nodes: DEFAULT_VIRTUAL_NODES,
            request_timeout_ms: 10_000,
            sync_interval_ms: 5_000,
            probe_timeout_ms: 2_000,
        }
    }
}

impl CoordinatorConfig {
    /// Write quorum W = floor(N/2) + 1
    #[must_use]
    pub const fn write_quorum(&self) -> usize {
        self.replica_count / 2 + 1
    }

    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    #[must_use]
    pub const fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }

    #[must_use]
    pub const fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

/// Gossip and failure-detection tunables for storage nodes
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct GossipConfig {
    /// Period between gossip rounds (milliseconds)
    pub interval_ms: u64,
    /// Deadline for a single gossip probe (milliseconds)
    pub probe_timeout_ms: u64,
    /// Time a member may stay suspect before being declared dead (milliseconds)
    pub dead_timeout_ms: u64,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1_000,
            probe_timeout_ms: 2_000,
            dead_timeout_ms: 10_000,
        }
    }
}

impl GossipConfig {
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    #[must_use]
    pub const fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    #[must_use]
    pub const fn dead_timeout(&self) -> Duration {
        Duration::from_millis(self.dead_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name: &str| map.get(name).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = StorageConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.replica_count, 3);
        assert_eq!(config.virtual_nodes, 100);
        assert!(config.secret.is_none());
        assert_eq!(config.effective_mode(), StorageMode::Local);
    }

    #[test]
    fn test_env_overrides() {
        let config = StorageConfig::from_lookup(lookup(&[
            (ENV_BASE, "/data/blobs"),
            (ENV_REPLICA_COUNT, "5"),
            (ENV_VIRTUAL_NODES, "256"),
            (ENV_SECRET, "s3cr3t"),
            (ENV_NODES, "a=10.0.0.1:7000, b=http://10.0.0.2:7000,,"),
        ]))
        .unwrap();

        assert_eq!(config.base, PathBuf::from("/data/blobs"));
        assert_eq!(config.replica_count, 5);
        assert_eq!(config.virtual_nodes, 256);
        assert_eq!(config.secret.as_deref(), Some("s3cr3t"));
        assert_eq!(config.nodes.len(), 2);
        assert_eq!(config.nodes[0].address, "http://10.0.0.1:7000");
        assert_eq!(config.nodes[1].id, NodeId::from("b"));
        assert_eq!(config.effective_mode(), StorageMode::Distributed);
        assert_eq!(config.coordinator().write_quorum(), 3);
    }

    #[test]
    fn test_bad_values_rejected() {
        assert!(StorageConfig::from_lookup(lookup(&[(ENV_REPLICA_COUNT, "0")])).is_err());
        assert!(StorageConfig::from_lookup(lookup(&[(ENV_VIRTUAL_NODES, "many")])).is_err());
        assert!(StorageConfig::from_lookup(lookup(&[(ENV_NODES, "a=x,a=y")])).is_err());
        assert!(StorageConfig::from_lookup(lookup(&[(ENV_NODES, "justahost")])).is_err());
        assert!(StorageConfig::from_lookup(lookup(&[(ENV_MODE, "hybrid")])).is_err());
    }

    #[test]
    fn test_write_quorum() {
        let mut config = CoordinatorConfig::default();
        assert_eq!(config.write_quorum(), 2);
        config.replica_count = 1;
        assert_eq!(config.write_quorum(), 1);
        config.replica_count = 4;
        assert_eq!(config.write_quorum(), 3);
    }
}
