//! Cirrus storage node daemon
//!
//! Serves the storage-node RPC and gossips membership with its peers.

use anyhow::{Context, Result};
use cirrus_client::NodePool;
use cirrus_common::{GossipConfig, NodeEndpoint, NodeId};
use cirrus_node::{GossipTask, Gossiper, Membership, NodeService};
use cirrus_proto::storage::storage_service_server::StorageServiceServer;
use clap::Parser;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tonic::transport::Server;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Increased message size limit for large objects (100 MB)
const MAX_MESSAGE_SIZE: usize = 100 * 1024 * 1024;

#[derive(Parser, Debug)]
#[command(name = "cirrus-node")]
#[command(about = "Cirrus storage node")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/cirrus/node.toml")]
    config: String,

    /// Node ID, unique within the cluster
    #[arg(long)]
    id: Option<String>,

    /// Listen address for gRPC
    #[arg(short, long)]
    listen: Option<String>,

    /// Advertise address (how peers and coordinators reach this node)
    /// If not set, derived from listen address
    #[arg(long)]
    advertise_addr: Option<String>,

    /// Directory holding object bodies
    #[arg(long, env = "STORAGE_BASE")]
    data_dir: Option<String>,

    /// Gossip peers as comma-separated id=address pairs
    #[arg(long, env = "STORAGE_NODES")]
    peers: Option<String>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Configuration file structure
#[derive(Debug, Deserialize, Default)]
struct Config {
    #[serde(default)]
    node: NodeConfig,
    #[serde(default)]
    gossip: GossipConfig,
    #[serde(default)]
    logging: LoggingConfig,
}

#[derive(Debug, Deserialize)]
struct NodeConfig {
    #[serde(default)]
    id: Option<String>,
    #[serde(default = "default_listen")]
    listen: String,
    #[serde(default)]
    advertise_addr: Option<String>,
    #[serde(default = "default_data_dir")]
    data_dir: String,
    #[serde(default)]
    peers: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: None,
            listen: default_listen(),
            advertise_addr: None,
            data_dir: default_data_dir(),
            peers: String::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct LoggingConfig {
    #[serde(default = "default_log_level")]
    level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:7000".to_string()
}

fn default_data_dir() -> String {
    "./node-data".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn load_config(path: &str) -> Result<Config> {
    if !Path::new(path).exists() {
        return Ok(Config::default());
    }
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
    toml::from_str(&raw).with_context(|| format!("parsing {path}"))
}

/// Address peers should dial, with scheme
fn advertise_addr(explicit: Option<String>, listen: &str) -> String {
    if let Some(addr) = explicit {
        cirrus_common::config::with_scheme(&addr)
    } else if let Some(port) = listen.strip_prefix("0.0.0.0:") {
        // Fallback: use localhost when listening on all interfaces
        format!("http://127.0.0.1:{port}")
    } else {
        format!("http://{listen}")
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args.config)?;

    // Merge CLI args with config file (CLI takes precedence)
    let listen = args.listen.unwrap_or(config.node.listen);
    let data_dir = args.data_dir.unwrap_or(config.node.data_dir);
    let peers = args.peers.unwrap_or(config.node.peers);
    let log_level = if args.log_level == "info" {
        config.logging.level
    } else {
        args.log_level
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let id = args
        .id
        .or(config.node.id)
        .context("node id is required (--id or [node].id)")?;
    let id = NodeId::new(id);
    let addr: SocketAddr = listen
        .parse()
        .with_context(|| format!("invalid listen address {listen}"))?;
    let advertise = advertise_addr(args.advertise_addr.or(config.node.advertise_addr), &listen);
    let peers = NodeEndpoint::parse_list(&peers)?;

    info!("Starting Cirrus storage node {}", id);
    info!("Config file: {}", args.config);
    info!("Data directory: {}", data_dir);
    info!("Advertising at: {}", advertise);

    let others: Vec<NodeEndpoint> = peers.into_iter().filter(|p| p.id != id).collect();
    if others.is_empty() {
        warn!("No peers configured; gossip stays idle until a peer contacts this node");
    }
    let pool = Arc::new(NodePool::from_endpoints(&others)?);
    let membership = Arc::new(Membership::new(id, advertise).with_peers(&others));
    let gossiper = Arc::new(Gossiper::new(membership, pool, config.gossip));

    let service = Arc::new(NodeService::open(&data_dir, gossiper.clone())?);
    let gossip_task = GossipTask::spawn(gossiper);

    let storage_service = StorageServiceServer::from_arc(service)
        .max_decoding_message_size(MAX_MESSAGE_SIZE)
        .max_encoding_message_size(MAX_MESSAGE_SIZE);

    info!("Starting gRPC server on {}", addr);
    Server::builder()
        .add_service(storage_service)
        .serve_with_shutdown(addr, async {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutting down...");
        })
        .await?;

    gossip_task.shutdown().await;
    info!("Storage node shut down gracefully");

    Ok(())
}
