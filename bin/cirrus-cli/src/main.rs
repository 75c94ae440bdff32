//! Cirrus CLI - operator command line
//!
//! Object commands go through the `FileStore` selected by the `STORAGE_*`
//! environment, so the same invocation works against a local directory or a
//! replicated cluster.

use anyhow::{Context, Result, bail};
use chrono::Utc;
use cirrus_auth::{PresignedUrl, Presigner};
use cirrus_client::{NodeClient, StorageNode};
use cirrus_cluster::build_file_store;
use cirrus_common::{NodeId, PartKey, StorageConfig, multipart::ordered_part_keys};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "cirrus-cli")]
#[command(about = "Cirrus operator CLI")]
#[command(version)]
struct Args {
    /// Log level
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Upload an object
    Put {
        bucket: String,
        key: String,
        /// Source file; stdin when omitted
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
    /// Download an object
    Get {
        bucket: String,
        key: String,
        /// Destination file; stdout when omitted
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Delete an object
    Rm { bucket: String, key: String },
    /// Concatenate parts into one object and remove the parts
    Assemble {
        bucket: String,
        target: String,
        /// Multipart upload ID; parts are then given as part numbers
        #[arg(long)]
        upload_id: Option<String>,
        /// Part keys (or part numbers with --upload-id), in order
        #[arg(required = true)]
        parts: Vec<String>,
    },
    /// Show the membership view of the configured nodes
    Status {
        /// Only ask this node
        #[arg(long)]
        node: Option<String>,
    },
    /// Create a presigned URL
    Presign {
        bucket: String,
        key: String,
        /// HTTP method the URL grants
        #[arg(short, long, default_value = "GET")]
        method: String,
        /// Validity in seconds
        #[arg(short, long, default_value_t = 3600)]
        expires_in: i64,
        /// Base URL of the serving endpoint
        #[arg(long, default_value = "http://localhost:8080")]
        base_url: String,
    },
    /// Check a presigned URL
    Verify { url: String },
}

/// Resolve the part list into object keys
fn part_keys(upload_id: Option<&str>, parts: &[String]) -> Result<Vec<String>> {
    let Some(upload_id) = upload_id else {
        return Ok(parts.to_vec());
    };
    let parts = parts
        .iter()
        .map(|n| {
            let number: u32 = n
                .parse()
                .with_context(|| format!("invalid part number '{n}'"))?;
            Ok(PartKey::from_parts(upload_id, number)?)
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(ordered_part_keys(parts)?)
}

async fn cluster_status(config: &StorageConfig, only: Option<&str>) -> Result<()> {
    let nodes: Vec<_> = config
        .nodes
        .iter()
        .filter(|n| only.is_none_or(|id| n.id.as_str() == id))
        .collect();
    if nodes.is_empty() {
        bail!("no matching storage nodes configured (set STORAGE_NODES)");
    }

    for endpoint in nodes {
        println!("Node {} ({})", endpoint.id, endpoint.address);
        let client = match NodeClient::connect(endpoint.id.clone(), &endpoint.address).await {
            Ok(client) => client,
            Err(e) => {
                println!("  unreachable: {e}");
                continue;
            }
        };
        match client.cluster_status().await {
            Ok(members) => {
                let mut members: Vec<(NodeId, _)> = members.into_iter().collect();
                members.sort_by(|a, b| a.0.cmp(&b.0));
                println!("  {:<16} {:<8} {:<28} LAST HEARTBEAT (ms)", "MEMBER", "STATUS", "ADDRESS");
                for (id, info) in members {
                    println!(
                        "  {:<16} {:<8} {:<28} {}",
                        id.as_str(),
                        info.status.as_str(),
                        info.address,
                        info.last_heartbeat
                    );
                }
            }
            Err(e) => println!("  status failed: {e}"),
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = StorageConfig::from_env()?;

    match args.command {
        Commands::Put { bucket, key, file } => {
            let store = build_file_store(&config)?;
            let size = match file {
                Some(path) => {
                    let mut src = tokio::fs::File::open(&path)
                        .await
                        .with_context(|| format!("opening {}", path.display()))?;
                    store.write(&bucket, &key, &mut src).await?
                }
                None => store.write(&bucket, &key, &mut tokio::io::stdin()).await?,
            };
            eprintln!("stored {bucket}/{key} ({size} bytes)");
        }
        Commands::Get { bucket, key, output } => {
            let store = build_file_store(&config)?;
            let mut reader = store.read(&bucket, &key).await?;
            match output {
                Some(path) => {
                    let mut dst = tokio::fs::File::create(&path)
                        .await
                        .with_context(|| format!("creating {}", path.display()))?;
                    tokio::io::copy(&mut reader, &mut dst).await?;
                    dst.flush().await?;
                }
                None => {
                    let mut stdout = tokio::io::stdout();
                    tokio::io::copy(&mut reader, &mut stdout).await?;
                    stdout.flush().await?;
                }
            }
        }
        Commands::Rm { bucket, key } => {
            build_file_store(&config)?.delete(&bucket, &key).await?;
            eprintln!("deleted {bucket}/{key}");
        }
        Commands::Assemble {
            bucket,
            target,
            upload_id,
            parts,
        } => {
            let keys = part_keys(upload_id.as_deref(), &parts)?;
            let size = build_file_store(&config)?
                .assemble(&bucket, &target, &keys)
                .await?;
            eprintln!("assembled {bucket}/{target} from {} parts ({size} bytes)", keys.len());
        }
        Commands::Status { node } => cluster_status(&config, node.as_deref()).await?,
        Commands::Presign {
            bucket,
            key,
            method,
            expires_in,
            base_url,
        } => {
            if expires_in <= 0 {
                bail!("--expires-in must be positive");
            }
            let presigner = Presigner::from_secret(config.secret.clone());
            let expires_at = Utc::now().timestamp() + expires_in;
            let url = presigner.sign(&base_url, &method.to_uppercase(), &bucket, &key, expires_at)?;
            println!("{url}");
        }
        Commands::Verify { url } => {
            let parsed = PresignedUrl::parse(&url)?;
            Presigner::from_secret(config.secret.clone()).verify_url(&parsed)?;
            let (bucket, key) = parsed.object()?;
            println!("valid {} {bucket}/{key} until {}", parsed.method, parsed.expires);
        }
    }

    Ok(())
}
