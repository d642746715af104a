//! Sinkhouse Worker Binary
//!
//! Runs one storage worker node: registers the local volumes, joins the
//! distribution group, rotates, uploads and imports the files of the sinks
//! it owns, and cleans up expired metadata.
//!
//! # Environment Variables
//!
//! - `SINKHOUSE_NODE_ID`: Unique node identifier (default: random)
//! - `SINKHOUSE_CONFIG`: Path of a JSON config file (optional)
//! - `SINKHOUSE_GROUP`: Distribution group (overrides the config file)
//! - `SINKHOUSE_VOLUMES`: Comma-separated volume directories
//! - `SINKHOUSE_LOG_FORMAT`: `text` or `json` (default: text)
//! - `RUST_LOG`: Log filter (default: info)
//!
//! # Example
//!
//! ```bash
//! export SINKHOUSE_NODE_ID=worker-001
//! export SINKHOUSE_VOLUMES=/data/vol-1,/data/vol-2
//! cargo run --bin sinkhouse-worker -- --check-interval-secs 5
//! ```
//!
//! The metadata store is in-process, so a single binary only coordinates
//! with itself.

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use serde::Deserialize;
use sinkhouse_agent::{
    DirectoryStagingConfig, StaticResourceConfig, StaticResourceProvider, WorkerBuilder,
    WorkerConfig,
};
use sinkhouse_core::VolumeId;
use sinkhouse_metadata::MemoryKvStore;
use sinkhouse_storage::VolumeInfo;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Parser)]
#[command(name = "sinkhouse-worker")]
#[command(about = "Sinkhouse storage worker node", long_about = None)]
struct Args {
    /// Node id, unique in the group
    #[arg(long, env = "SINKHOUSE_NODE_ID")]
    node_id: Option<String>,

    /// JSON config file
    #[arg(short, long, env = "SINKHOUSE_CONFIG")]
    config: Option<PathBuf>,

    /// Distribution group
    #[arg(long, env = "SINKHOUSE_GROUP")]
    group: Option<String>,

    /// Seconds between condition checks
    #[arg(long)]
    check_interval_secs: Option<u64>,

    /// Local volume directories
    #[arg(long = "volume", env = "SINKHOUSE_VOLUMES", value_delimiter = ',')]
    volumes: Vec<PathBuf>,

    #[arg(long, env = "SINKHOUSE_LOG_FORMAT", value_enum, default_value = "text")]
    log_format: LogFormat,
}

#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    #[serde(default)]
    worker: WorkerConfig,

    #[serde(default)]
    staging: StaticResourceConfig,

    /// Where uploaded slices and imported files are written
    #[serde(default)]
    directories: DirectoryStagingConfig,
}

fn init_logging(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn load_config(path: Option<&Path>) -> Result<FileConfig> {
    let Some(path) = path else {
        return Ok(FileConfig::default());
    };
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read config file {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("invalid config file {}", path.display()))
}

fn volume_info(node_id: &str, path: &Path) -> Result<VolumeInfo> {
    std::fs::create_dir_all(path)
        .with_context(|| format!("cannot create volume directory {}", path.display()))?;
    let label = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .context("volume path has no directory name")?;
    Ok(VolumeInfo {
        volume_id: VolumeId::new(format!("{node_id}-{label}"))?,
        node_id: node_id.to_string(),
        node_address: String::new(),
        volume_type: "default".to_string(),
        label,
        path: path.to_string_lossy().to_string(),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.log_format);
    sinkhouse_observability::init();

    let mut config = load_config(args.config.as_deref())?;
    if let Some(group) = args.group {
        config.worker.distribution.group = group;
    }
    if let Some(secs) = args.check_interval_secs {
        config.worker.checker.interval = Duration::from_secs(secs);
    }
    let node_id = args
        .node_id
        .unwrap_or_else(|| format!("worker-{}", uuid::Uuid::new_v4()));

    info!(
        node_id = %node_id,
        group = %config.worker.distribution.group,
        volumes = args.volumes.len(),
        "sinkhouse worker starting"
    );

    let mut builder = WorkerBuilder::new()
        .node_id(node_id.clone())
        .store(Arc::new(MemoryKvStore::new()))
        .resources(Arc::new(StaticResourceProvider::new(config.staging)))
        .staging(config.directories)
        .config(config.worker);
    for path in &args.volumes {
        builder = builder.volume(volume_info(&node_id, path)?);
    }
    let worker = builder.start().await.context("cannot start worker")?;

    let token = worker.shutdown_token();
    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("cannot listen for ctrl-c")?;
            info!("received ctrl-c");
        }
        _ = token.cancelled() => {}
    }
    worker.shutdown().await;
    Ok(())
}
