use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use tracing::info;
use tracing_subscriber::EnvFilter;

use peersync_engine::{BackendConfig, SyncConfig, SyncService, SyncStrategy};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Backend {
    Local,
    Cloud,
}

/// Run one leader-elected sync cycle against a shared snapshot and report
/// the engine status afterwards.
#[derive(Parser, Debug)]
#[command(name = "peersync", about = "Leader-elected SQLite cache synchronizer")]
struct Args {
    /// Coordination backend to use
    #[arg(long, value_enum, default_value = "local")]
    backend: Backend,

    /// Path of the local cache database
    #[arg(long, env = "PEERSYNC_DB")]
    db: PathBuf,

    /// Shared directory for the local backend
    #[arg(long, env = "PEERSYNC_SHARED_DIR")]
    shared_dir: Option<PathBuf>,

    /// Bucket for the cloud backend
    #[arg(long, env = "PEERSYNC_BUCKET")]
    bucket: Option<String>,

    /// Key prefix within the bucket
    #[arg(long, env = "PEERSYNC_PREFIX", default_value = "")]
    prefix: String,

    /// Custom S3 endpoint (R2, minio)
    #[arg(long, env = "PEERSYNC_ENDPOINT")]
    endpoint: Option<String>,

    /// Bucket region
    #[arg(long, env = "PEERSYNC_REGION")]
    region: Option<String>,

    /// Skip coordination entirely and leave the cache untouched
    #[arg(long)]
    local_only: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let backend = match args.backend {
        Backend::Local => BackendConfig::LocalFile {
            shared_dir: args
                .shared_dir
                .ok_or_else(|| anyhow::anyhow!("--shared-dir is required for the local backend"))?,
        },
        Backend::Cloud => BackendConfig::CloudObject {
            bucket: args
                .bucket
                .ok_or_else(|| anyhow::anyhow!("--bucket is required for the cloud backend"))?,
            prefix: args.prefix,
            endpoint: args.endpoint,
            region: args.region,
        },
    };
    let strategy = if args.local_only {
        SyncStrategy::LocalOnly
    } else {
        SyncStrategy::LeaderElection
    };

    let config = SyncConfig::new(strategy, backend, &args.db);
    info!("Starting peersync");
    info!("  Local cache: {}", args.db.display());

    let service = SyncService::from_config(config).await?;
    let outcome = service.trigger_manual_sync().await?;
    info!("Sync outcome: {:?}", outcome);

    let status = service.status().await;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}
