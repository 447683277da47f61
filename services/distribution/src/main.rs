//! Registry server binary.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use clap::Parser;
use distribution::metadata::MemoryMetadata;
use distribution::{Registry, RegistryBuilder, RegistryConfig};
use eyre::{Context, Result};
use serde::Deserialize;
use storage::StorageConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Private container registry speaking the OCI distribution API
#[derive(Parser, Debug)]
#[command(name = "distribution-server")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, env = "DISTRIBUTION_CONFIG")]
    config: Option<Utf8PathBuf>,

    /// Address to listen on, overriding the configuration file
    #[arg(short, long)]
    listen: Option<SocketAddr>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct ServerConfig {
    #[serde(default = "default_listen")]
    listen: SocketAddr,
    #[serde(default = "default_storage")]
    storage: StorageConfig,
    #[serde(default)]
    registry: RegistryConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            storage: default_storage(),
            registry: RegistryConfig::default(),
        }
    }
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 5000))
}

fn default_storage() -> StorageConfig {
    StorageConfig::Memory {
        bucket: RegistryConfig::default().bucket,
    }
}

async fn load_config(path: Option<&Utf8PathBuf>) -> Result<ServerConfig> {
    let Some(path) = path else {
        tracing::info!("No configuration file given, using in-memory defaults");
        return Ok(ServerConfig::default());
    };

    tracing::info!(config_path = %path, "Loading configuration from file");
    let text = tokio::fs::read_to_string(path)
        .await
        .wrap_err_with(|| format!("reading {path}"))?;
    toml_edit::de::from_str(&text).wrap_err_with(|| format!("parsing {path}"))
}

/// Persists the in-memory metadata to the configured snapshot object.
#[derive(Debug, Clone)]
struct Snapshots {
    metadata: Arc<MemoryMetadata>,
    path: Utf8PathBuf,
}

impl Snapshots {
    async fn save(&self, registry: &Registry) {
        match self.metadata.save_snapshot(registry.bucket(), &self.path).await {
            Ok(()) => tracing::debug!(path = %self.path, "Saved metadata snapshot"),
            Err(error) => tracing::error!(%error, path = %self.path, "Saving metadata snapshot failed"),
        }
    }
}

fn every(seconds: u64) -> tokio::time::Interval {
    let mut interval = tokio::time::interval(Duration::from_secs(seconds.max(1)));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    interval
}

/// Run a collection pass every `gc_interval` seconds, saving a snapshot after each one.
async fn run_gc(registry: Registry, snapshots: Option<Snapshots>) {
    let mut interval = every(registry.config().gc_interval);
    interval.tick().await;

    loop {
        interval.tick().await;
        match registry.gc().collect_garbage(false).await {
            Ok(report) => tracing::info!(
                blobs = report.blob_count(),
                uploads = report.upload_count(),
                untracked = report.untracked.len(),
                bytes = report.reclaimable_bytes(),
                "Periodic garbage collection finished"
            ),
            Err(error) => tracing::error!(%error, "Periodic garbage collection failed"),
        }
        if let Some(snapshots) = &snapshots {
            snapshots.save(&registry).await;
        }
    }
}

/// Save a snapshot every `snapshot_interval` seconds.
async fn run_snapshots(registry: Registry, snapshots: Snapshots) {
    let mut interval = every(registry.config().snapshot_interval);
    interval.tick().await;

    loop {
        interval.tick().await;
        snapshots.save(&registry).await;
    }
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!(%error, "Failed to listen for shutdown signal");
        return;
    }
    tracing::info!("Shutting down");
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,distribution=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("distribution-server v{}", env!("CARGO_PKG_VERSION"));

    let mut config = load_config(args.config.as_ref()).await?;
    if let Some(listen) = args.listen {
        config.listen = listen;
    }

    let storage = config
        .storage
        .build()
        .await
        .wrap_err("failed to initialize storage")?;

    let metadata = Arc::new(MemoryMetadata::new());
    let snapshots = config.registry.snapshot_path.clone().map(|path| Snapshots {
        metadata: metadata.clone(),
        path,
    });
    let registry = RegistryBuilder::new(storage)
        .config(config.registry)
        .metadata(metadata.clone())
        .build();

    if let Some(snapshots) = &snapshots {
        if metadata.load_snapshot(registry.bucket(), &snapshots.path).await? {
            tracing::info!(path = %snapshots.path, "Restored metadata snapshot");
        }
    }

    let mut tasks = Vec::new();
    if registry.config().gc_enabled {
        tasks.push(tokio::spawn(run_gc(registry.clone(), snapshots.clone())));
    }
    if let Some(snapshots) = &snapshots {
        tasks.push(tokio::spawn(run_snapshots(registry.clone(), snapshots.clone())));
    }

    let listener = tokio::net::TcpListener::bind(config.listen)
        .await
        .wrap_err_with(|| format!("binding {}", config.listen))?;
    tracing::info!(listen = %config.listen, "Serving registry");

    axum::serve(listener, registry.router())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .wrap_err("server error")?;

    for task in tasks {
        task.abort();
    }

    if let Some(snapshots) = &snapshots {
        metadata.save_snapshot(registry.bucket(), &snapshots.path).await?;
        tracing::info!(path = %snapshots.path, "Saved metadata snapshot");
    }

    Ok(())
}
