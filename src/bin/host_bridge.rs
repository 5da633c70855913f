//! Headless worker binary for stdin/stdout JSON communication.
//!
//! Reads `HostEvent` lines (install, activate, fetch, message, notification
//! clicks, push, sync) from stdin and writes `HostOutput` lines to stdout.
//!
//! All tracing/diagnostic output goes to stderr so that stdout remains a
//! clean JSON protocol channel.

use std::sync::Arc;

use remedio::cache::{CacheBackend, DiskBackend, HttpNetwork, MemoryBackend};
use remedio::config::BackendKind;
use remedio::host::stdio::run_stdio_bridge;
use remedio::WorkerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise tracing to stderr only (stdout is reserved for the JSON
    // protocol).
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config_path = std::env::args_os()
        .nth(1)
        .map(std::path::PathBuf::from)
        .unwrap_or_else(WorkerConfig::default_config_path);
    let config = if config_path.exists() {
        WorkerConfig::from_file(&config_path)
            .map_err(|e| anyhow::anyhow!("failed to load {}: {e}", config_path.display()))?
    } else {
        tracing::info!(path = %config_path.display(), "no config file; using defaults");
        WorkerConfig::default()
    };

    let backend: Arc<dyn CacheBackend> = match config.cache.backend {
        BackendKind::Memory => Arc::new(MemoryBackend::new()),
        BackendKind::Disk => Arc::new(DiskBackend::new(&config.cache.disk_dir)?),
    };

    tracing::info!(version = %config.cache.version, "remedio-host starting");

    run_stdio_bridge(&config, Arc::new(HttpNetwork::new()), backend)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "remedio-host exited with error");
            anyhow::anyhow!("remedio-host failed: {e}")
        })?;

    tracing::info!("remedio-host shut down cleanly");
    Ok(())
}
