//! R2 Image Cache Server
//!
//! Loads configuration, sets up logging and storage, and serves image
//! requests until the process is terminated.

use anyhow::Context;
use r2_image_cache::{
    DiskObjectStore, EdgeConfig, EdgeMetrics, EdgeServer, ImageHandler, MemoryKvStore,
    MemoryObjectStore, MetricsEndpoint, ObjectStore,
};
use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Main entry point
///
/// # Usage
/// ```bash
/// # Start with default config (r2_image_cache.yaml)
/// cargo run
///
/// # Start with custom config
/// cargo run -- /path/to/config.yaml
/// ```
#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();

    if let Err(e) = run().await {
        error!("Server terminated: {:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    info!("Starting R2 Image Cache");

    let config_path = env::args()
        .nth(1)
        .unwrap_or_else(|| "r2_image_cache.yaml".to_string());
    info!("Loading configuration from: {}", config_path);

    let config = EdgeConfig::from_file(&config_path)
        .with_context(|| format!("Failed to load configuration from {}", config_path))?;

    info!("Configuration loaded successfully");
    info!("  - Listen address: {}", config.listen_address);
    info!("  - Cache key prefix: {}", config.cache_key_prefix);
    info!("  - Cache TTL: {} seconds", config.default_cache_ttl);
    info!("  - Ingest on miss: {}", config.ingest_on_miss);
    info!("  - Rate limiting: {}", config.rate_limit.enabled);
    info!("  - Storage backend: {}", config.storage.backend);
    if config.cloudflare.api_token.is_empty() {
        warn!("No API token configured; original fetches and uploads will be rejected");
    }

    let object_store: Arc<dyn ObjectStore> = match config.storage.backend.as_str() {
        "disk" => {
            let path = config.storage.disk_path.clone().unwrap_or_default();
            info!("Using disk object store at {}", path);
            Arc::new(DiskObjectStore::new(&path).await?)
        }
        _ => {
            info!(
                "Using memory object store with a {} byte budget",
                config.storage.memory_max_bytes
            );
            Arc::new(MemoryObjectStore::with_capacity(
                config.storage.memory_max_bytes,
            ))
        }
    };

    let addr = config.listen_socket_addr()?;
    let metrics_config = config.metrics_endpoint.clone();
    let metrics = Arc::new(EdgeMetrics::new().context("Failed to create metrics")?);

    let handler = ImageHandler::new(
        Arc::new(config),
        object_store,
        Arc::new(MemoryKvStore::new()),
    )?
    .with_metrics(Arc::clone(&metrics));

    if let Some(metrics_config) = metrics_config.filter(|m| m.enabled) {
        let metrics_addr: SocketAddr = metrics_config.address.parse()?;
        let endpoint = MetricsEndpoint::new(Arc::clone(&metrics), metrics_addr);
        tokio::spawn(async move {
            if let Err(e) = endpoint.start().await {
                error!("Metrics endpoint failed: {}", e);
            }
        });
    }

    EdgeServer::new(Arc::new(handler), addr)
        .start()
        .await
        .with_context(|| format!("Failed to serve on {}", addr))
}
