//! R2 Image Cache
//!
//! An edge cache for image assets. Requests of the form
//! `/<path>.<ext>` or `/<path>-<w>x<h>.<ext>` are answered from an object
//! store when possible, and otherwise filled from the managed image service.
//!
//! # Overview
//!
//! Every GET request is validated, optionally rate limited, and looked up in
//! the cache under `{prefix}/{id}/{variant}`. On a miss the handler walks the
//! fallback tiers (pre-computed variant, then original). The first usable
//! response is cached and served with `x-r2-cache: MISS`. When no tier has the
//! image and ingestion is enabled, the asset is registered from the live origin
//! and the client is redirected to the public URL.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use r2_image_cache::{EdgeConfig, ImageHandler, MemoryKvStore, MemoryObjectStore};
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = EdgeConfig::from_file("r2_image_cache.yaml")?;
//! let handler = ImageHandler::new(
//!     Arc::new(config),
//!     Arc::new(MemoryObjectStore::new()),
//!     Arc::new(MemoryKvStore::new()),
//! )?;
//!
//! let response = handler
//!     .handle(&http::Method::GET, "/photos/cat-100x100.jpg", &http::HeaderMap::new())
//!     .await;
//! println!("status: {}", response.status());
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! - [`ImageHandler`]: the request state machine
//! - [`url_parser`]: path to [`ParsedImageRequest`]
//! - [`RateLimiter`]: fixed-window counter in a [`KvStore`]
//! - [`CacheStrategy`]: reads and writes [`CachedImage`]s in an [`ObjectStore`]
//! - [`FallbackTier`]: sources consulted on a miss
//! - [`ImageServiceClient`]: variant delivery, original download and upload
//! - [`EdgeMetrics`] / [`MetricsEndpoint`]: Prometheus metrics
//! - [`EdgeServer`]: HTTP/1 accept loop
//!
//! # Configuration
//!
//! ```yaml
//! listen_address: "0.0.0.0:8080"
//! cache_key_prefix: "images"
//! ingest_on_miss: true
//! live_source_url: "https://www.example.com"
//! live_public_domain: "https://images.example.com"
//! rate_limit:
//!   enabled: true
//!   window_ms: 60000
//!   max_requests_per_window: 1000
//! cloudflare:
//!   account_id: "..."
//!   account_hash: "..."
//!   api_token: "..."
//! storage:
//!   backend: "disk"
//!   disk_path: "/var/cache/r2-image-cache"
//! ```

pub mod cache_strategy;
pub mod config;
pub mod error;
pub mod fallback;
pub mod handler;
pub mod image_service;
pub mod metrics;
pub mod metrics_endpoint;
pub mod models;
pub mod rate_limiter;
pub mod server;
pub mod store;
pub mod url_parser;

// Re-export commonly used types
pub use cache_strategy::{cache_key, CacheStrategy, DEFAULT_CACHE_TTL};
pub use config::{
    CloudflareConfig, EdgeConfig, MetricsEndpointConfig, RateLimitConfig, StorageConfig,
};
pub use error::{EdgeError, Result};
pub use fallback::{FallbackTier, OriginalTier, TierOutcome, VariantTier};
pub use handler::{EdgeResponse, ImageHandler, Resolution};
pub use image_service::ImageServiceClient;
pub use metrics::EdgeMetrics;
pub use metrics_endpoint::MetricsEndpoint;
pub use models::{CachedImage, HttpMetadata, ParsedImageRequest, UpstreamResponse};
pub use rate_limiter::RateLimiter;
pub use server::EdgeServer;
pub use store::{DiskObjectStore, KvStore, MemoryKvStore, MemoryObjectStore, ObjectStore};
pub use url_parser::parse_image_path;
