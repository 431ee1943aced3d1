//! Configuration management for the image edge cache

use crate::cache_strategy::DEFAULT_CACHE_TTL;
use crate::error::{EdgeError, Result};
use crate::store::DEFAULT_MEMORY_BUDGET;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Upper bound for `default_cache_ttl`: ten years
pub const MAX_CACHE_TTL_SECS: u64 = 10 * 365 * 24 * 60 * 60;

/// Upper bound for `rate_limit.window_ms`: one day
pub const MAX_WINDOW_MS: u64 = 24 * 60 * 60 * 1000;

/// Top-level configuration for the edge handler
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeConfig {
    /// Address the image server listens on (default: "0.0.0.0:8080")
    #[serde(default = "default_listen_address")]
    pub listen_address: String,

    /// Deployment-scoped namespace prepended to every cache and rate-limit key
    #[serde(default = "default_cache_key_prefix")]
    pub cache_key_prefix: String,

    /// Cache TTL in seconds (default: 31536000 = 1 year)
    #[serde(default = "default_cache_ttl")]
    pub default_cache_ttl: u64,

    /// Register unknown assets with the image service and redirect (default: true)
    #[serde(default = "default_true")]
    pub ingest_on_miss: bool,

    /// Base URL of the live origin used as the ingestion source
    #[serde(default)]
    pub live_source_url: String,

    /// Public domain clients are redirected to after ingestion
    #[serde(default)]
    pub live_public_domain: String,

    /// Image extensions accepted by the handler
    #[serde(default = "default_allowed_extensions")]
    pub allowed_extensions: Vec<String>,

    /// Timeout for every outbound call, in seconds (default: 30)
    #[serde(default = "default_upstream_timeout")]
    pub upstream_timeout_secs: u64,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    #[serde(default)]
    pub cloudflare: CloudflareConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    /// Metrics endpoint configuration (optional)
    #[serde(default)]
    pub metrics_endpoint: Option<MetricsEndpointConfig>,
}

/// Sliding-window (reset-on-expiry) rate limiting
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RateLimitConfig {
    /// Whether rate limiting is enabled (default: false)
    #[serde(default)]
    pub enabled: bool,

    /// Window length in milliseconds (default: 60000 = 1 minute)
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,

    /// Requests allowed per client within one window (default: 1000)
    #[serde(default = "default_max_requests")]
    pub max_requests_per_window: u64,

    /// Header carrying the client address (default: "cf-connecting-ip")
    #[serde(default = "default_client_ip_header")]
    pub client_ip_header: String,
}

/// Managed image service endpoints and credentials
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CloudflareConfig {
    #[serde(default = "default_api_base")]
    pub api_base: String,

    #[serde(default = "default_image_delivery_url")]
    pub image_delivery_url: String,

    #[serde(default)]
    pub account_id: String,

    #[serde(default)]
    pub account_hash: String,

    #[serde(default)]
    pub api_token: String,
}

/// Object store backend selection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorageConfig {
    /// Backend type (default: "memory")
    /// Options: "memory" or "disk"
    #[serde(default = "default_storage_backend")]
    pub backend: String,

    /// Directory used by the disk backend
    #[serde(default)]
    pub disk_path: Option<String>,

    /// Byte budget of the memory backend (default: 256 MiB)
    #[serde(default = "default_memory_max_bytes")]
    pub memory_max_bytes: usize,
}

/// Configuration for the metrics HTTP endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricsEndpointConfig {
    /// Whether to enable the metrics endpoint (default: false)
    #[serde(default)]
    pub enabled: bool,

    /// Address to bind the metrics endpoint to (default: "127.0.0.1:9090")
    #[serde(default = "default_metrics_address")]
    pub address: String,
}

// Default value functions for serde
fn default_listen_address() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_cache_key_prefix() -> String {
    "images".to_string()
}

fn default_cache_ttl() -> u64 {
    DEFAULT_CACHE_TTL.as_secs()
}

fn default_true() -> bool {
    true
}

fn default_allowed_extensions() -> Vec<String> {
    ["jpg", "jpeg", "png", "gif", "webp", "avif", "svg"]
        .iter()
        .map(|ext| ext.to_string())
        .collect()
}

fn default_upstream_timeout() -> u64 {
    30
}

fn default_window_ms() -> u64 {
    60 * 1000
}

fn default_max_requests() -> u64 {
    1000
}

fn default_client_ip_header() -> String {
    "cf-connecting-ip".to_string()
}

fn default_api_base() -> String {
    "https://api.cloudflare.com/client/v4".to_string()
}

fn default_image_delivery_url() -> String {
    "https://imagedelivery.net".to_string()
}

fn default_storage_backend() -> String {
    "memory".to_string()
}

fn default_memory_max_bytes() -> usize {
    DEFAULT_MEMORY_BUDGET
}

fn default_metrics_address() -> String {
    "127.0.0.1:9090".to_string()
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            window_ms: default_window_ms(),
            max_requests_per_window: default_max_requests(),
            client_ip_header: default_client_ip_header(),
        }
    }
}

impl RateLimitConfig {
    /// Window length as a Duration
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

impl Default for CloudflareConfig {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            image_delivery_url: default_image_delivery_url(),
            account_id: String::new(),
            account_hash: String::new(),
            api_token: String::new(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_storage_backend(),
            disk_path: None,
            memory_max_bytes: default_memory_max_bytes(),
        }
    }
}

impl Default for MetricsEndpointConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: default_metrics_address(),
        }
    }
}

impl Default for EdgeConfig {
    fn default() -> Self {
        EdgeConfig {
            listen_address: default_listen_address(),
            cache_key_prefix: default_cache_key_prefix(),
            default_cache_ttl: default_cache_ttl(),
            ingest_on_miss: default_true(),
            live_source_url: String::new(),
            live_public_domain: String::new(),
            allowed_extensions: default_allowed_extensions(),
            upstream_timeout_secs: default_upstream_timeout(),
            rate_limit: RateLimitConfig::default(),
            cloudflare: CloudflareConfig::default(),
            storage: StorageConfig::default(),
            metrics_endpoint: None,
        }
    }
}

impl EdgeConfig {
    /// Load configuration from a YAML file
    ///
    /// Environment overrides are applied after parsing and before validation.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .map_err(|e| EdgeError::Config(format!("Failed to read config file: {}", e)))?;

        let mut config = Self::from_yaml(&content)?;
        config.apply_env_overrides(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML string without validating it
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content)
            .map_err(|e| EdgeError::Config(format!("Failed to parse config file: {}", e)))
    }

    /// Override deployment identifiers and secrets from the environment
    ///
    /// `lookup` is `std::env::var` in production; tests pass a closure.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let set = |name: &str, field: &mut String| {
            if let Some(value) = lookup(name) {
                debug!("Config override from environment: {}", name);
                *field = value;
            }
        };
        set("API_TOKEN", &mut self.cloudflare.api_token);
        set("ACCOUNT_ID", &mut self.cloudflare.account_id);
        set("ACCOUNT_HASH", &mut self.cloudflare.account_hash);
        set("LIVE_SOURCE_URL", &mut self.live_source_url);
        set("LIVE_PUBLIC_DOMAIN", &mut self.live_public_domain);
        set("CACHE_KEY_PREFIX", &mut self.cache_key_prefix);

        if let Some(value) = lookup("RATELIMIT_ENABLED") {
            self.rate_limit.enabled = parse_flag(&value);
        }
        if let Some(value) = lookup("UPLOAD_FROM_SOURCE") {
            self.ingest_on_miss = parse_flag(&value);
        }
    }

    /// Validate the configuration
    ///
    /// # Validation Rules
    /// - cache_key_prefix must not be empty
    /// - default_cache_ttl must be > 0 and at most ten years
    /// - upstream_timeout_secs must be > 0
    /// - window_ms (at most one day) and max_requests_per_window must be > 0
    ///   when rate limiting is enabled
    /// - live_source_url and live_public_domain must be set when ingest_on_miss is enabled
    /// - allowed_extensions must not be empty
    /// - storage backend must be "memory" or "disk" (the latter with a disk_path)
    /// - listen and metrics addresses must parse as socket addresses
    pub fn validate(&self) -> Result<()> {
        if self.cache_key_prefix.is_empty() {
            return Err(EdgeError::Config(
                "cache_key_prefix must not be empty".to_string(),
            ));
        }

        if self.default_cache_ttl == 0 {
            return Err(EdgeError::Config(
                "default_cache_ttl must be greater than 0".to_string(),
            ));
        }

        if self.default_cache_ttl > MAX_CACHE_TTL_SECS {
            return Err(EdgeError::Config(format!(
                "default_cache_ttl must be at most {} seconds",
                MAX_CACHE_TTL_SECS
            )));
        }

        if self.upstream_timeout_secs == 0 {
            return Err(EdgeError::Config(
                "upstream_timeout_secs must be greater than 0".to_string(),
            ));
        }

        if self.rate_limit.enabled {
            if self.rate_limit.window_ms == 0 {
                return Err(EdgeError::Config(
                    "rate_limit.window_ms must be greater than 0".to_string(),
                ));
            }
            if self.rate_limit.window_ms > MAX_WINDOW_MS {
                return Err(EdgeError::Config(format!(
                    "rate_limit.window_ms must be at most {}",
                    MAX_WINDOW_MS
                )));
            }
            if self.rate_limit.max_requests_per_window == 0 {
                return Err(EdgeError::Config(
                    "rate_limit.max_requests_per_window must be greater than 0".to_string(),
                ));
            }
        }

        if self.ingest_on_miss
            && (self.live_source_url.is_empty() || self.live_public_domain.is_empty())
        {
            return Err(EdgeError::Config(
                "live_source_url and live_public_domain are required when ingest_on_miss is enabled"
                    .to_string(),
            ));
        }

        if self.allowed_extensions.is_empty() {
            return Err(EdgeError::Config(
                "allowed_extensions must not be empty".to_string(),
            ));
        }

        match self.storage.backend.as_str() {
            "memory" => {
                if self.storage.memory_max_bytes == 0 {
                    return Err(EdgeError::Config(
                        "storage.memory_max_bytes must be greater than 0".to_string(),
                    ));
                }
            }
            "disk" => {
                if self.storage.disk_path.as_deref().map_or(true, str::is_empty) {
                    return Err(EdgeError::Config(
                        "storage.disk_path is required when backend is 'disk'".to_string(),
                    ));
                }
            }
            other => {
                return Err(EdgeError::Config(format!(
                    "Invalid storage backend '{}', must be 'memory' or 'disk'",
                    other
                )));
            }
        }

        self.listen_socket_addr()?;
        if let Some(metrics) = &self.metrics_endpoint {
            if metrics.enabled {
                metrics.address.parse::<SocketAddr>().map_err(|e| {
                    EdgeError::Config(format!(
                        "Invalid metrics address '{}': {}",
                        metrics.address, e
                    ))
                })?;
            }
        }

        Ok(())
    }

    /// Listen address as a SocketAddr
    pub fn listen_socket_addr(&self) -> Result<SocketAddr> {
        self.listen_address.parse().map_err(|e| {
            EdgeError::Config(format!(
                "Invalid listen address '{}': {}",
                self.listen_address, e
            ))
        })
    }

    /// Default cache TTL as a Duration
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.default_cache_ttl)
    }

    /// Outbound call timeout as a Duration
    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout_secs)
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "true" | "1" | "yes" | "on"
    )
}
