//! Read/write adapter between upstream responses and object-store entries

use crate::error::Result;
use crate::models::{CachedImage, HttpMetadata, UpstreamResponse};
use crate::store::ObjectStore;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Default object TTL: one year
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(31_536_000);

/// Build the cache key for a variant of an image
///
/// Format: `{prefix}/{id}/{variant}`
pub fn cache_key(prefix: &str, id: &str, variant: &str) -> String {
    format!("{}/{}/{}", prefix, id, variant)
}

/// Cache strategy over an object store
pub struct CacheStrategy {
    store: Arc<dyn ObjectStore>,
    default_ttl: Duration,
}

impl CacheStrategy {
    /// Create a new CacheStrategy
    ///
    /// # Arguments
    /// * `store` - Object store holding cached images
    /// * `default_ttl` - TTL applied when a write carries no override
    pub fn new(store: Arc<dyn ObjectStore>, default_ttl: Duration) -> Self {
        CacheStrategy { store, default_ttl }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Look up a cached image; absence is not an error
    pub async fn read(&self, key: &str) -> Result<Option<CachedImage>> {
        let result = self.store.get(key).await?;
        debug!(
            "Cache {} for key={}",
            if result.is_some() { "hit" } else { "miss" },
            key
        );
        Ok(result)
    }

    /// Store an upstream response under `key`
    ///
    /// Only content-type, content-language, content-disposition,
    /// content-encoding, cache-control and a parseable Expires survive.
    pub async fn write(
        &self,
        key: &str,
        response: &UpstreamResponse,
        ttl_override: Option<Duration>,
    ) -> Result<()> {
        let metadata = HttpMetadata::from_headers(&response.headers);
        let ttl = ttl_override.unwrap_or(self.default_ttl);

        debug!(
            "Caching key={}, size={}, ttl={}s",
            key,
            response.body.len(),
            ttl.as_secs()
        );
        self.store
            .put(key, response.body.clone(), metadata, ttl)
            .await
    }
}
