//! Per-client request limiting
//!
//! The limiter keeps one [`RateLimitRecord`] per client address in a
//! [`KvStore`]. A record counts requests from the moment its window opened;
//! once the window length has passed, the next request starts a fresh record.
//! This is a reset-on-expiry counter, not a continuously sliding average.
//!
//! The read-modify-write is not atomic: concurrent requests from one client
//! may overwrite each other's increments. The limiter is advisory.

use crate::config::RateLimitConfig;
use crate::error::Result;
use crate::models::{unix_millis, RateLimitRecord};
use crate::store::KvStore;
use chrono::Utc;
use http::HeaderMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Rate limiter backed by an external key-value store
pub struct RateLimiter {
    store: Arc<dyn KvStore>,
    config: RateLimitConfig,
    key_prefix: String,
}

impl RateLimiter {
    /// Create a new RateLimiter
    ///
    /// # Arguments
    /// * `store` - Where per-client records are kept
    /// * `config` - Window length, threshold and client address header
    /// * `key_prefix` - Deployment namespace used in record keys
    pub fn new(store: Arc<dyn KvStore>, config: RateLimitConfig, key_prefix: impl Into<String>) -> Self {
        RateLimiter {
            store,
            config,
            key_prefix: key_prefix.into(),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Key under which a client's record is stored
    pub fn record_key(&self, client_ip: &str) -> String {
        format!("ratelimit:{}:{}", self.key_prefix, client_ip)
    }

    /// Determine the client address from request headers
    ///
    /// Uses the configured header first, then the first hop of
    /// `X-Forwarded-For`.
    pub fn client_ip(&self, headers: &HeaderMap) -> Option<String> {
        let direct = headers
            .get(self.config.client_ip_header.as_str())
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty());
        if let Some(ip) = direct {
            return Some(ip.to_string());
        }

        headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    }

    /// Count a request and decide whether it may proceed
    ///
    /// Requests without a client address are always allowed.
    pub async fn allow(&self, client_ip: Option<&str>) -> Result<bool> {
        self.allow_at(client_ip, unix_millis(Utc::now())).await
    }

    /// [`allow`](Self::allow) with an explicit clock reading in milliseconds
    pub async fn allow_at(&self, client_ip: Option<&str>, now_ms: u64) -> Result<bool> {
        let Some(ip) = client_ip else {
            warn!("Unable to determine client IP address, allowing request");
            return Ok(true);
        };

        let key = self.record_key(ip);
        let window_ms = self.config.window_ms;

        let previous = match self.store.get(&key).await? {
            Some(raw) => match serde_json::from_str::<RateLimitRecord>(&raw) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!("Discarding unreadable rate limit record {}: {}", key, e);
                    None
                }
            },
            None => None,
        };

        let record = match previous {
            Some(record) if !record.is_expired(now_ms, window_ms) => RateLimitRecord {
                count: record.count.saturating_add(1),
                ..record
            },
            _ => RateLimitRecord::fresh(now_ms),
        };

        let allowed = record.count <= self.config.max_requests_per_window;

        // Persisted even on denial so the client stays limited for the rest of the window
        let ttl = Duration::from_millis(window_ms).max(Duration::from_secs(1));
        self.store
            .put(&key, serde_json::to_string(&record)?, Some(ttl))
            .await?;

        debug!(
            "Rate limit check: client={}, count={}, limit={}, allowed={}",
            ip, record.count, self.config.max_requests_per_window, allowed
        );
        Ok(allowed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryKvStore;
    use http::HeaderValue;

    fn limiter(max: u64) -> (RateLimiter, Arc<MemoryKvStore>) {
        let store = Arc::new(MemoryKvStore::new());
        let config = RateLimitConfig {
            enabled: true,
            window_ms: 1_000,
            max_requests_per_window: max,
            ..Default::default()
        };
        (RateLimiter::new(store.clone(), config, "test"), store)
    }

    #[tokio::test]
    async fn test_missing_ip_degrades_open() {
        let (limiter, _) = limiter(0);
        assert!(limiter.allow(None).await.unwrap());
    }

    #[tokio::test]
    async fn test_denied_request_is_persisted() {
        let (limiter, store) = limiter(1);
        assert!(limiter.allow_at(Some("1.2.3.4"), 10_000).await.unwrap());
        assert!(!limiter.allow_at(Some("1.2.3.4"), 10_100).await.unwrap());

        let raw = store.get("ratelimit:test:1.2.3.4").await.unwrap().unwrap();
        let record: RateLimitRecord = serde_json::from_str(&raw).unwrap();
        assert_eq!(record, RateLimitRecord { count: 2, timestamp: 10_000 });
    }

    #[tokio::test]
    async fn test_window_boundary_is_inclusive() {
        let (limiter, _) = limiter(1);
        assert!(limiter.allow_at(Some("ip"), 0).await.unwrap());
        // Exactly window_ms later the window is still open
        assert!(!limiter.allow_at(Some("ip"), 1_000).await.unwrap());
        assert!(limiter.allow_at(Some("ip"), 1_001).await.unwrap());
    }

    #[tokio::test]
    async fn test_corrupt_record_starts_fresh() {
        let (limiter, store) = limiter(1);
        store
            .put("ratelimit:test:ip", "not json".to_string(), None)
            .await
            .unwrap();
        assert!(limiter.allow_at(Some("ip"), 5).await.unwrap());
    }

    #[test]
    fn test_client_ip_resolution() {
        let (limiter, _) = limiter(1);

        let mut headers = HeaderMap::new();
        assert_eq!(limiter.client_ip(&headers), None);

        headers.insert("x-forwarded-for", HeaderValue::from_static("9.9.9.9, 10.0.0.1"));
        assert_eq!(limiter.client_ip(&headers).as_deref(), Some("9.9.9.9"));

        headers.insert("cf-connecting-ip", HeaderValue::from_static("1.1.1.1"));
        assert_eq!(limiter.client_ip(&headers).as_deref(), Some("1.1.1.1"));
    }
}
