//! Request orchestration
//!
//! [`ImageHandler`] runs every request through the same sequence:
//!
//! 1. **Validate**: parse the path, require an id and an allowed extension
//! 2. **Rate check**: when enabled, count the request against its client
//! 3. **Cache lookup**: serve `{prefix}/{id}/{variant}` if present
//! 4. **Fallback tiers**: variant, then original (see [`crate::fallback`])
//! 5. **Ingest and redirect**: when nothing is usable and ingestion is on,
//!    register the asset from the live origin and redirect to the public URL
//! 6. **Populate and respond**: cache the usable response and serve it
//!
//! Validation happens before any I/O. Every other failure is caught once in
//! [`ImageHandler::handle`] and mapped to a status and body.

use crate::cache_strategy::{cache_key, CacheStrategy};
use crate::config::EdgeConfig;
use crate::error::{EdgeError, Result};
use crate::fallback::{default_tiers, FallbackTier, TierOutcome};
use crate::image_service::ImageServiceClient;
use crate::metrics::EdgeMetrics;
use crate::models::{CachedImage, ParsedImageRequest, UpstreamResponse};
use crate::rate_limiter::RateLimiter;
use crate::store::{KvStore, ObjectStore};
use crate::url_parser::{is_allowed_extension, parse_image_path};
use bytes::Bytes;
use http::header::{
    HeaderName, HeaderValue, ACCESS_CONTROL_ALLOW_ORIGIN, ALLOW, CONNECTION, CONTENT_LENGTH,
    CONTENT_TYPE, LOCATION, TRANSFER_ENCODING,
};
use http::{HeaderMap, Method, Response, StatusCode};
use http_body_util::Full;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Response type produced by the handler
pub type EdgeResponse = Response<Full<Bytes>>;

/// Header reporting whether the body came from the object store
pub const CACHE_STATUS_HEADER: &str = "x-r2-cache";

/// Content type assumed when neither the cache nor the upstream names one
pub const DEFAULT_CONTENT_TYPE: &str = "image/jpeg";

/// Headers from upstream that must not be forwarded verbatim
const HOP_BY_HOP: [HeaderName; 3] = [CONNECTION, TRANSFER_ENCODING, CONTENT_LENGTH];

/// How a valid request was satisfied
#[derive(Debug, Clone)]
pub enum Resolution {
    /// Served from the object store
    Hit(CachedImage),
    /// Fetched from a fallback tier and cached
    Miss(UpstreamResponse),
    /// Asset ingested; client should re-request at this URL
    Redirect(String),
}

impl Resolution {
    fn outcome_label(&self) -> &'static str {
        match self {
            Resolution::Hit(_) => "hit",
            Resolution::Miss(_) => "miss",
            Resolution::Redirect(_) => "redirect",
        }
    }
}

/// The cache-fill/fallback decision engine
pub struct ImageHandler {
    config: Arc<EdgeConfig>,
    cache: CacheStrategy,
    rate_limiter: RateLimiter,
    tiers: Vec<Box<dyn FallbackTier>>,
    images: Arc<ImageServiceClient>,
    metrics: Arc<EdgeMetrics>,
}

impl ImageHandler {
    /// Create a handler with the default tier order (variant, original)
    ///
    /// # Arguments
    /// * `config` - Validated configuration
    /// * `object_store` - Store for cached images
    /// * `kv_store` - Store for rate-limit records
    pub fn new(
        config: Arc<EdgeConfig>,
        object_store: Arc<dyn ObjectStore>,
        kv_store: Arc<dyn KvStore>,
    ) -> Result<Self> {
        let images = Arc::new(ImageServiceClient::new(
            config.cloudflare.clone(),
            config.upstream_timeout(),
        )?);
        let metrics = EdgeMetrics::new()
            .map_err(|e| EdgeError::Internal(format!("Failed to create metrics: {}", e)))?;

        Ok(ImageHandler {
            cache: CacheStrategy::new(object_store, config.cache_ttl()),
            rate_limiter: RateLimiter::new(
                kv_store,
                config.rate_limit.clone(),
                config.cache_key_prefix.clone(),
            ),
            tiers: default_tiers(images.clone()),
            images,
            metrics: Arc::new(metrics),
            config,
        })
    }

    /// Replace the fallback tiers
    pub fn with_tiers(mut self, tiers: Vec<Box<dyn FallbackTier>>) -> Self {
        self.tiers = tiers;
        self
    }

    /// Use a shared metrics collector
    pub fn with_metrics(mut self, metrics: Arc<EdgeMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn config(&self) -> &EdgeConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<EdgeMetrics> {
        &self.metrics
    }

    /// Tier names in the order they are consulted
    pub fn tier_names(&self) -> Vec<&'static str> {
        self.tiers.iter().map(|tier| tier.name()).collect()
    }

    /// Handle a request and always produce a response
    pub async fn handle(&self, method: &Method, path: &str, headers: &HeaderMap) -> EdgeResponse {
        let start = Instant::now();

        if *method != Method::GET {
            debug!("Rejecting method={} for path={}", method, path);
            self.metrics.record_outcome("method_not_allowed");
            let mut response = text_response(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed");
            response
                .headers_mut()
                .insert(ALLOW, HeaderValue::from_static("GET"));
            return response;
        }

        let response = match self.resolve(path, headers).await {
            Ok(resolution) => {
                info!("Served path={} outcome={}", path, resolution.outcome_label());
                self.metrics.record_outcome(resolution.outcome_label());
                self.into_response(resolution)
            }
            Err(e) => {
                if e.is_validation() || matches!(e, EdgeError::RateLimited) {
                    warn!("Rejected path={}: {}", path, e);
                } else {
                    error!("Error processing request path={}: {:?}", path, e);
                }
                self.metrics.record_outcome(e.outcome_label());
                error_response(&e)
            }
        };

        self.metrics.record_duration(start.elapsed());
        response
    }

    /// Parse and check a path without touching any store
    pub fn validate(&self, path: &str) -> Result<ParsedImageRequest> {
        let parsed = parse_image_path(path).ok_or(EdgeError::InvalidUrl)?;
        if parsed.id.is_empty() {
            return Err(EdgeError::MissingId);
        }
        if !is_allowed_extension(&parsed.extension, &self.config.allowed_extensions) {
            return Err(EdgeError::InvalidExtension);
        }
        Ok(parsed)
    }

    /// Run the decision sequence for a GET request
    pub async fn resolve(&self, path: &str, headers: &HeaderMap) -> Result<Resolution> {
        let parsed = self.validate(path)?;
        debug!(
            "Parsed request: id={}, variant={}, extension={}",
            parsed.id, parsed.variant, parsed.extension
        );

        if self.config.rate_limit.enabled {
            let client_ip = self.rate_limiter.client_ip(headers);
            if !self.rate_limiter.allow(client_ip.as_deref()).await? {
                return Err(EdgeError::RateLimited);
            }
        }

        let key = cache_key(&self.config.cache_key_prefix, &parsed.id, &parsed.variant);
        if let Some(cached) = self.cache.read(&key).await? {
            return Ok(Resolution::Hit(cached));
        }

        let mut last_miss = None;
        for tier in &self.tiers {
            match tier.fetch(&parsed).await {
                Ok(TierOutcome::Usable(response)) => {
                    self.metrics.record_tier(tier.name(), "usable");
                    self.populate(&key, &response).await;
                    return Ok(Resolution::Miss(response));
                }
                Ok(TierOutcome::Unavailable { status, body }) => {
                    debug!(
                        "Tier {} unavailable for id={}: status={}",
                        tier.name(),
                        parsed.id,
                        status
                    );
                    self.metrics.record_tier(tier.name(), "unavailable");
                    last_miss = Some((tier.name(), status, body));
                }
                Err(e) => {
                    self.metrics.record_tier(tier.name(), "error");
                    return Err(e);
                }
            }
        }

        if self.config.ingest_on_miss {
            return self.ingest_and_redirect(&parsed).await;
        }

        let (tier, status, body) =
            last_miss.unwrap_or(("original", StatusCode::NOT_FOUND, String::new()));
        Err(EdgeError::cloudflare_api(
            status.as_u16(),
            format!("Failed to fetch {} image", tier),
            body,
        ))
    }

    /// Cache a usable response; failures are logged, never surfaced
    async fn populate(&self, key: &str, response: &UpstreamResponse) {
        if let Err(e) = self.cache.write(key, response, None).await {
            warn!("Failed to populate cache for key={}: {}", key, e);
            self.metrics.record_cache_write_error();
        }
    }

    /// Register the asset from the live origin and point the client at the public URL
    async fn ingest_and_redirect(&self, parsed: &ParsedImageRequest) -> Result<Resolution> {
        let source_url = format!(
            "{}/{}.{}",
            self.config.live_source_url.trim_end_matches('/'),
            parsed.file_path(),
            parsed.extension
        );
        info!("Ingesting id={} from source={}", parsed.id, source_url);
        self.images.upload_from_url(&source_url, &parsed.id).await?;

        let location = format!(
            "{}/{}",
            self.config.live_public_domain.trim_end_matches('/'),
            parsed.public_path()
        );
        Ok(Resolution::Redirect(location))
    }

    fn into_response(&self, resolution: Resolution) -> EdgeResponse {
        match resolution {
            Resolution::Hit(cached) => {
                let mut headers = HeaderMap::new();
                cached.http_metadata.write_headers(&mut headers);
                image_response(StatusCode::OK, headers, cached.body, "HIT")
            }
            Resolution::Miss(upstream) => {
                let mut headers = upstream.headers;
                for name in HOP_BY_HOP.iter() {
                    headers.remove(name);
                }
                image_response(upstream.status, headers, upstream.body, "MISS")
            }
            Resolution::Redirect(location) => match HeaderValue::from_str(&location) {
                Ok(value) => {
                    let mut response = Response::new(Full::new(Bytes::new()));
                    *response.status_mut() = StatusCode::FOUND;
                    response.headers_mut().insert(LOCATION, value);
                    response
                }
                Err(e) => error_response(&EdgeError::Internal(format!(
                    "Invalid redirect location {}: {}",
                    location, e
                ))),
            },
        }
    }
}

fn image_response(
    status: StatusCode,
    mut headers: HeaderMap,
    body: Bytes,
    cache_status: &'static str,
) -> EdgeResponse {
    if !headers.contains_key(CONTENT_TYPE) {
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(DEFAULT_CONTENT_TYPE));
    }
    headers.insert(CACHE_STATUS_HEADER, HeaderValue::from_static(cache_status));
    headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));

    let mut response = Response::new(Full::new(body));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

fn text_response(status: StatusCode, body: impl Into<String>) -> EdgeResponse {
    let mut response = Response::new(Full::new(Bytes::from(body.into())));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

/// Map an error to its HTTP response
pub fn error_response(err: &EdgeError) -> EdgeResponse {
    let status =
        StatusCode::from_u16(err.to_http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    text_response(status, err.response_body())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryKvStore, MemoryObjectStore};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Tier returning a fixed outcome and counting calls
    struct StaticTier {
        name: &'static str,
        outcome: TierOutcome,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl FallbackTier for StaticTier {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn fetch(&self, _request: &ParsedImageRequest) -> Result<TierOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.outcome.clone())
        }
    }

    fn config() -> EdgeConfig {
        EdgeConfig {
            cache_key_prefix: "unit".to_string(),
            ingest_on_miss: false,
            ..Default::default()
        }
    }

    fn handler_with(config: EdgeConfig, tiers: Vec<Box<dyn FallbackTier>>) -> ImageHandler {
        ImageHandler::new(
            Arc::new(config),
            Arc::new(MemoryObjectStore::new()),
            Arc::new(MemoryKvStore::new()),
        )
        .unwrap()
        .with_tiers(tiers)
    }

    fn usable(body: &'static [u8]) -> TierOutcome {
        TierOutcome::Usable(UpstreamResponse {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: Bytes::from_static(body),
        })
    }

    fn unavailable(status: StatusCode) -> TierOutcome {
        TierOutcome::Unavailable {
            status,
            body: "nope".to_string(),
        }
    }

    #[test]
    fn test_default_tier_order() {
        let handler = ImageHandler::new(
            Arc::new(config()),
            Arc::new(MemoryObjectStore::new()),
            Arc::new(MemoryKvStore::new()),
        )
        .unwrap();
        assert_eq!(handler.tier_names(), vec!["variant", "original"]);
    }

    #[test]
    fn test_validation_order() {
        let handler = handler_with(config(), vec![]);
        assert!(matches!(handler.validate("/"), Err(EdgeError::InvalidUrl)));
        assert!(matches!(handler.validate("/%%%.jpg"), Err(EdgeError::MissingId)));
        // Missing id wins over a bad extension
        assert!(matches!(handler.validate("/%%%.exe"), Err(EdgeError::MissingId)));
        assert!(matches!(handler.validate("/cat.exe"), Err(EdgeError::InvalidExtension)));
        assert!(handler.validate("/cat.JPG").is_ok());
    }

    #[tokio::test]
    async fn test_first_usable_tier_wins() {
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let handler = handler_with(
            config(),
            vec![
                Box::new(StaticTier { name: "a", outcome: usable(b"a"), calls: first.clone() }),
                Box::new(StaticTier { name: "b", outcome: usable(b"b"), calls: second.clone() }),
            ],
        );

        let response = handler.handle(&Method::GET, "/cat.png", &HeaderMap::new()).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get(CACHE_STATUS_HEADER).unwrap(), "MISS");
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 0);
        assert_eq!(handler.metrics().tier_count("a", "usable"), 1);
    }

    #[tokio::test]
    async fn test_all_tiers_unavailable_reports_last_status() {
        let calls = Arc::new(AtomicUsize::new(0));
        let handler = handler_with(
            config(),
            vec![
                Box::new(StaticTier { name: "variant", outcome: unavailable(StatusCode::NOT_FOUND), calls: calls.clone() }),
                Box::new(StaticTier { name: "original", outcome: unavailable(StatusCode::FORBIDDEN), calls: calls.clone() }),
            ],
        );

        match handler.resolve("/cat-10x10.png", &HeaderMap::new()).await {
            Err(EdgeError::CloudflareApi { status, message, body }) => {
                assert_eq!(status, 403);
                assert_eq!(message, "Failed to fetch original image");
                assert_eq!(body, "nope");
            }
            other => panic!("unexpected resolution: {:?}", other),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_second_request_is_a_hit() {
        let calls = Arc::new(AtomicUsize::new(0));
        let handler = handler_with(
            config(),
            vec![Box::new(StaticTier { name: "original", outcome: usable(b"img"), calls: calls.clone() })],
        );

        let first = handler.resolve("/cat.png", &HeaderMap::new()).await.unwrap();
        assert!(matches!(first, Resolution::Miss(_)));
        let second = handler.resolve("/cat.png", &HeaderMap::new()).await.unwrap();
        assert!(matches!(second, Resolution::Hit(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_method_not_allowed() {
        let handler = handler_with(config(), vec![]);
        let response = handler.handle(&Method::POST, "/cat.png", &HeaderMap::new()).await;
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(response.headers().get(ALLOW).unwrap(), "GET");
    }

    #[test]
    fn test_miss_response_strips_length_and_defaults_content_type() {
        let handler = handler_with(config(), vec![]);
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("999"));
        headers.insert("etag", HeaderValue::from_static("\"abc\""));

        let response = handler.into_response(Resolution::Miss(UpstreamResponse {
            status: StatusCode::OK,
            headers,
            body: Bytes::from_static(b"img"),
        }));

        assert!(response.headers().get(CONTENT_LENGTH).is_none());
        assert_eq!(response.headers().get("etag").unwrap(), "\"abc\"");
        assert_eq!(response.headers().get(CONTENT_TYPE).unwrap(), DEFAULT_CONTENT_TYPE);
        assert_eq!(response.headers().get(ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(), "*");
    }
}
