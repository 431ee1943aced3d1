//! Prometheus metrics for the image edge cache

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::time::Duration;

/// Metrics collected per request
///
/// Each instance owns its own [`Registry`], so several handlers (or tests) can
/// coexist in one process without name collisions.
#[derive(Clone)]
pub struct EdgeMetrics {
    registry: Registry,

    /// Terminal outcome of every request
    requests_total: IntCounterVec,

    /// Fallback tier fetches by tier and result (usable, unavailable, error)
    tier_fetches_total: IntCounterVec,

    /// Cache writes that failed after a successful fetch
    cache_write_errors_total: IntCounter,

    /// End-to-end request latency
    request_duration_seconds: Histogram,
}

impl EdgeMetrics {
    /// Create metrics registered in a fresh registry
    pub fn new() -> Result<Self, prometheus::Error> {
        Self::with_registry(Registry::new())
    }

    /// Create metrics registered in the given registry
    pub fn with_registry(registry: Registry) -> Result<Self, prometheus::Error> {
        let requests_total = IntCounterVec::new(
            Opts::new(
                "r2_image_cache_requests_total",
                "Total number of image requests by outcome",
            ),
            &["outcome"], // hit, miss, redirect, client_error, rate_limited, upstream_error, internal_error, method_not_allowed
        )?;
        registry.register(Box::new(requests_total.clone()))?;

        let tier_fetches_total = IntCounterVec::new(
            Opts::new(
                "r2_image_cache_tier_fetches_total",
                "Fallback tier fetches by tier and result",
            ),
            &["tier", "result"],
        )?;
        registry.register(Box::new(tier_fetches_total.clone()))?;

        let cache_write_errors_total = IntCounter::new(
            "r2_image_cache_cache_write_errors_total",
            "Total number of failed cache writes",
        )?;
        registry.register(Box::new(cache_write_errors_total.clone()))?;

        let request_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "r2_image_cache_request_duration_seconds",
                "Duration of image requests in seconds",
            )
            .buckets(vec![
                0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
            ]),
        )?;
        registry.register(Box::new(request_duration_seconds.clone()))?;

        Ok(Self {
            registry,
            requests_total,
            tier_fetches_total,
            cache_write_errors_total,
            request_duration_seconds,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Record the terminal outcome of a request
    pub fn record_outcome(&self, outcome: &str) {
        self.requests_total.with_label_values(&[outcome]).inc();
    }

    /// Record a fallback tier fetch
    pub fn record_tier(&self, tier: &str, result: &str) {
        self.tier_fetches_total
            .with_label_values(&[tier, result])
            .inc();
    }

    pub fn record_cache_write_error(&self) {
        self.cache_write_errors_total.inc();
    }

    pub fn record_duration(&self, duration: Duration) {
        self.request_duration_seconds
            .observe(duration.as_secs_f64());
    }

    /// Current count for an outcome label
    pub fn outcome_count(&self, outcome: &str) -> u64 {
        self.requests_total.with_label_values(&[outcome]).get()
    }

    /// Current count for a tier/result pair
    pub fn tier_count(&self, tier: &str, result: &str) -> u64 {
        self.tier_fetches_total
            .with_label_values(&[tier, result])
            .get()
    }

    pub fn cache_write_errors(&self) -> u64 {
        self.cache_write_errors_total.get()
    }

    /// Render every metric in the Prometheus text exposition format
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
