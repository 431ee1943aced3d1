//! Fallback tiers tried on a cache miss
//!
//! Each tier either yields a usable (2xx) response or reports that nothing is
//! available from it. The handler walks the tiers in order and stops at the
//! first usable response:
//!
//! ```text
//! cache miss ──► variant ──► original ──► (ingest and redirect)
//! ```
//!
//! Transport failures (connection errors, timeouts) are errors, not
//! "unavailable", and abort the walk.

use crate::error::Result;
use crate::image_service::ImageServiceClient;
use crate::models::{ParsedImageRequest, UpstreamResponse};
use async_trait::async_trait;
use http::StatusCode;
use std::sync::Arc;
use tracing::debug;

/// What a single tier produced
#[derive(Debug, Clone)]
pub enum TierOutcome {
    /// A 2xx response that can be cached and served
    Usable(UpstreamResponse),
    /// The tier does not apply or answered non-2xx
    Unavailable { status: StatusCode, body: String },
}

impl TierOutcome {
    /// Classify a buffered upstream response
    pub fn from_response(response: UpstreamResponse) -> Self {
        if response.is_ok() {
            TierOutcome::Usable(response)
        } else {
            TierOutcome::Unavailable {
                status: response.status,
                body: response.body_text(),
            }
        }
    }

    pub fn is_usable(&self) -> bool {
        matches!(self, TierOutcome::Usable(_))
    }
}

/// A named source consulted on a cache miss
#[async_trait]
pub trait FallbackTier: Send + Sync {
    /// Short name used in logs and metric labels
    fn name(&self) -> &'static str;

    async fn fetch(&self, request: &ParsedImageRequest) -> Result<TierOutcome>;
}

/// Pre-computed variant from the delivery endpoint
///
/// Does not apply to the `original` variant.
pub struct VariantTier {
    client: Arc<ImageServiceClient>,
}

impl VariantTier {
    pub fn new(client: Arc<ImageServiceClient>) -> Self {
        VariantTier { client }
    }
}

#[async_trait]
impl FallbackTier for VariantTier {
    fn name(&self) -> &'static str {
        "variant"
    }

    async fn fetch(&self, request: &ParsedImageRequest) -> Result<TierOutcome> {
        if request.is_original() {
            debug!("Skipping variant tier for original request id={}", request.id);
            return Ok(TierOutcome::Unavailable {
                status: StatusCode::NOT_FOUND,
                body: String::new(),
            });
        }
        let response = self.client.fetch_variant(&request.id, &request.variant).await?;
        Ok(TierOutcome::from_response(response))
    }
}

/// Original asset from the image storage API
pub struct OriginalTier {
    client: Arc<ImageServiceClient>,
}

impl OriginalTier {
    pub fn new(client: Arc<ImageServiceClient>) -> Self {
        OriginalTier { client }
    }
}

#[async_trait]
impl FallbackTier for OriginalTier {
    fn name(&self) -> &'static str {
        "original"
    }

    async fn fetch(&self, request: &ParsedImageRequest) -> Result<TierOutcome> {
        let response = self.client.fetch_original(&request.id).await?;
        Ok(TierOutcome::from_response(response))
    }
}

/// The standard tier order: variant, then original
pub fn default_tiers(client: Arc<ImageServiceClient>) -> Vec<Box<dyn FallbackTier>> {
    vec![
        Box::new(VariantTier::new(client.clone())),
        Box::new(OriginalTier::new(client)),
    ]
}
