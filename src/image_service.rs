//! HTTP client for the managed image service
//!
//! Three calls are made against the service:
//! - `GET {delivery}/{account_hash}/{id}/{variant}` for a transformed variant
//! - `GET {api_base}/accounts/{account_id}/images/v1/{id}/blob` for the original
//! - `POST {api_base}/accounts/{account_id}/images/v1` (multipart `url` + `id`)
//!   to ingest an asset from a source URL

use crate::config::CloudflareConfig;
use crate::error::{EdgeError, Result};
use crate::models::UpstreamResponse;
use reqwest::multipart::Form;
use reqwest::{Client, RequestBuilder};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Envelope returned by the image storage API
#[derive(Debug, Deserialize)]
pub struct ApiEnvelope {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub result: Option<UploadedImage>,
    #[serde(default)]
    pub errors: Vec<ApiMessage>,
}

#[derive(Debug, Deserialize)]
pub struct UploadedImage {
    pub id: String,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub variants: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct ApiMessage {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub message: String,
}

/// Client for variant delivery, original download and upload
pub struct ImageServiceClient {
    client: Client,
    config: CloudflareConfig,
}

impl ImageServiceClient {
    /// Create a new client whose every request is bounded by `timeout`
    pub fn new(config: CloudflareConfig, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EdgeError::Http(format!("Failed to create HTTP client: {}", e)))?;

        Ok(ImageServiceClient { client, config })
    }

    /// URL of a transformed variant on the delivery endpoint
    pub fn variant_url(&self, id: &str, variant: &str) -> String {
        format!(
            "{}/{}/{}/{}",
            self.config.image_delivery_url.trim_end_matches('/'),
            self.config.account_hash,
            id,
            variant
        )
    }

    /// URL of the original asset on the storage API
    pub fn original_url(&self, id: &str) -> String {
        format!("{}/{}/blob", self.images_url(), id)
    }

    /// Images collection URL on the storage API
    pub fn images_url(&self) -> String {
        format!(
            "{}/accounts/{}/images/v1",
            self.config.api_base.trim_end_matches('/'),
            self.config.account_id
        )
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        builder.bearer_auth(&self.config.api_token)
    }

    /// Fetch a transformed variant
    ///
    /// Non-2xx responses are returned, not raised; the caller decides what an
    /// unusable response means.
    pub async fn fetch_variant(&self, id: &str, variant: &str) -> Result<UpstreamResponse> {
        let url = self.variant_url(id, variant);
        debug!("Fetching variant: url={}", url);
        let response = self.client.get(&url).send().await.map_err(|e| {
            warn!("Variant request failed for url={}: {}", url, e);
            EdgeError::from(e)
        })?;
        buffer(response).await
    }

    /// Fetch the original asset
    pub async fn fetch_original(&self, id: &str) -> Result<UpstreamResponse> {
        let url = self.original_url(id);
        debug!("Fetching original: url={}", url);
        let response = self
            .authorized(self.client.get(&url))
            .send()
            .await
            .map_err(|e| {
                warn!("Original request failed for url={}: {}", url, e);
                EdgeError::from(e)
            })?;
        buffer(response).await
    }

    /// Register an asset with the image service by source URL
    ///
    /// # Returns
    /// * `Ok(())` on a 2xx answer
    /// * `Err(EdgeError::CloudflareApi)` carrying the upstream status and body otherwise
    pub async fn upload_from_url(&self, source_url: &str, id: &str) -> Result<()> {
        let url = self.images_url();
        let form = Form::new()
            .text("url", source_url.to_string())
            .text("id", id.to_string());

        debug!("Uploading image: id={}, source={}", id, source_url);
        let response = self
            .authorized(self.client.post(&url))
            .multipart(form)
            .send()
            .await
            .map_err(|e| {
                warn!("Upload request failed for id={}: {}", id, e);
                EdgeError::from(e)
            })?;

        let upstream = buffer(response).await?;
        if !upstream.is_ok() {
            warn!(
                "Image upload rejected: id={}, status={}",
                id, upstream.status
            );
            return Err(EdgeError::cloudflare_api(
                upstream.status.as_u16(),
                "Failed to upload image",
                upstream.body_text(),
            ));
        }

        match serde_json::from_slice::<ApiEnvelope>(&upstream.body) {
            Ok(ApiEnvelope {
                result: Some(image), ..
            }) => info!(
                "Image ingested: id={}, filename={:?}, variants={}",
                image.id,
                image.filename,
                image.variants.len()
            ),
            Ok(envelope) if !envelope.success => warn!(
                "Upload answered {} but reported errors: {:?}",
                upstream.status,
                envelope
                    .errors
                    .iter()
                    .map(|e| format!("{}: {}", e.code, e.message))
                    .collect::<Vec<_>>()
            ),
            Ok(_) => info!("Image ingested: id={}", id),
            Err(e) => debug!("Upload response for id={} is not an API envelope: {}", id, e),
        }
        Ok(())
    }
}

/// Read a response fully into memory
async fn buffer(response: reqwest::Response) -> Result<UpstreamResponse> {
    let status = response.status();
    let headers = response.headers().clone();
    let body = response.bytes().await?;
    debug!("Upstream answered status={}, size={}", status, body.len());
    Ok(UpstreamResponse {
        status,
        headers,
        body,
    })
}
