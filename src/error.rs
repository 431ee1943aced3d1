//! Error types for the image edge cache

use thiserror::Error;

/// Result type alias for edge cache operations
pub type Result<T> = std::result::Result<T, EdgeError>;

/// Error types that can occur while serving an image request
#[derive(Error, Debug, Clone)]
pub enum EdgeError {
    #[error("Invalid image URL")]
    InvalidUrl,

    #[error("Missing id parameter")]
    MissingId,

    #[error("Invalid image extension")]
    InvalidExtension,

    #[error("Rate limit exceeded")]
    RateLimited,

    #[error("{message}")]
    CloudflareApi {
        status: u16,
        message: String,
        body: String,
    },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Network timeout: {0}")]
    Timeout(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for EdgeError {
    fn from(err: std::io::Error) -> Self {
        EdgeError::Io(err.to_string())
    }
}

impl From<reqwest::Error> for EdgeError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            EdgeError::Timeout(err.to_string())
        } else {
            EdgeError::Http(err.to_string())
        }
    }
}

impl From<serde_json::Error> for EdgeError {
    fn from(err: serde_json::Error) -> Self {
        EdgeError::Storage(format!("Failed to (de)serialize record: {}", err))
    }
}

impl EdgeError {
    /// Create a CloudflareApi error from an upstream status and body
    pub fn cloudflare_api(status: u16, message: impl Into<String>, body: impl Into<String>) -> Self {
        EdgeError::CloudflareApi {
            status,
            message: message.into(),
            body: body.into(),
        }
    }

    /// Whether the request was rejected before any external call was made
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            EdgeError::InvalidUrl | EdgeError::MissingId | EdgeError::InvalidExtension
        )
    }

    /// Convert error to HTTP status code
    ///
    /// - Validation errors: 400
    /// - Rate limiting: 429
    /// - Image API errors: the upstream status is passed through
    /// - Everything else: 500
    pub fn to_http_status(&self) -> u16 {
        match self {
            EdgeError::InvalidUrl | EdgeError::MissingId | EdgeError::InvalidExtension => 400,
            EdgeError::RateLimited => 429,
            // Statuses outside the valid range can't be passed through
            EdgeError::CloudflareApi { status, .. } if (100..=999).contains(status) => *status,
            EdgeError::CloudflareApi { .. } => 502,
            EdgeError::Storage(_)
            | EdgeError::Http(_)
            | EdgeError::Timeout(_)
            | EdgeError::Config(_)
            | EdgeError::Io(_)
            | EdgeError::Internal(_) => 500,
        }
    }

    /// Body text sent to the client for this error
    ///
    /// Internal details never leak: anything unanticipated becomes a fixed
    /// "Internal Server Error" body.
    pub fn response_body(&self) -> String {
        match self {
            EdgeError::InvalidUrl
            | EdgeError::MissingId
            | EdgeError::InvalidExtension
            | EdgeError::RateLimited => self.to_string(),
            EdgeError::CloudflareApi { message, .. } => {
                format!("Cloudflare API Error: {}", message)
            }
            _ => "Internal Server Error".to_string(),
        }
    }

    /// Label used for the request outcome metric
    pub fn outcome_label(&self) -> &'static str {
        match self {
            EdgeError::InvalidUrl | EdgeError::MissingId | EdgeError::InvalidExtension => {
                "client_error"
            }
            EdgeError::RateLimited => "rate_limited",
            EdgeError::CloudflareApi { .. } => "upstream_error",
            _ => "internal_error",
        }
    }
}
