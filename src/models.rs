//! Data models for the image edge cache

use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::header::{
    HeaderName, HeaderValue, CACHE_CONTROL, CONTENT_DISPOSITION, CONTENT_ENCODING,
    CONTENT_LANGUAGE, CONTENT_TYPE, EXPIRES,
};
use http::{HeaderMap, StatusCode};
use serde::{Deserialize, Serialize};

/// Variant name used when no dimensions are requested
pub const ORIGINAL_VARIANT: &str = "original";

/// A request path decoded into an image identity
///
/// Derived once per request and never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedImageRequest {
    /// Identifier restricted to `[A-Za-z0-9_-]`
    pub id: String,
    /// Raw id portion of the path, before sanitization
    pub original_path: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    /// Lowercased file extension
    pub extension: String,
    /// `"{width}x{height}"` or `"original"`
    pub variant: String,
}

impl ParsedImageRequest {
    /// Whether this is a request for the untransformed asset
    pub fn is_original(&self) -> bool {
        self.variant == ORIGINAL_VARIANT
    }

    /// Origin path with only `[A-Za-z0-9_-/.]` kept
    pub fn file_path(&self) -> String {
        crate::url_parser::sanitize_file_path(&self.original_path)
    }

    /// Path on the public domain that serves this image
    ///
    /// Format: `{file_path}{-variant unless original}.{extension}`
    pub fn public_path(&self) -> String {
        let postfix = if self.is_original() {
            String::new()
        } else {
            format!("-{}", self.variant)
        };
        format!("{}{}.{}", self.file_path(), postfix, self.extension)
    }
}

/// HTTP metadata kept alongside a cached object
///
/// Only this restricted set of headers survives a round trip through the cache.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpMetadata {
    pub content_type: Option<String>,
    pub content_language: Option<String>,
    pub content_disposition: Option<String>,
    pub content_encoding: Option<String>,
    pub cache_control: Option<String>,
    pub cache_expiry: Option<DateTime<Utc>>,
}

impl HttpMetadata {
    /// Extract the allow-listed headers from a response header map
    ///
    /// An `Expires` header is promoted to `cache_expiry` when it parses as an
    /// HTTP date; every other header is dropped.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let get = |name: &HeaderName| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.to_string())
        };

        let cache_expiry = headers
            .get(EXPIRES)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_http_date);

        HttpMetadata {
            content_type: get(&CONTENT_TYPE),
            content_language: get(&CONTENT_LANGUAGE),
            content_disposition: get(&CONTENT_DISPOSITION),
            content_encoding: get(&CONTENT_ENCODING),
            cache_control: get(&CACHE_CONTROL),
            cache_expiry,
        }
    }

    /// Write the stored fields back into a header map
    pub fn write_headers(&self, headers: &mut HeaderMap) {
        let fields = [
            (CONTENT_TYPE, &self.content_type),
            (CONTENT_LANGUAGE, &self.content_language),
            (CONTENT_DISPOSITION, &self.content_disposition),
            (CONTENT_ENCODING, &self.content_encoding),
            (CACHE_CONTROL, &self.cache_control),
        ];
        for (name, value) in fields {
            if let Some(value) = value.as_deref().and_then(|v| HeaderValue::from_str(v).ok()) {
                headers.insert(name, value);
            }
        }

        if let Some(expiry) = self.cache_expiry {
            if let Ok(value) = HeaderValue::from_str(&format_http_date(&expiry)) {
                headers.insert(EXPIRES, value);
            }
        }
    }
}

/// An object-store entry: body bytes plus restricted metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedImage {
    pub body: Bytes,
    pub http_metadata: HttpMetadata,
}

/// A fully buffered upstream response
///
/// Cloning shares the body buffer, so handing a clone to the cache and keeping
/// the original for the client costs no copy.
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl UpstreamResponse {
    /// Only 2xx responses are usable image bodies
    pub fn is_ok(&self) -> bool {
        self.status.is_success()
    }

    /// Body as lossy UTF-8, for error reporting
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Per-client request counter for the current window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitRecord {
    pub count: u64,
    /// Window start, milliseconds since the Unix epoch
    pub timestamp: u64,
}

impl RateLimitRecord {
    /// Start a new window at `now_ms`
    pub fn fresh(now_ms: u64) -> Self {
        RateLimitRecord {
            count: 1,
            timestamp: now_ms,
        }
    }

    /// Whether the window starting at `timestamp` has elapsed
    pub fn is_expired(&self, now_ms: u64, window_ms: u64) -> bool {
        now_ms.saturating_sub(self.timestamp) > window_ms
    }
}

/// Parse an HTTP date (IMF-fixdate, e.g. `Sun, 06 Nov 1994 08:49:37 GMT`)
pub fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Format a timestamp as an IMF-fixdate
pub fn format_http_date(value: &DateTime<Utc>) -> String {
    value.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Milliseconds since the Unix epoch for a timestamp
pub fn unix_millis(value: DateTime<Utc>) -> u64 {
    value.timestamp_millis().max(0) as u64
}
