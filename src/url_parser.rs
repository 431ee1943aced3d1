//! Request path parsing
//!
//! Two path shapes are recognised:
//!
//! ```text
//! /<id>.<ext>                    original asset
//! /<id>-<width>x<height>.<ext>   sized variant
//! ```
//!
//! The id portion may itself contain `/` (nested origin paths).

use crate::models::{ParsedImageRequest, ORIGINAL_VARIANT};
use tracing::debug;

/// Parse a request path into an image identity
///
/// # Returns
/// * `Some(ParsedImageRequest)` if the path matches one of the two shapes
/// * `None` otherwise (the handler answers 400 "Invalid image URL")
///
/// The id may come back empty (e.g. `/!!!.jpg`) and the extension is not
/// checked against an allow-list here; both are reported separately by the
/// handler.
pub fn parse_image_path(path: &str) -> Option<ParsedImageRequest> {
    let rest = path.trim_start_matches('/');
    if rest.is_empty() || rest.ends_with('/') {
        debug!("Path has no file component: {}", path);
        return None;
    }

    let dot = rest.rfind('.')?;
    let (stem, extension) = (&rest[..dot], &rest[dot + 1..]);

    // The extension belongs to the final segment only
    if stem.is_empty()
        || extension.is_empty()
        || !extension.chars().all(|c| c.is_ascii_alphanumeric())
    {
        debug!("Path has no usable extension: {}", path);
        return None;
    }

    let (original_path, dimensions) = match split_dimensions(stem) {
        DimensionSuffix::Present { id, width, height } => (id, Some((width, height))),
        DimensionSuffix::Absent => (stem, None),
        DimensionSuffix::Malformed => {
            debug!("Dimension suffix out of range: {}", path);
            return None;
        }
    };

    let (width, height, variant) = match dimensions {
        Some((w, h)) => (
            Some(w.parse::<u32>().ok()?),
            Some(h.parse::<u32>().ok()?),
            sanitize_id(&format!("{}x{}", w, h)),
        ),
        None => (None, None, ORIGINAL_VARIANT.to_string()),
    };

    Some(ParsedImageRequest {
        id: sanitize_id(original_path),
        original_path: original_path.to_string(),
        width,
        height,
        extension: extension.to_ascii_lowercase(),
        variant,
    })
}

enum DimensionSuffix<'a> {
    Present {
        id: &'a str,
        width: &'a str,
        height: &'a str,
    },
    Absent,
    Malformed,
}

/// Split a trailing `-<digits>x<digits>` off the stem
fn split_dimensions(stem: &str) -> DimensionSuffix<'_> {
    let Some(dash) = stem.rfind('-') else {
        return DimensionSuffix::Absent;
    };
    let suffix = &stem[dash + 1..];
    let Some((width, height)) = suffix.split_once('x') else {
        return DimensionSuffix::Absent;
    };

    let is_digits = |s: &str| !s.is_empty() && s.chars().all(|c| c.is_ascii_digit());
    if !is_digits(width) || !is_digits(height) {
        return DimensionSuffix::Absent;
    }
    if width.parse::<u32>().is_err() || height.parse::<u32>().is_err() {
        return DimensionSuffix::Malformed;
    }

    DimensionSuffix::Present {
        id: &stem[..dash],
        width,
        height,
    }
}

/// Keep only `[A-Za-z0-9_-]`
pub fn sanitize_id(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect()
}

/// Keep only `[A-Za-z0-9_-/.]`
pub fn sanitize_file_path(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '/' | '.'))
        .collect()
}

/// Case-insensitive membership test against an extension allow-list
pub fn is_allowed_extension<S: AsRef<str>>(extension: &str, allowed: &[S]) -> bool {
    allowed
        .iter()
        .any(|candidate| candidate.as_ref().eq_ignore_ascii_case(extension))
}
