//! Request protocol helpers.
//!
//! Pure functions used by the resize middleware: prefix and extension
//! matching, query parsing, bounds checks, validators and conditional
//! request evaluation. Nothing here touches the filesystem.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use url::form_urlencoded;

use crate::cache::{content_digest, normalize_path, CacheKey, SourceSignature};
use crate::error::ValidationError;

/// `strftime` pattern for IMF-fixdate (RFC 9110 section 5.6.7).
const HTTP_DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

// =============================================================================
// Bounds
// =============================================================================

/// Inclusive range a numeric query parameter must fall in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bounds {
    pub min: u32,
    pub max: u32,
}

impl Bounds {
    pub const fn new(min: u32, max: u32) -> Self {
        Self { min, max }
    }

    /// Check `value` against the range, naming `param` in the error.
    pub fn check(&self, param: &'static str, value: u32) -> Result<(), ValidationError> {
        if value < self.min || value > self.max {
            return Err(ValidationError::OutOfBounds {
                param,
                value,
                min: self.min,
                max: self.max,
            });
        }
        Ok(())
    }
}

// =============================================================================
// Path Matching
// =============================================================================

/// Match `path` against the configured prefixes.
///
/// Prefixes match whole segments, ignoring ASCII case: `images` matches
/// `/images/a.jpg` and `/images` but not `/imageshack/a.jpg`. Returns the
/// remainder after the prefix, without leading slashes.
pub fn match_prefix<'a>(path: &'a str, prefixes: &[String]) -> Option<&'a str> {
    let path = path.trim_start_matches('/');

    prefixes.iter().find_map(|prefix| {
        let prefix = prefix.trim_matches('/');
        if prefix.is_empty() || path.len() < prefix.len() {
            return None;
        }

        let (head, rest) = path.as_bytes().split_at(prefix.len());
        if !head.eq_ignore_ascii_case(prefix.as_bytes()) {
            return None;
        }
        match rest.first() {
            None => Some(""),
            Some(b'/') => Some(path[prefix.len()..].trim_start_matches('/')),
            Some(_) => None,
        }
    })
}

/// Whether `path` ends in one of `extensions` (case-insensitive).
///
/// Extensions may be configured with or without a leading dot.
pub fn has_allowed_extension(path: &str, extensions: &[String]) -> bool {
    let Some(extension) = Path::new(path).extension().and_then(|e| e.to_str()) else {
        return false;
    };

    extensions
        .iter()
        .any(|allowed| allowed.trim_start_matches('.').eq_ignore_ascii_case(extension))
}

// =============================================================================
// Query Parameters
// =============================================================================

/// Resize parameters parsed from the query string.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResizeQuery {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub quality: Option<u8>,
}

impl ResizeQuery {
    /// Parse `width`, `height` and `quality`.
    ///
    /// Values that are not non-negative integers are treated as absent, as
    /// is a quality that does not fit in a byte. When a parameter repeats,
    /// the first occurrence wins.
    pub fn parse(query: Option<&str>) -> Self {
        let mut parsed = Self::default();

        for (key, value) in form_urlencoded::parse(query.unwrap_or("").as_bytes()) {
            let value = value.trim();
            match &*key {
                "width" if parsed.width.is_none() => parsed.width = value.parse().ok(),
                "height" if parsed.height.is_none() => parsed.height = value.parse().ok(),
                "quality" if parsed.quality.is_none() => {
                    parsed.quality = value
                        .parse::<u32>()
                        .ok()
                        .and_then(|q| u8::try_from(q).ok());
                }
                _ => {}
            }
        }

        parsed
    }

    /// Whether a resize was requested.
    pub fn wants_resize(&self) -> bool {
        self.width.is_some() || self.height.is_some()
    }

    /// Check every present parameter against its bounds.
    pub fn validate(
        &self,
        width: Bounds,
        height: Bounds,
        quality: Bounds,
    ) -> Result<(), ValidationError> {
        if let Some(value) = self.width {
            width.check("width", value)?;
        }
        if let Some(value) = self.height {
            height.check("height", value)?;
        }
        if let Some(value) = self.quality {
            quality.check("quality", u32::from(value))?;
        }
        Ok(())
    }
}

// =============================================================================
// Validators
// =============================================================================

/// Strong ETag for a resized variant.
pub fn variant_etag(key: &CacheKey) -> String {
    format!("\"{}\"", key)
}

/// Strong ETag for an unmodified source file.
pub fn original_etag(path: &Path, signature: &SourceSignature) -> String {
    let digest = content_digest(format!("{}|{}", normalize_path(path), signature).as_bytes());
    format!("\"{}\"", digest)
}

/// Format a timestamp as an HTTP date.
pub fn format_http_date(time: SystemTime) -> String {
    DateTime::<Utc>::from(time).format(HTTP_DATE_FORMAT).to_string()
}

/// Parse an HTTP date in IMF-fixdate or other RFC 2822 form.
pub fn parse_http_date(value: &str) -> Option<SystemTime> {
    DateTime::parse_from_rfc2822(value.trim())
        .ok()
        .map(|date| SystemTime::from(date.with_timezone(&Utc)))
}

/// Evaluate an `If-None-Match` header value against `etag`.
///
/// Accepts `*`, comma-separated lists and weak validators (weak comparison).
pub fn etag_matches(if_none_match: &str, etag: &str) -> bool {
    let etag = strip_weak(etag.trim());

    if_none_match
        .split(',')
        .map(str::trim)
        .any(|candidate| candidate == "*" || strip_weak(candidate) == etag)
}

/// Whether a resource last modified at `last_modified` is unchanged since the
/// `If-Modified-Since` value. Compared at whole-second precision.
pub fn not_modified_since(if_modified_since: &str, last_modified: SystemTime) -> bool {
    match parse_http_date(if_modified_since) {
        Some(since) => unix_seconds(last_modified) <= unix_seconds(since),
        None => false,
    }
}

fn strip_weak(tag: &str) -> &str {
    tag.strip_prefix("W/").unwrap_or(tag)
}

fn unix_seconds(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

// =============================================================================
// Tests
// =============================================================================
