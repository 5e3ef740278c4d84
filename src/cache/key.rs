//! Cache key derivation.
//!
//! A cache key identifies one rendered variant: a source image at a specific
//! revision, resized with specific options. Keys are SHA-256 digests rendered
//! as 64 lowercase hex characters, so they are deterministic across restarts
//! and safe to use directly as file names.
//!
//! # Canonical Form
//!
//! The digest input is a single line:
//!
//! ```text
//! {normalized_path}|w={width}|h={height}|q={quality}|upscale={0|1}|sig={signature}
//! ```
//!
//! Absent dimensions are rendered empty. The quality is always present because
//! callers default it from configuration before deriving the key.

use std::fmt;
use std::path::{Component, Path};
use std::time::{SystemTime, UNIX_EPOCH};

use sha2::{Digest, Sha256};

/// Length of a rendered cache key in hex characters.
pub const CACHE_KEY_LEN: usize = 64;

// =============================================================================
// Source Signature
// =============================================================================

/// Revision marker for a source file.
///
/// Built from the last-modified time and byte length, optionally extended
/// with a content digest. Any change to the source changes the signature,
/// which changes every cache key derived from it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceSignature(String);

impl SourceSignature {
    /// Build a signature from file metadata.
    pub fn from_metadata(modified: SystemTime, len: u64) -> Self {
        let since_epoch = modified.duration_since(UNIX_EPOCH).unwrap_or_default();
        Self(format!(
            "{}.{:09}-{}",
            since_epoch.as_secs(),
            since_epoch.subsec_nanos(),
            len
        ))
    }

    /// Extend the signature with a hex content digest.
    pub fn with_content_hash(self, content_hash: &str) -> Self {
        Self(format!("{}-{}", self.0, content_hash))
    }

    /// The signature as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// Key Options
// =============================================================================

/// The resize options that participate in the cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeyOptions {
    /// Requested width, if any
    pub width: Option<u32>,

    /// Requested height, if any
    pub height: Option<u32>,

    /// Effective quality (request value or configured default)
    pub quality: u8,

    /// Whether the output may be larger than the source
    pub allow_upscale: bool,
}

// =============================================================================
// Cache Key
// =============================================================================

/// A hex-encoded SHA-256 cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    /// The key as a hex string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Derive the cache key for a source revision and set of options.
///
/// Path spelling differences (case, separator style, `.` segments) collapse
/// to the same key.
pub fn derive_key(
    source_path: &Path,
    options: &KeyOptions,
    signature: &SourceSignature,
) -> CacheKey {
    let canonical = format!(
        "{}|w={}|h={}|q={}|upscale={}|sig={}",
        normalize_path(source_path),
        options.width.map(|w| w.to_string()).unwrap_or_default(),
        options.height.map(|h| h.to_string()).unwrap_or_default(),
        options.quality,
        u8::from(options.allow_upscale),
        signature
    );

    CacheKey(hex::encode(Sha256::digest(canonical.as_bytes())))
}

/// Normalize a path for key derivation.
///
/// Drops `.` segments, resolves `..` lexically, uses forward slashes,
/// lowercases, and strips leading separators. Windows drive prefixes are kept
/// as a leading segment.
pub fn normalize_path(path: &Path) -> String {
    let mut segments: Vec<String> = Vec::new();

    for component in path.components() {
        match component {
            Component::Prefix(prefix) => {
                segments.push(prefix.as_os_str().to_string_lossy().into_owned());
            }
            Component::RootDir | Component::CurDir => {}
            Component::ParentDir => {
                segments.pop();
            }
            Component::Normal(part) => {
                segments.push(part.to_string_lossy().into_owned());
            }
        }
    }

    segments
        .join("/")
        .replace('\\', "/")
        .split('/')
        .filter(|s| !s.is_empty() && *s != ".")
        .collect::<Vec<_>>()
        .join("/")
        .to_lowercase()
}

/// Hex SHA-256 digest of arbitrary bytes.
pub fn content_digest(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

// =============================================================================
// Tests
// =============================================================================
