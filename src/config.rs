//! Configuration management for the image resizer.
//!
//! This module provides a flexible configuration system that supports:
//! - Command-line arguments via clap
//! - Environment variables with `RESIZER_` prefix
//! - Sensible defaults for all optional settings
//!
//! # Example
//!
//! ```ignore
//! use image_resizer::config::Config;
//!
//! let config = Config::parse();
//! config.validate()?;
//!
//! println!("Serving {} on {}", config.content_root.display(), config.bind_address());
//! ```
//!
//! # Environment Variables
//!
//! All configuration options can be set via environment variables with the
//! `RESIZER_` prefix:
//!
//! - `RESIZER_HOST` - Server bind address (default: 0.0.0.0)
//! - `RESIZER_PORT` - Server port (default: 3000)
//! - `RESIZER_CONTENT_ROOT` - Directory holding source images (required)
//! - `RESIZER_CACHE_ROOT` - Directory holding resized variants (required)
//! - `RESIZER_PREFIXES` - Comma-separated URL prefixes (default: images)
//! - `RESIZER_EXTENSIONS` - Comma-separated extensions (default: jpg,jpeg,png,webp)
//! - `RESIZER_MAX_CACHE_SIZE` - Cache budget, e.g. `512MB` (default: 0, unbounded)
//! - `RESIZER_SHARD_DEPTH` - Cache directory sharding depth, 0-4 (default: 2)
//! - `RESIZER_DEFAULT_QUALITY` - Quality when a request omits it (default: 85)
//! - `RESIZER_CACHE_MAX_AGE` - HTTP cache max-age seconds (default: 3600)

use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Parser};

use crate::cache::{StoreConfig, DEFAULT_SHARD_DEPTH, MAX_SHARD_DEPTH};
use crate::resize::{ResizeSettings, DEFAULT_QUALITY};
use crate::server::{RouterConfig, DEFAULT_CACHE_MAX_AGE, DEFAULT_MAX_DIMENSION};

// =============================================================================
// Default Values
// =============================================================================

/// Default server host.
pub const DEFAULT_HOST: &str = "0.0.0.0";

/// Default server port.
pub const DEFAULT_PORT: u16 = 3000;

/// Default number of entries removed by the startup prune.
pub const DEFAULT_PRUNE_BATCH: usize = 1000;

/// Default keyed lock timeout in seconds.
pub const DEFAULT_LOCK_TIMEOUT_SECS: u64 = 30;

// =============================================================================
// CLI Arguments
// =============================================================================

/// Image Resizer - on-demand image resizing with an on-disk variant cache.
///
/// Serves images from a content directory, resizing them on request and
/// keeping every rendered variant in a sharded, size-bounded cache.
#[derive(Parser, Debug, Clone)]
#[command(name = "image-resizer")]
#[command(author, version, about, long_about = None)]
pub struct Config {
    // =========================================================================
    // Server Configuration
    // =========================================================================
    /// Host address to bind the server to.
    #[arg(long, default_value = DEFAULT_HOST, env = "RESIZER_HOST")]
    pub host: String,

    /// Port to listen on.
    #[arg(short, long, default_value_t = DEFAULT_PORT, env = "RESIZER_PORT")]
    pub port: u16,

    // =========================================================================
    // Storage Configuration
    // =========================================================================
    /// Directory containing the source images.
    #[arg(long, env = "RESIZER_CONTENT_ROOT")]
    pub content_root: PathBuf,

    /// Directory where resized variants are stored.
    #[arg(long, env = "RESIZER_CACHE_ROOT")]
    pub cache_root: PathBuf,

    /// Number of two-character directory levels in the cache (0-4).
    #[arg(long, default_value_t = DEFAULT_SHARD_DEPTH, env = "RESIZER_SHARD_DEPTH")]
    pub shard_depth: u8,

    /// Maximum total size of the cache (e.g. "512MB", "2GB"). 0 means unbounded.
    #[arg(
        long,
        default_value = "0",
        value_parser = parse_byte_size,
        env = "RESIZER_MAX_CACHE_SIZE"
    )]
    pub max_cache_size: u64,

    /// Prune the cache before accepting requests.
    #[arg(long, default_value_t = false, env = "RESIZER_PRUNE_ON_STARTUP")]
    pub prune_on_startup: bool,

    /// Number of least-recently-used entries removed by the startup prune.
    #[arg(long, default_value_t = DEFAULT_PRUNE_BATCH, env = "RESIZER_PRUNE_BATCH")]
    pub prune_batch: usize,

    // =========================================================================
    // Request Protocol Configuration
    // =========================================================================
    /// URL path prefixes handled by the resizer (comma-separated).
    #[arg(long, default_value = "images", value_delimiter = ',', env = "RESIZER_PREFIXES")]
    pub prefixes: Vec<String>,

    /// File extensions handled by the resizer (comma-separated).
    #[arg(
        long,
        default_value = "jpg,jpeg,png,webp",
        value_delimiter = ',',
        env = "RESIZER_EXTENSIONS"
    )]
    pub extensions: Vec<String>,

    /// Smallest accepted `width`.
    #[arg(long, default_value_t = 1, env = "RESIZER_MIN_WIDTH")]
    pub min_width: u32,

    /// Largest accepted `width`.
    #[arg(long, default_value_t = DEFAULT_MAX_DIMENSION, env = "RESIZER_MAX_WIDTH")]
    pub max_width: u32,

    /// Smallest accepted `height`.
    #[arg(long, default_value_t = 1, env = "RESIZER_MIN_HEIGHT")]
    pub min_height: u32,

    /// Largest accepted `height`.
    #[arg(long, default_value_t = DEFAULT_MAX_DIMENSION, env = "RESIZER_MAX_HEIGHT")]
    pub max_height: u32,

    /// Smallest accepted `quality`.
    #[arg(long, default_value_t = 1, env = "RESIZER_MIN_QUALITY")]
    pub min_quality: u32,

    /// Largest accepted `quality`.
    #[arg(long, default_value_t = 100, env = "RESIZER_MAX_QUALITY")]
    pub max_quality: u32,

    /// HTTP Cache-Control max-age in seconds.
    #[arg(long, default_value_t = DEFAULT_CACHE_MAX_AGE, env = "RESIZER_CACHE_MAX_AGE")]
    pub cache_max_age: u32,

    /// Emit ETag headers and honour If-None-Match.
    #[arg(long, default_value_t = true, action = ArgAction::Set, env = "RESIZER_ETAG")]
    pub etag: bool,

    /// Emit Last-Modified headers and honour If-Modified-Since.
    #[arg(long, default_value_t = true, action = ArgAction::Set, env = "RESIZER_LAST_MODIFIED")]
    pub last_modified: bool,

    // =========================================================================
    // Resize Configuration
    // =========================================================================
    /// Quality used when a request omits it (1-100).
    #[arg(long, default_value_t = DEFAULT_QUALITY, env = "RESIZER_DEFAULT_QUALITY")]
    pub default_quality: u8,

    /// Allow variants larger than their source.
    #[arg(long, default_value_t = false, env = "RESIZER_ALLOW_UPSCALE")]
    pub allow_upscale: bool,

    /// Include a SHA-256 of the source bytes in cache keys.
    ///
    /// Catches edits that keep both size and modification time, at the cost
    /// of reading every source on each request.
    #[arg(long, default_value_t = false, env = "RESIZER_CONTENT_HASHING")]
    pub content_hashing: bool,

    /// Seconds to wait for another request rendering the same variant.
    /// 0 waits forever.
    #[arg(long, default_value_t = DEFAULT_LOCK_TIMEOUT_SECS, env = "RESIZER_LOCK_TIMEOUT")]
    pub lock_timeout_secs: u64,

    // =========================================================================
    // CORS Configuration
    // =========================================================================
    /// Allowed CORS origins (comma-separated).
    ///
    /// If not specified, allows any origin.
    #[arg(long, env = "RESIZER_CORS_ORIGINS", value_delimiter = ',')]
    pub cors_origins: Option<Vec<String>>,

    // =========================================================================
    // Logging Configuration
    // =========================================================================
    /// Enable verbose logging (debug level).
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,

    /// Disable request tracing.
    #[arg(long, default_value_t = false)]
    pub no_tracing: bool,
}

impl Config {
    /// Validate the configuration and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        if self.content_root.as_os_str().is_empty() {
            return Err(
                "Content root is required. Set --content-root or RESIZER_CONTENT_ROOT".to_string(),
            );
        }
        if self.cache_root.as_os_str().is_empty() {
            return Err(
                "Cache root is required. Set --cache-root or RESIZER_CACHE_ROOT".to_string(),
            );
        }
        if self.cache_root.starts_with(&self.content_root) {
            return Err("cache_root must not be inside content_root".to_string());
        }

        if self.shard_depth > MAX_SHARD_DEPTH {
            return Err(format!("shard_depth must be between 0 and {}", MAX_SHARD_DEPTH));
        }

        if self.prefixes.iter().all(|p| p.trim_matches('/').is_empty()) {
            return Err("At least one non-empty prefix is required".to_string());
        }
        if self.extensions.iter().all(|e| e.trim_start_matches('.').is_empty()) {
            return Err("At least one extension is required".to_string());
        }

        check_range("width", self.min_width, self.max_width, 1, u32::MAX)?;
        check_range("height", self.min_height, self.max_height, 1, u32::MAX)?;
        check_range("quality", self.min_quality, self.max_quality, 1, 100)?;

        if self.default_quality == 0 || self.default_quality > 100 {
            return Err("default_quality must be between 1 and 100".to_string());
        }

        Ok(())
    }

    /// Get the server bind address as "host:port".
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Store settings derived from this configuration.
    pub fn store_config(&self) -> StoreConfig {
        StoreConfig::new(&self.cache_root)
            .with_shard_depth(self.shard_depth)
            .with_max_bytes(self.max_cache_size)
    }

    /// Orchestrator settings derived from this configuration.
    pub fn resize_settings(&self) -> ResizeSettings {
        ResizeSettings {
            default_quality: self.default_quality,
            allow_upscale: self.allow_upscale,
            content_hashing: self.content_hashing,
            lock_timeout: (self.lock_timeout_secs > 0)
                .then(|| Duration::from_secs(self.lock_timeout_secs)),
            ..ResizeSettings::default()
        }
    }

    /// Router settings derived from this configuration.
    pub fn router_config(&self) -> RouterConfig {
        let mut router_config = RouterConfig::default()
            .with_prefixes(clean_list(&self.prefixes))
            .with_extensions(clean_list(&self.extensions))
            .with_width_bounds(self.min_width, self.max_width)
            .with_height_bounds(self.min_height, self.max_height)
            .with_quality_bounds(self.min_quality, self.max_quality)
            .with_cache_max_age(self.cache_max_age)
            .with_etag(self.etag)
            .with_last_modified(self.last_modified)
            .with_tracing(!self.no_tracing);

        if let Some(ref origins) = self.cors_origins {
            router_config = router_config.with_cors_origins(origins.clone());
        }

        router_config
    }
}

fn check_range(name: &str, min: u32, max: u32, floor: u32, ceiling: u32) -> Result<(), String> {
    if min < floor || max > ceiling || min > max {
        return Err(format!(
            "{name} bounds must satisfy {floor} <= min <= max <= {ceiling} (got {min}..{max})"
        ));
    }
    Ok(())
}

fn clean_list(values: &[String]) -> Vec<String> {
    values
        .iter()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .collect()
}

/// Parse a human-readable byte size such as `512MB`, `1.5GB` or `4096`.
///
/// Units are binary (1KB = 1024 bytes) and case-insensitive.
pub fn parse_byte_size(input: &str) -> Result<u64, String> {
    let trimmed = input.trim();
    let split = trimmed
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(trimmed.len());
    let (number, unit) = trimmed.split_at(split);

    let multiplier: u64 = match unit.trim().to_ascii_uppercase().as_str() {
        "" | "B" => 1,
        "K" | "KB" | "KIB" => 1 << 10,
        "M" | "MB" | "MIB" => 1 << 20,
        "G" | "GB" | "GIB" => 1 << 30,
        "T" | "TB" | "TIB" => 1 << 40,
        other => return Err(format!("unknown size unit '{}' in '{}'", other, input)),
    };

    let value: f64 = number
        .parse()
        .map_err(|_| format!("invalid size '{}'", input))?;
    let bytes = value * multiplier as f64;
    if !bytes.is_finite() || bytes < 0.0 || bytes > u64::MAX as f64 {
        return Err(format!("size out of range: '{}'", input));
    }

    Ok(bytes as u64)
}

// =============================================================================
// Tests
// =============================================================================
