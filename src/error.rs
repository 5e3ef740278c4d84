use std::path::PathBuf;

use thiserror::Error;

/// Errors reported by an image codec implementation.
#[derive(Debug, Clone, Error)]
pub enum CodecError {
    /// Source bytes could not be decoded
    #[error("Failed to decode image: {message}")]
    Decode { message: String },

    /// Resized pixels could not be encoded
    #[error("Failed to encode image: {message}")]
    Encode { message: String },

    /// The codec does not handle this format
    #[error("Unsupported image format: {0}")]
    UnsupportedFormat(String),

    /// The image file could not be read
    #[error("Failed to read image {path}: {message}")]
    Read { path: PathBuf, message: String },

    /// The blocking codec task panicked or was aborted
    #[error("Codec task failed: {0}")]
    Task(String),
}

/// Errors raised by the sharded file store.
///
/// The original `io::Error` is kept as the error source.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Creating a shard directory failed
    #[error("Failed to create cache directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Writing or syncing the temporary file failed
    #[error("Failed to write cache entry {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Renaming the temporary file over the final path failed
    #[error("Failed to commit cache entry {path}: {source}")]
    Commit {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Reading a committed entry failed
    #[error("Failed to read cache entry {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Scanning the cache directory failed
    #[error("Failed to scan cache directory {path}: {source}")]
    Scan {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors surfaced by the resize orchestrator.
///
/// Every filesystem and codec failure below the orchestrator is folded into
/// one of these kinds; the HTTP layer only ever matches on the variant.
#[derive(Debug, Error)]
pub enum ResizeError {
    /// The source image does not exist under the content root
    #[error("Source not found: {source_id}")]
    NotFound { source_id: String },

    /// The requested path resolves outside the content root
    #[error("Path escapes content root: {source_id}")]
    SecurityViolation { source_id: String },

    /// The codec could not decode or encode the image
    #[error("Codec failure for {source_id}: {error}")]
    Codec {
        source_id: String,
        #[source]
        error: CodecError,
    },

    /// Persisting the resized variant failed
    #[error("Cache I/O failure: {0}")]
    CacheIo(#[from] StoreError),

    /// The source exists but could not be read
    #[error("Failed to read source {path}: {error}")]
    SourceIo {
        path: PathBuf,
        #[source]
        error: std::io::Error,
    },

    /// Waiting for another request computing the same variant took too long
    #[error("Timed out waiting for cache lock on {path}")]
    LockTimeout { path: PathBuf },
}

/// Request parameter validation errors (HTTP 400).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// A numeric parameter falls outside its configured range
    #[error("{param} must be between {min} and {max} (got {value})")]
    OutOfBounds {
        param: &'static str,
        value: u32,
        min: u32,
        max: u32,
    },
}
