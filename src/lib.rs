//! # Image Resizer
//!
//! An HTTP server that resizes images on demand and keeps every rendered
//! variant in an on-disk cache.
//!
//! Requests such as `GET /images/photos/cat.jpg?width=320` are resized once,
//! written atomically into a sharded cache directory and served from disk on
//! every later request until the source file changes.
//!
//! ## Features
//!
//! - **Deterministic cache keys**: Derived from the source path, the resize options and the source signature
//! - **Atomic writes**: Variants are written to a temp file and renamed into place
//! - **Size-bounded cache**: Least-recently-used variants are evicted to stay under a byte budget
//! - **Single-flight rendering**: Concurrent requests for one variant decode the source once
//! - **HTTP caching**: ETag, Last-Modified, Cache-Control and conditional requests
//!
//! ## Architecture
//!
//! The library is organized into several modules:
//!
//! - [`cache`] - Cache keys, the keyed lock and the sharded file store
//! - [`codec`] - Image decoding, resizing and encoding
//! - [`resize`] - Resize orchestration with single-flight rendering
//! - [`server`] - Axum-based HTTP protocol handler and router
//! - [`config`] - CLI and configuration types
//! - [`error`] - Error types shared across the crate
//!
//! ## Example
//!
//! ```rust,no_run
//! use image_resizer::{
//!     create_router, ImageCrateCodec, ResizeService, ResizeSettings, RouterConfig,
//!     ShardedFileStore, StoreConfig,
//! };
//!
//! #[tokio::main]
//! async fn main() {
//!     let store = ShardedFileStore::new(
//!         StoreConfig::new("/var/cache/resizer").with_max_bytes(512 * 1024 * 1024),
//!     );
//!     let service = ResizeService::new(
//!         "/srv/images",
//!         store,
//!         ImageCrateCodec::new(),
//!         ResizeSettings::default(),
//!     );
//!     let router = create_router(service, RouterConfig::default());
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:3000").await.unwrap();
//!     axum::serve(listener, router).await.unwrap();
//! }
//! ```

pub mod cache;
pub mod codec;
pub mod config;
pub mod error;
pub mod resize;
pub mod server;

// Re-export commonly used types
pub use cache::{
    derive_key, CacheKey, KeyOptions, KeyedLock, PruneReport, ShardedFileStore, SourceSignature,
    StoreConfig, StoreStats,
};
pub use codec::{EncodedImage, ImageCodec, ImageCrateCodec, ImageInfo, ResizeParams};
pub use config::Config;
pub use error::{CodecError, ResizeError, StoreError, ValidationError};
pub use resize::{ResizeOutcome, ResizeRequest, ResizeService, ResizeSettings};
pub use server::{create_router, AppState, ErrorResponse, HealthResponse, RouterConfig};
