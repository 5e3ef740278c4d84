//! Router configuration for the image resizer.
//!
//! # Route Structure
//!
//! ```text
//! /health                            - Health check with cache statistics
//! /{prefix}/{path}.{ext}?width=...   - Image requests (resize middleware)
//! *                                  - JSON 404
//! ```
//!
//! # Example
//!
//! ```ignore
//! use image_resizer::server::{create_router, RouterConfig};
//!
//! let config = RouterConfig::default()
//!     .with_prefixes(vec!["images".to_string()])
//!     .with_cors_origins(vec!["https://example.com".to_string()]);
//!
//! let router = create_router(resize_service, config);
//!
//! let listener = tokio::net::TcpListener::bind("0.0.0.0:3000").await?;
//! axum::serve(listener, router).await?;
//! ```

use std::time::Duration;

use axum::{middleware, routing::get, Router};
use http::header::{CONTENT_TYPE, IF_MODIFIED_SINCE, IF_NONE_MATCH};
use http::Method;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use super::handlers::{health_handler, not_found_handler, resize_middleware, AppState};
use super::protocol::Bounds;
use crate::codec::ImageCodec;
use crate::resize::ResizeService;

/// Default Cache-Control max-age: 1 hour.
pub const DEFAULT_CACHE_MAX_AGE: u32 = 3600;

/// Default largest width or height a client may request.
pub const DEFAULT_MAX_DIMENSION: u32 = 4096;

// =============================================================================
// Router Configuration
// =============================================================================

/// Configuration for the HTTP router and request protocol.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Path prefixes served by the resizer (segment match, case-insensitive)
    pub prefixes: Vec<String>,

    /// File extensions served by the resizer (case-insensitive)
    pub extensions: Vec<String>,

    /// Accepted `width` range
    pub width_bounds: Bounds,

    /// Accepted `height` range
    pub height_bounds: Bounds,

    /// Accepted `quality` range
    pub quality_bounds: Bounds,

    /// Cache-Control max-age in seconds
    pub cache_max_age: u32,

    /// Emit `ETag` and honour `If-None-Match`
    pub etag_enabled: bool,

    /// Emit `Last-Modified` and honour `If-Modified-Since`
    pub last_modified_enabled: bool,

    /// Allowed CORS origins (None = allow any origin)
    pub cors_origins: Option<Vec<String>>,

    /// Whether to enable request tracing
    pub enable_tracing: bool,
}

impl Default for RouterConfig {
    /// By default:
    /// - `/images` is the only prefix
    /// - jpg, jpeg, png and webp are served
    /// - width and height range over 1-4096, quality over 1-100
    /// - Cache max-age is 1 hour
    /// - Both validators are enabled
    /// - CORS allows any origin and tracing is enabled
    fn default() -> Self {
        Self {
            prefixes: vec!["images".to_string()],
            extensions: ["jpg", "jpeg", "png", "webp"]
                .iter()
                .map(|e| e.to_string())
                .collect(),
            width_bounds: Bounds::new(1, DEFAULT_MAX_DIMENSION),
            height_bounds: Bounds::new(1, DEFAULT_MAX_DIMENSION),
            quality_bounds: Bounds::new(1, 100),
            cache_max_age: DEFAULT_CACHE_MAX_AGE,
            etag_enabled: true,
            last_modified_enabled: true,
            cors_origins: None,
            enable_tracing: true,
        }
    }
}

impl RouterConfig {
    /// Set the served path prefixes.
    pub fn with_prefixes(mut self, prefixes: Vec<String>) -> Self {
        self.prefixes = prefixes;
        self
    }

    /// Set the served file extensions.
    pub fn with_extensions(mut self, extensions: Vec<String>) -> Self {
        self.extensions = extensions;
        self
    }

    /// Set the accepted `width` range.
    pub fn with_width_bounds(mut self, min: u32, max: u32) -> Self {
        self.width_bounds = Bounds::new(min, max);
        self
    }

    /// Set the accepted `height` range.
    pub fn with_height_bounds(mut self, min: u32, max: u32) -> Self {
        self.height_bounds = Bounds::new(min, max);
        self
    }

    /// Set the accepted `quality` range.
    pub fn with_quality_bounds(mut self, min: u32, max: u32) -> Self {
        self.quality_bounds = Bounds::new(min, max);
        self
    }

    /// Set the Cache-Control max-age in seconds.
    pub fn with_cache_max_age(mut self, seconds: u32) -> Self {
        self.cache_max_age = seconds;
        self
    }

    /// Enable or disable ETags.
    pub fn with_etag(mut self, enabled: bool) -> Self {
        self.etag_enabled = enabled;
        self
    }

    /// Enable or disable Last-Modified.
    pub fn with_last_modified(mut self, enabled: bool) -> Self {
        self.last_modified_enabled = enabled;
        self
    }

    /// Set specific allowed CORS origins.
    ///
    /// Pass an empty vec to disallow all cross-origin requests.
    pub fn with_cors_origins(mut self, origins: Vec<String>) -> Self {
        self.cors_origins = Some(origins);
        self
    }

    /// Allow any CORS origin.
    pub fn with_cors_any_origin(mut self) -> Self {
        self.cors_origins = None;
        self
    }

    /// Enable or disable request tracing.
    pub fn with_tracing(mut self, enabled: bool) -> Self {
        self.enable_tracing = enabled;
        self
    }
}

// =============================================================================
// Router Builder
// =============================================================================

/// Create the main application router.
///
/// The resize middleware wraps every route, including the fallback, so
/// image paths are served without being registered as routes.
pub fn create_router<C: ImageCodec>(service: ResizeService<C>, config: RouterConfig) -> Router {
    let cors = build_cors_layer(&config);
    let enable_tracing = config.enable_tracing;
    let app_state = AppState::new(service, config);

    let router = Router::new()
        .route("/health", get(health_handler::<C>))
        .fallback(not_found_handler)
        .with_state(app_state.clone())
        .layer(middleware::from_fn_with_state(
            app_state,
            resize_middleware::<C>,
        ))
        .layer(cors);

    if enable_tracing {
        router.layer(TraceLayer::new_for_http())
    } else {
        router
    }
}

/// Build the CORS layer based on configuration.
fn build_cors_layer(config: &RouterConfig) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::HEAD, Method::OPTIONS])
        .allow_headers([CONTENT_TYPE, IF_NONE_MATCH, IF_MODIFIED_SINCE])
        .max_age(Duration::from_secs(86400));

    match &config.cors_origins {
        None => cors.allow_origin(Any),
        Some(origins) if origins.is_empty() => cors,
        Some(origins) => {
            let parsed_origins: Vec<_> = origins.iter().filter_map(|o| o.parse().ok()).collect();
            cors.allow_origin(parsed_origins)
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
