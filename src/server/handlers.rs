//! HTTP handlers for the image resizer.
//!
//! Resizing is implemented as middleware rather than a route so that any
//! request outside the configured prefixes and extensions falls through to
//! the inner router untouched.
//!
//! # Endpoints
//!
//! - `GET|HEAD /{prefix}/{path}.{ext}[?width=N][&height=N][&quality=N]`
//! - `GET /health` - Health check with cache statistics

use std::sync::Arc;
use std::time::SystemTime;

use axum::{
    body::Body,
    extract::{Request, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use serde::Serialize;
use tracing::{debug, error, warn, Instrument};

use super::protocol::{
    etag_matches, format_http_date, has_allowed_extension, match_prefix, not_modified_since,
    original_etag, variant_etag, ResizeQuery,
};
use super::routes::RouterConfig;
use crate::cache::StoreStats;
use crate::codec::ImageCodec;
use crate::error::{ResizeError, ValidationError};
use crate::resize::{ResizeRequest, ResizeService};

/// Response header reporting whether a variant came from the store.
pub const X_RESIZE_CACHE: HeaderName = HeaderName::from_static("x-resize-cache");

/// Value of the `Vary` header on image responses.
const VARY_VALUE: &str = "width, height, quality";

// =============================================================================
// Application State
// =============================================================================

/// Shared application state.
pub struct AppState<C: ImageCodec> {
    /// The resize orchestrator
    pub service: Arc<ResizeService<C>>,

    /// Protocol and header settings
    pub config: Arc<RouterConfig>,
}

impl<C: ImageCodec> AppState<C> {
    /// Create application state from a service and router configuration.
    pub fn new(service: ResizeService<C>, config: RouterConfig) -> Self {
        Self {
            service: Arc::new(service),
            config: Arc::new(config),
        }
    }
}

impl<C: ImageCodec> Clone for AppState<C> {
    fn clone(&self) -> Self {
        Self {
            service: Arc::clone(&self.service),
            config: Arc::clone(&self.config),
        }
    }
}

// =============================================================================
// Response Types
// =============================================================================

/// JSON error response returned for 403, 404 and 5xx conditions.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error type identifier (e.g., "not_found", "forbidden")
    pub error: String,

    /// Human-readable error message
    pub message: String,

    /// HTTP status code (included for convenience)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}

impl ErrorResponse {
    /// Create a new error response.
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
            status: None,
        }
    }

    /// Create a new error response with status code.
    pub fn with_status(
        error: impl Into<String>,
        message: impl Into<String>,
        status: StatusCode,
    ) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
            status: Some(status.as_u16()),
        }
    }
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Service status
    pub status: String,

    /// Service version
    pub version: String,

    /// Variant store usage, absent if the cache could not be scanned
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache: Option<StoreStats>,
}

// =============================================================================
// Error Mapping
// =============================================================================

/// Convert ResizeError to HTTP response.
///
/// - 404 is logged at DEBUG (common and expected)
/// - 403 is logged at WARN as a security event
/// - everything else is a 500 logged at ERROR
impl IntoResponse for ResizeError {
    fn into_response(self) -> Response {
        let (status, error_type) = match &self {
            ResizeError::NotFound { .. } => (StatusCode::NOT_FOUND, "not_found"),
            ResizeError::SecurityViolation { .. } => (StatusCode::FORBIDDEN, "forbidden"),
            ResizeError::Codec { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "codec_error"),
            ResizeError::CacheIo(_) => (StatusCode::INTERNAL_SERVER_ERROR, "cache_error"),
            ResizeError::SourceIo { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "io_error"),
            ResizeError::LockTimeout { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "lock_timeout"),
        };

        let message = match &self {
            // Do not echo filesystem details back to clients.
            ResizeError::SecurityViolation { .. } => "Access denied".to_string(),
            _ if status.is_server_error() => format!("Internal error ({})", error_type),
            e => e.to_string(),
        };

        match status {
            StatusCode::NOT_FOUND => {
                debug!(error_type, status = status.as_u16(), "Resource not found: {}", self);
            }
            StatusCode::FORBIDDEN => {
                warn!(error_type, status = status.as_u16(), "Security violation: {}", self);
            }
            _ => {
                error!(error_type, status = status.as_u16(), "Server error: {}", self);
            }
        }

        let error_response = ErrorResponse::with_status(error_type, message, status);

        (status, Json(error_response)).into_response()
    }
}

/// Convert ValidationError to a plain-text 400 response.
impl IntoResponse for ValidationError {
    fn into_response(self) -> Response {
        debug!(status = 400, "Rejected request: {}", self);
        (
            StatusCode::BAD_REQUEST,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            self.to_string(),
        )
            .into_response()
    }
}

/// Errors produced while serving an image request.
#[derive(Debug)]
pub enum HandlerError {
    /// A query parameter was out of bounds; answered with 400.
    Validation(ValidationError),

    /// Resolving or rendering the variant failed; status depends on the cause.
    Resize(ResizeError),
}

impl IntoResponse for HandlerError {
    fn into_response(self) -> Response {
        match self {
            HandlerError::Validation(e) => e.into_response(),
            HandlerError::Resize(e) => e.into_response(),
        }
    }
}

impl From<ValidationError> for HandlerError {
    fn from(err: ValidationError) -> Self {
        HandlerError::Validation(err)
    }
}

impl From<ResizeError> for HandlerError {
    fn from(err: ResizeError) -> Self {
        HandlerError::Resize(err)
    }
}

// =============================================================================
// Resize Middleware
// =============================================================================

/// Serve matching image requests, pass everything else through.
///
/// A request is handled here when it is a GET or HEAD, its path starts with
/// a configured prefix, and its extension is allowed. Without `width` or
/// `height` the original file is served; otherwise the variant is resolved
/// through the [`ResizeService`].
///
/// # Responses
///
/// - `200 OK` with `ETag`, `Last-Modified`, `Cache-Control`, `Vary` and,
///   for variants, `X-Resize-Cache: hit|miss`
/// - `304 Not Modified` when the client's validators still match
/// - `400 Bad Request` (plain text) when a parameter is out of bounds
/// - `403 Forbidden` when the path escapes the content root
/// - `404 Not Found` when the source does not exist
/// - `500 Internal Server Error` for codec and I/O failures
pub async fn resize_middleware<C: ImageCodec>(
    State(state): State<AppState<C>>,
    request: Request,
    next: Next,
) -> Response {
    let method = request.method();
    if method != Method::GET && method != Method::HEAD {
        return next.run(request).await;
    }

    let uri = request.uri().clone();
    let Some(relative) = match_prefix(uri.path(), &state.config.prefixes) else {
        return next.run(request).await;
    };
    let Ok(source_id) = urlencoding::decode(relative) else {
        return next.run(request).await;
    };
    if !has_allowed_extension(&source_id, &state.config.extensions) {
        return next.run(request).await;
    }

    let head = request.method() == Method::HEAD;
    let query = ResizeQuery::parse(uri.query());
    let span = tracing::info_span!("resize_request", path = %uri.path());

    serve_image(&state, &source_id, query, request.headers(), head)
        .instrument(span.clone())
        .await
        .unwrap_or_else(|e| span.in_scope(|| e.into_response()))
}

async fn serve_image<C: ImageCodec>(
    state: &AppState<C>,
    source_id: &str,
    query: ResizeQuery,
    headers: &HeaderMap,
    head: bool,
) -> Result<Response, HandlerError> {
    let config = &state.config;
    let service = &state.service;

    if !query.wants_resize() {
        let source = service.resolve_original(source_id).await?;
        let validators = Validators {
            etag: config
                .etag_enabled
                .then(|| original_etag(&source.path, &source.signature)),
            last_modified: config.last_modified_enabled.then_some(source.modified),
        };

        if validators.not_modified(headers) {
            debug!(source = source_id, "Original not modified");
            return Ok(not_modified_response(&validators, config));
        }

        let body = if head {
            Bytes::new()
        } else {
            service.read_source(&source).await?
        };
        return Ok(image_response(
            body,
            source.content_type,
            source.size,
            &validators,
            config,
            None,
        ));
    }

    query.validate(config.width_bounds, config.height_bounds, config.quality_bounds)?;

    let mut request = ResizeRequest::new(source_id);
    request.width = query.width;
    request.height = query.height;
    request.quality = query.quality;

    let plan = service.plan(&request).await?;
    let validators = Validators {
        etag: config.etag_enabled.then(|| variant_etag(&plan.key)),
        last_modified: config.last_modified_enabled.then_some(plan.source.modified),
    };

    if validators.not_modified(headers) {
        debug!(source = source_id, key = %plan.key, "Variant not modified");
        return Ok(not_modified_response(&validators, config));
    }

    let outcome = service.ensure_planned(&plan).await?;
    let body = if head { Bytes::new() } else { outcome.data };

    Ok(image_response(
        body,
        outcome.content_type,
        outcome.size,
        &validators,
        config,
        Some(outcome.cache_hit),
    ))
}

// =============================================================================
// Validators and Responses
// =============================================================================

/// Validators attached to an image response.
struct Validators {
    etag: Option<String>,
    last_modified: Option<SystemTime>,
}

impl Validators {
    /// Whether the request's conditional headers allow a 304.
    ///
    /// `If-None-Match` takes precedence; `If-Modified-Since` is only
    /// consulted when it is absent.
    fn not_modified(&self, headers: &HeaderMap) -> bool {
        if let Some(etag) = &self.etag {
            if let Some(value) = header_str(headers, &header::IF_NONE_MATCH) {
                return etag_matches(value, etag);
            }
        }

        match (self.last_modified, header_str(headers, &header::IF_MODIFIED_SINCE)) {
            (Some(modified), Some(since)) => not_modified_since(since, modified),
            _ => false,
        }
    }

    fn apply(&self, headers: &mut HeaderMap) {
        if let Some(value) = self.etag.as_deref().and_then(|v| HeaderValue::from_str(v).ok()) {
            headers.insert(header::ETAG, value);
        }
        if let Some(modified) = self.last_modified {
            if let Ok(value) = HeaderValue::from_str(&format_http_date(modified)) {
                headers.insert(header::LAST_MODIFIED, value);
            }
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &HeaderName) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn apply_cache_headers(headers: &mut HeaderMap, validators: &Validators, config: &RouterConfig) {
    validators.apply(headers);
    if let Ok(value) = HeaderValue::from_str(&format!("public, max-age={}", config.cache_max_age)) {
        headers.insert(header::CACHE_CONTROL, value);
    }
    headers.insert(header::VARY, HeaderValue::from_static(VARY_VALUE));
}

fn not_modified_response(validators: &Validators, config: &RouterConfig) -> Response {
    let mut response = StatusCode::NOT_MODIFIED.into_response();
    apply_cache_headers(response.headers_mut(), validators, config);
    response
}

fn image_response(
    body: Bytes,
    content_type: &'static str,
    size: u64,
    validators: &Validators,
    config: &RouterConfig,
    cache_hit: Option<bool>,
) -> Response {
    let mut response = Response::new(Body::from(body));
    let headers = response.headers_mut();

    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(size));
    apply_cache_headers(headers, validators, config);
    if let Some(hit) = cache_hit {
        headers.insert(
            X_RESIZE_CACHE,
            HeaderValue::from_static(if hit { "hit" } else { "miss" }),
        );
    }

    response
}

// =============================================================================
// Other Handlers
// =============================================================================

/// Handle health check requests.
///
/// # Endpoint
///
/// `GET /health`
///
/// # Response
///
/// `200 OK` with JSON body:
/// ```json
/// {
///   "status": "healthy",
///   "version": "0.1.0",
///   "cache": { "total_bytes": 1024, "entry_count": 3, "max_bytes": 0 }
/// }
/// ```
pub async fn health_handler<C: ImageCodec>(State(state): State<AppState<C>>) -> Json<HealthResponse> {
    let cache = match state.service.cache_stats().await {
        Ok(stats) => Some(stats),
        Err(e) => {
            warn!(error = %e, "Failed to collect cache statistics");
            None
        }
    };

    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        cache,
    })
}

/// JSON 404 for anything no route or the resize middleware handled.
pub async fn not_found_handler() -> Response {
    let status = StatusCode::NOT_FOUND;
    (
        status,
        Json(ErrorResponse::with_status(
            "not_found",
            "No such resource",
            status,
        )),
    )
        .into_response()
}

// =============================================================================
// Tests
// =============================================================================
