//! API integration tests for image requests and error handling.
//!
//! Tests verify:
//! - Resizing with the real codec and the response headers it carries
//! - Conditional requests (ETag and Last-Modified)
//! - Error cases (bad parameters, missing files, path traversal)
//! - Requests that fall outside the configured prefixes and extensions

use std::sync::atomic::Ordering;

use axum::http::{Method, Request, StatusCode};

use image_resizer::RouterConfig;

use super::test_utils::{
    body_bytes, create_test_jpeg, get, header, image_dimensions, is_valid_jpeg, send,
    CountingCodec, TestDirs,
};

// =============================================================================
// Resizing
// =============================================================================

#[tokio::test]
async fn test_resize_success() {
    let dirs = TestDirs::new();
    let router = dirs.router();

    let response = get(&router, "/images/photos/cat.jpg?width=100").await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header(&response, "content-type"), Some("image/jpeg"));
    assert_eq!(header(&response, "x-resize-cache"), Some("miss"));
    assert_eq!(
        header(&response, "cache-control"),
        Some("public, max-age=3600")
    );
    assert_eq!(header(&response, "vary"), Some("width, height, quality"));
    assert!(header(&response, "etag").unwrap().starts_with('"'));
    assert!(header(&response, "last-modified").unwrap().ends_with("GMT"));

    let length: usize = header(&response, "content-length").unwrap().parse().unwrap();
    let body = body_bytes(response).await;
    assert_eq!(body.len(), length);
    assert!(is_valid_jpeg(&body));
    assert_eq!(image_dimensions(&body), (100, 50));
}

#[tokio::test]
async fn test_resize_fits_both_dimensions() {
    let dirs = TestDirs::new();
    let router = dirs.router();

    let response = get(&router, "/images/photos/cat.jpg?width=100&height=100").await;
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_bytes(response).await;
    assert_eq!(image_dimensions(&body), (100, 50));
}

#[tokio::test]
async fn test_resize_png_keeps_format() {
    let dirs = TestDirs::new();
    let router = dirs.router();

    let response = get(&router, "/images/photos/logo.png?height=16").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header(&response, "content-type"), Some("image/png"));

    let body = body_bytes(response).await;
    assert_eq!(image_dimensions(&body), (16, 16));
}

#[tokio::test]
async fn test_no_upscale_by_default() {
    let dirs = TestDirs::new();
    let router = dirs.router();

    let response = get(&router, "/images/photos/logo.png?width=1000").await;
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_bytes(response).await;
    assert_eq!(image_dimensions(&body), (64, 64));
}

#[tokio::test]
async fn test_second_request_is_a_hit() {
    let dirs = TestDirs::new();
    let codec = CountingCodec::new();
    let count = codec.counter();
    let router = dirs.router_with(codec, RouterConfig::default());

    let first = get(&router, "/images/photos/cat.jpg?width=120").await;
    let first_etag = header(&first, "etag").unwrap().to_string();
    let first_body = body_bytes(first).await;

    let second = get(&router, "/images/photos/cat.jpg?width=120").await;
    assert_eq!(second.status(), StatusCode::OK);
    assert_eq!(header(&second, "x-resize-cache"), Some("hit"));
    assert_eq!(header(&second, "etag"), Some(first_etag.as_str()));
    assert_eq!(header(&second, "content-type"), Some("image/jpeg"));
    assert_eq!(body_bytes(second).await, first_body);

    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_prefix_and_extension_are_case_insensitive() {
    let dirs = TestDirs::new();
    dirs.write_source("photos/UPPER.JPG", &create_test_jpeg(40, 40));
    let router = dirs.router();

    let response = get(&router, "/IMAGES/photos/UPPER.JPG?width=20").await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_percent_encoded_path() {
    let dirs = TestDirs::new();
    dirs.write_source("photos/my cat.jpg", &create_test_jpeg(40, 20));
    let router = dirs.router();

    let response = get(&router, "/images/photos/my%20cat.jpg?width=20").await;
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_bytes(response).await;
    assert_eq!(image_dimensions(&body), (20, 10));
}

// =============================================================================
// Originals
// =============================================================================

#[tokio::test]
async fn test_original_served_without_resize_params() {
    let dirs = TestDirs::new();
    let codec = CountingCodec::new();
    let count = codec.counter();
    let router = dirs.router_with(codec, RouterConfig::default());

    let response = get(&router, "/images/photos/cat.jpg").await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header(&response, "content-type"), Some("image/jpeg"));
    assert!(header(&response, "etag").is_some());
    assert!(header(&response, "x-resize-cache").is_none());

    let body = body_bytes(response).await;
    let original = std::fs::read(dirs.content.path().join("photos/cat.jpg")).unwrap();
    assert_eq!(body.as_ref(), original.as_slice());

    assert_eq!(count.load(Ordering::SeqCst), 0);
    assert!(dirs.cached_files().is_empty());
}

#[tokio::test]
async fn test_quality_alone_serves_original() {
    let dirs = TestDirs::new();
    let router = dirs.router();

    let response = get(&router, "/images/photos/cat.jpg?quality=50").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(header(&response, "x-resize-cache").is_none());
    assert!(dirs.cached_files().is_empty());
}

#[tokio::test]
async fn test_original_etag_differs_from_variant_etag() {
    let dirs = TestDirs::new();
    let router = dirs.router();

    let original = get(&router, "/images/photos/cat.jpg").await;
    let variant = get(&router, "/images/photos/cat.jpg?width=50").await;

    assert_ne!(header(&original, "etag"), header(&variant, "etag"));
}

#[tokio::test]
async fn test_head_request() {
    let dirs = TestDirs::new();
    let router = dirs.router();

    let response = send(
        &router,
        Request::builder()
            .method(Method::HEAD)
            .uri("/images/photos/cat.jpg?width=80"),
    )
    .await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header(&response, "content-type"), Some("image/jpeg"));
    let length: u64 = header(&response, "content-length").unwrap().parse().unwrap();
    assert!(length > 0);
    assert!(body_bytes(response).await.is_empty());

    // The variant was still rendered and stored.
    assert_eq!(dirs.cached_files().len(), 1);
}

// =============================================================================
// Conditional Requests
// =============================================================================

#[tokio::test]
async fn test_if_none_match_returns_304_without_rendering() {
    let dirs = TestDirs::new();
    let codec = CountingCodec::new();
    let count = codec.counter();
    let router = dirs.router_with(codec, RouterConfig::default());

    let first = get(&router, "/images/photos/cat.jpg?width=64").await;
    let etag = header(&first, "etag").unwrap().to_string();
    assert_eq!(count.load(Ordering::SeqCst), 1);

    let response = send(
        &router,
        Request::builder()
            .uri("/images/photos/cat.jpg?width=64")
            .header("if-none-match", &etag),
    )
    .await;

    assert_eq!(response.status(), StatusCode::NOT_MODIFIED);
    assert_eq!(header(&response, "etag"), Some(etag.as_str()));
    assert!(header(&response, "cache-control").is_some());
    assert!(body_bytes(response).await.is_empty());
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_if_none_match_mismatch_returns_200() {
    let dirs = TestDirs::new();
    let router = dirs.router();

    let response = send(
        &router,
        Request::builder()
            .uri("/images/photos/cat.jpg?width=64")
            .header("if-none-match", "\"stale\""),
    )
    .await;

    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_if_modified_since_returns_304() {
    let dirs = TestDirs::new();
    let router = dirs.router();

    let first = get(&router, "/images/photos/cat.jpg?width=64").await;
    let last_modified = header(&first, "last-modified").unwrap().to_string();

    let response = send(
        &router,
        Request::builder()
            .uri("/images/photos/cat.jpg?width=64")
            .header("if-modified-since", &last_modified),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_MODIFIED);

    let response = send(
        &router,
        Request::builder()
            .uri("/images/photos/cat.jpg")
            .header("if-modified-since", &last_modified),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_MODIFIED);
}

#[tokio::test]
async fn test_if_modified_since_in_the_past_returns_200() {
    let dirs = TestDirs::new();
    let router = dirs.router();

    let response = send(
        &router,
        Request::builder()
            .uri("/images/photos/cat.jpg?width=64")
            .header("if-modified-since", "Sun, 06 Nov 1994 08:49:37 GMT"),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_validators_can_be_disabled() {
    let dirs = TestDirs::new();
    let config = RouterConfig::default()
        .with_etag(false)
        .with_last_modified(false);
    let router = dirs.router_with(CountingCodec::new(), config);

    let response = send(
        &router,
        Request::builder()
            .uri("/images/photos/cat.jpg?width=64")
            .header("if-none-match", "*"),
    )
    .await;

    assert_eq!(response.status(), StatusCode::OK);
    assert!(header(&response, "etag").is_none());
    assert!(header(&response, "last-modified").is_none());
}

#[tokio::test]
async fn test_source_change_changes_etag() {
    let dirs = TestDirs::new();
    let router = dirs.router();

    let before = get(&router, "/images/photos/cat.jpg?width=64").await;
    let before_etag = header(&before, "etag").unwrap().to_string();

    dirs.write_source("photos/cat.jpg", &create_test_jpeg(300, 300));

    let after = get(&router, "/images/photos/cat.jpg?width=64").await;
    assert_eq!(header(&after, "x-resize-cache"), Some("miss"));
    assert_ne!(header(&after, "etag"), Some(before_etag.as_str()));
    assert_eq!(image_dimensions(&body_bytes(after).await), (64, 64));
}

// =============================================================================
// Error Handling
// =============================================================================

#[tokio::test]
async fn test_out_of_bounds_parameters_rejected() {
    let dirs = TestDirs::new();
    let router = dirs.router();

    for uri in [
        "/images/photos/cat.jpg?width=0",
        "/images/photos/cat.jpg?height=5000",
        "/images/photos/cat.jpg?width=10&quality=0",
        "/images/photos/cat.jpg?width=10&quality=101",
    ] {
        let response = get(&router, uri).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{}", uri);
        assert_eq!(
            header(&response, "content-type"),
            Some("text/plain; charset=utf-8")
        );
        let body = body_bytes(response).await;
        assert!(std::str::from_utf8(&body).unwrap().contains("must be between"));
    }

    assert!(dirs.cached_files().is_empty());
}

#[tokio::test]
async fn test_configured_bounds_apply() {
    let dirs = TestDirs::new();
    let config = RouterConfig::default().with_width_bounds(10, 200);
    let router = dirs.router_with(CountingCodec::new(), config);

    assert_eq!(
        get(&router, "/images/photos/cat.jpg?width=201").await.status(),
        StatusCode::BAD_REQUEST
    );
    assert_eq!(
        get(&router, "/images/photos/cat.jpg?width=200").await.status(),
        StatusCode::OK
    );
}

#[tokio::test]
async fn test_malformed_parameter_is_ignored() {
    let dirs = TestDirs::new();
    let router = dirs.router();

    let response = get(&router, "/images/photos/cat.jpg?width=abc").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(header(&response, "x-resize-cache").is_none());
}

#[tokio::test]
async fn test_missing_source_returns_404() {
    let dirs = TestDirs::new();
    let router = dirs.router();

    for uri in [
        "/images/photos/missing.jpg?width=10",
        "/images/photos/missing.jpg",
    ] {
        let response = get(&router, uri).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let body = body_bytes(response).await;
        let error: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(error["error"], "not_found");
        assert_eq!(error["status"], 404);
    }
}

#[tokio::test]
async fn test_path_traversal_forbidden() {
    let dirs = TestDirs::new();
    let router = dirs.router();

    let response = get(&router, "/images/..%2F..%2Fsecret.jpg?width=10").await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let body = body_bytes(response).await;
    let error: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(error["error"], "forbidden");
    assert_eq!(error["message"], "Access denied");
}

#[tokio::test]
async fn test_corrupt_source_returns_500() {
    let dirs = TestDirs::new();
    dirs.write_source("photos/broken.jpg", b"definitely not a jpeg");
    let router = dirs.router();

    let response = get(&router, "/images/photos/broken.jpg?width=10").await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

    let body = body_bytes(response).await;
    let error: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(error["error"], "codec_error");
    assert!(dirs.cached_files().is_empty());
}

// =============================================================================
// Pass-through
// =============================================================================

#[tokio::test]
async fn test_prefix_matches_whole_segment_only() {
    let dirs = TestDirs::new();
    let router = dirs.router();

    let response = get(&router, "/imageshack/photos/cat.jpg?width=10").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let body = body_bytes(response).await;
    let error: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(error["message"], "No such resource");
}

#[tokio::test]
async fn test_disallowed_extension_passes_through() {
    let dirs = TestDirs::new();
    dirs.write_source("photos/anim.gif", b"GIF89a");
    let router = dirs.router();

    let response = get(&router, "/images/photos/anim.gif?width=10").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert!(header(&response, "x-resize-cache").is_none());
}

#[tokio::test]
async fn test_other_methods_pass_through() {
    let dirs = TestDirs::new();
    let router = dirs.router();

    let response = send(
        &router,
        Request::builder()
            .method(Method::POST)
            .uri("/images/photos/cat.jpg?width=10"),
    )
    .await;

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert!(dirs.cached_files().is_empty());
}

#[tokio::test]
async fn test_custom_prefix() {
    let dirs = TestDirs::new();
    let config = RouterConfig::default().with_prefixes(vec!["media/img".to_string()]);
    let router = dirs.router_with(CountingCodec::new(), config);

    assert_eq!(
        get(&router, "/media/img/photos/cat.jpg?width=10").await.status(),
        StatusCode::OK
    );
    assert_eq!(
        get(&router, "/images/photos/cat.jpg?width=10").await.status(),
        StatusCode::NOT_FOUND
    );
}

// =============================================================================
// Health
// =============================================================================

#[tokio::test]
async fn test_health_reports_cache_usage() {
    let dirs = TestDirs::new();
    let router = dirs.router();

    let response = get(&router, "/health").await;
    assert_eq!(response.status(), StatusCode::OK);
    let health: serde_json::Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(health["status"], "healthy");
    assert_eq!(health["cache"]["entry_count"], 0);

    get(&router, "/images/photos/cat.jpg?width=30").await;

    let response = get(&router, "/health").await;
    let health: serde_json::Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(health["cache"]["entry_count"], 1);
    assert!(health["cache"]["total_bytes"].as_u64().unwrap() > 0);
}
