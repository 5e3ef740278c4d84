//! Single-flight integration tests.
//!
//! Concurrent requests for one variant must render it exactly once; requests
//! for different variants must not wait on each other.

use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use axum::http::StatusCode;

use image_resizer::RouterConfig;

use super::test_utils::{body_bytes, get, header, send, CountingCodec, TestDirs};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_requests_render_once() {
    let dirs = TestDirs::new();
    let codec = CountingCodec::new().with_delay(Duration::from_millis(150));
    let count = codec.counter();
    let router = dirs.router_with(codec, RouterConfig::default());

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let router = router.clone();
            tokio::spawn(async move {
                let response = get(&router, "/images/photos/cat.jpg?width=100").await;
                let status = response.status();
                let cache = header(&response, "x-resize-cache").map(str::to_string);
                let body = body_bytes(response).await;
                (status, cache, body)
            })
        })
        .collect();

    let mut misses = 0;
    let mut bodies = Vec::new();
    for handle in handles {
        let (status, cache, body) = handle.await.unwrap();
        assert_eq!(status, StatusCode::OK);
        if cache.as_deref() == Some("miss") {
            misses += 1;
        }
        bodies.push(body);
    }

    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert_eq!(misses, 1);
    assert!(bodies.windows(2).all(|pair| pair[0] == pair[1]));
    assert_eq!(dirs.cached_files().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_distinct_variants_render_in_parallel() {
    let dirs = TestDirs::new();
    let delay = Duration::from_millis(300);
    let codec = CountingCodec::new().with_delay(delay);
    let count = codec.counter();
    let router = dirs.router_with(codec, RouterConfig::default());

    let started = Instant::now();
    let handles: Vec<_> = [40, 60, 80, 100]
        .into_iter()
        .map(|width| {
            let router = router.clone();
            tokio::spawn(async move {
                get(&router, &format!("/images/photos/cat.jpg?width={}", width))
                    .await
                    .status()
            })
        })
        .collect();

    for handle in handles {
        assert_eq!(handle.await.unwrap(), StatusCode::OK);
    }

    assert_eq!(count.load(Ordering::SeqCst), 4);
    // Serialized renders would take at least four delays.
    assert!(started.elapsed() < delay * 4);
    assert_eq!(dirs.cached_files().len(), 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_revalidation_does_not_render() {
    let dirs = TestDirs::new();
    let codec = CountingCodec::new().with_delay(Duration::from_millis(500));
    let count = codec.counter();
    let router = dirs.router_with(codec, RouterConfig::default());

    let etag = {
        let response = get(&router, "/images/photos/cat.jpg?width=50").await;
        header(&response, "etag").unwrap().to_string()
    };
    assert_eq!(count.load(Ordering::SeqCst), 1);

    let started = Instant::now();
    let response = send(
        &router,
        axum::http::Request::builder()
            .uri("/images/photos/cat.jpg?width=50")
            .header("if-none-match", &etag),
    )
    .await;

    assert_eq!(response.status(), StatusCode::NOT_MODIFIED);
    assert!(started.elapsed() < Duration::from_millis(500));
    assert_eq!(count.load(Ordering::SeqCst), 1);
}
