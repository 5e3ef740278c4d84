//! Variant cache integration tests.
//!
//! These tests verify:
//! - Variants land in the sharded layout under the key the ETag exposes
//! - Cached variants survive a restart
//! - Least-recently-used eviction under a byte budget
//! - Startup pruning

use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::time::{Duration, SystemTime};

use axum::http::StatusCode;
use filetime::FileTime;

use image_resizer::{RouterConfig, ShardedFileStore};

use super::test_utils::{
    body_bytes, get, header, image_dimensions, CountingCodec, FixedSizeCodec, TestDirs,
};

/// The cache key carried in a response's ETag.
fn etag_key(response: &axum::http::Response<axum::body::Body>) -> String {
    header(response, "etag")
        .expect("variant responses carry an ETag")
        .trim_matches('"')
        .to_string()
}

/// The committed file for `key` under a depth-2 layout, if present.
fn cached_file(dirs: &TestDirs, key: &str) -> Option<PathBuf> {
    dirs.cached_files()
        .into_iter()
        .find(|p| p.file_stem().and_then(|s| s.to_str()) == Some(&key[4..]))
}

fn set_atime(path: &Path, seconds: i64) {
    filetime::set_file_atime(path, FileTime::from_unix_time(seconds, 0)).unwrap();
}

// =============================================================================
// Layout
// =============================================================================

#[tokio::test]
async fn test_variant_stored_under_sharded_key() {
    let dirs = TestDirs::new();
    let router = dirs.router();

    let response = get(&router, "/images/photos/cat.jpg?width=90").await;
    assert_eq!(response.status(), StatusCode::OK);
    let key = etag_key(&response);
    assert_eq!(key.len(), 64);

    let files = dirs.cached_files();
    assert_eq!(files.len(), 1);

    let relative = files[0].strip_prefix(dirs.cache.path()).unwrap();
    let expected = PathBuf::from(&key[0..2])
        .join(&key[2..4])
        .join(format!("{}.jpg", &key[4..]));
    assert_eq!(relative, expected);
}

#[tokio::test]
async fn test_unsharded_layout() {
    let dirs = TestDirs::new();
    let service = dirs.service(CountingCodec::new(), dirs.store_config().with_shard_depth(0));
    let router = image_resizer::create_router(service, RouterConfig::default());

    let response = get(&router, "/images/photos/logo.png?width=8").await;
    let key = etag_key(&response);

    assert_eq!(
        dirs.cached_files(),
        vec![dirs.cache.path().join(format!("{}.png", key))]
    );
}

#[tokio::test]
async fn test_distinct_options_get_distinct_entries() {
    let dirs = TestDirs::new();
    let router = dirs.router();

    for uri in [
        "/images/photos/cat.jpg?width=50",
        "/images/photos/cat.jpg?height=50",
        "/images/photos/cat.jpg?width=50&quality=40",
        "/images/photos/cat.jpg?width=50&quality=85",
    ] {
        assert_eq!(get(&router, uri).await.status(), StatusCode::OK);
    }

    // quality=85 is the default, so it shares the first entry.
    assert_eq!(dirs.cached_files().len(), 3);
}

#[tokio::test]
async fn test_no_temp_files_left_behind() {
    let dirs = TestDirs::new();
    let router = dirs.router();

    for width in [10, 20, 30] {
        get(&router, &format!("/images/photos/cat.jpg?width={}", width)).await;
    }

    let temps = dirs
        .cached_files()
        .into_iter()
        .filter(|p| p.to_string_lossy().ends_with(".tmp"))
        .count();
    assert_eq!(temps, 0);
}

// =============================================================================
// Restart
// =============================================================================

#[tokio::test]
async fn test_cache_survives_restart() {
    let dirs = TestDirs::new();

    let first = dirs.router();
    let response = get(&first, "/images/photos/cat.jpg?width=100").await;
    let etag = header(&response, "etag").unwrap().to_string();
    drop(first);

    let codec = CountingCodec::new();
    let count = codec.counter();
    let second = dirs.router_with(codec, RouterConfig::default());

    let response = get(&second, "/images/photos/cat.jpg?width=100").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header(&response, "x-resize-cache"), Some("hit"));
    assert_eq!(header(&response, "etag"), Some(etag.as_str()));
    assert_eq!(header(&response, "content-type"), Some("image/jpeg"));
    assert_eq!(image_dimensions(&body_bytes(response).await), (100, 50));
    assert_eq!(count.load(Ordering::SeqCst), 0);
}

// =============================================================================
// Eviction
// =============================================================================

#[tokio::test]
async fn test_eviction_removes_least_recently_used() {
    let dirs = TestDirs::new();
    let store = dirs.store_config().with_max_bytes(250);
    let service = dirs.service(FixedSizeCodec::new(100), store);
    let router = image_resizer::create_router(service, RouterConfig::default());

    let a = etag_key(&get(&router, "/images/photos/cat.jpg?width=10").await);
    let b = etag_key(&get(&router, "/images/photos/cat.jpg?width=20").await);

    // A was used more recently than B.
    set_atime(&cached_file(&dirs, &a).unwrap(), 2_000);
    set_atime(&cached_file(&dirs, &b).unwrap(), 1_000);

    let c = etag_key(&get(&router, "/images/photos/cat.jpg?width=30").await);

    assert!(cached_file(&dirs, &a).is_some());
    assert!(cached_file(&dirs, &b).is_none());
    assert!(cached_file(&dirs, &c).is_some());
    assert_eq!(dirs.cached_files().len(), 2);
}

#[tokio::test]
async fn test_evicted_variant_is_rendered_again() {
    let dirs = TestDirs::new();
    let store = dirs.store_config().with_max_bytes(150);
    let service = dirs.service(FixedSizeCodec::new(100), store);
    let router = image_resizer::create_router(service, RouterConfig::default());

    get(&router, "/images/photos/cat.jpg?width=10").await;
    get(&router, "/images/photos/cat.jpg?width=20").await;
    assert_eq!(dirs.cached_files().len(), 1);

    let response = get(&router, "/images/photos/cat.jpg?width=10").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header(&response, "x-resize-cache"), Some("miss"));
    assert_eq!(body_bytes(response).await.len(), 100);
}

#[tokio::test]
async fn test_hit_refreshes_access_time() {
    let dirs = TestDirs::new();
    let service = dirs.service(FixedSizeCodec::new(10), dirs.store_config());
    let router = image_resizer::create_router(service, RouterConfig::default());

    let key = etag_key(&get(&router, "/images/photos/cat.jpg?width=10").await);
    let path = cached_file(&dirs, &key).unwrap();
    set_atime(&path, 1_000);

    let response = get(&router, "/images/photos/cat.jpg?width=10").await;
    assert_eq!(header(&response, "x-resize-cache"), Some("hit"));

    let accessed = std::fs::metadata(&path).unwrap().accessed().unwrap();
    assert!(accessed > SystemTime::now() - Duration::from_secs(3600));
}

#[tokio::test]
async fn test_unbounded_cache_never_evicts() {
    let dirs = TestDirs::new();
    let service = dirs.service(FixedSizeCodec::new(1_000), dirs.store_config());
    let router = image_resizer::create_router(service, RouterConfig::default());

    for width in 1..=5 {
        get(&router, &format!("/images/photos/cat.jpg?width={}", width)).await;
    }

    assert_eq!(dirs.cached_files().len(), 5);
}

// =============================================================================
// Startup Prune
// =============================================================================

#[tokio::test]
async fn test_prune_before_serving() {
    let dirs = TestDirs::new();
    let service = dirs.service(FixedSizeCodec::new(10), dirs.store_config());
    let router = image_resizer::create_router(service, RouterConfig::default());

    let old = etag_key(&get(&router, "/images/photos/cat.jpg?width=10").await);
    let recent = etag_key(&get(&router, "/images/photos/cat.jpg?width=20").await);
    let old_path = cached_file(&dirs, &old).unwrap();
    set_atime(&old_path, 1_000);
    set_atime(&cached_file(&dirs, &recent).unwrap(), 2_000);

    // Leftover from a crashed write.
    let orphan = PathBuf::from(format!("{}.tmp", old_path.display()));
    std::fs::write(&orphan, b"partial").unwrap();

    let store = ShardedFileStore::new(dirs.store_config());
    let report = store.prune_on_startup(1).await.unwrap();

    assert_eq!(report.removed_entries, 1);
    assert_eq!(report.removed_temp_files, 1);
    assert!(!old_path.exists());
    assert!(!orphan.exists());
    assert!(cached_file(&dirs, &recent).is_some());

    let stats = store.stats().await.unwrap();
    assert_eq!(stats.entry_count, 1);
    assert_eq!(stats.total_bytes, 10);
}
