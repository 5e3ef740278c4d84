//! Resize orchestration.
//!
//! The ResizeService is the main entry point for variant requests. It ties
//! together path resolution, cache-key derivation, the keyed lock, the store
//! and the codec.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        ResizeService                            │
//! │  ┌─────────────────────────────────────────────────────────┐    │
//! │  │                  ensure_resized()                       │    │
//! │  │  1. Resolve source    5. Acquire keyed lock             │    │
//! │  │  2. Check is file     6. Re-check store                 │    │
//! │  │  3. Signature         7. Hit: touch, report             │    │
//! │  │  4. Key + cache path  8. Miss: resize, evict, write     │    │
//! │  └─────────────────────────────────────────────────────────┘    │
//! │         │                    │                    │             │
//! │         ▼                    ▼                    ▼             │
//! │  ┌────────────┐      ┌──────────────────┐   ┌──────────────┐    │
//! │  │ KeyedLock  │      │ ShardedFileStore │   │  ImageCodec  │    │
//! │  └────────────┘      └──────────────────┘   └──────────────┘    │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Steps 1-4 are exposed separately as [`ResizeService::plan`] so the HTTP
//! layer can answer conditional requests without taking the lock or touching
//! the codec.

use std::num::NonZeroUsize;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use lru::LruCache;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::cache::{
    content_digest, derive_key, CacheKey, KeyOptions, KeyedLock, KeyedLockGuard, ShardedFileStore,
    SourceSignature, StoreStats,
};
use crate::codec::{content_type_for_extension, ImageCodec, ImageInfo, ResizeParams};
use crate::error::{ResizeError, StoreError};

/// Default output quality when a request does not specify one.
pub const DEFAULT_QUALITY: u8 = 85;

/// Default upper bound on waiting for another request rendering the same
/// variant.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// Default number of variant dimensions remembered in memory.
const DEFAULT_DIMENSION_CACHE_ENTRIES: usize = 4096;

// =============================================================================
// Settings
// =============================================================================

/// Behavioural settings for a [`ResizeService`].
#[derive(Debug, Clone)]
pub struct ResizeSettings {
    /// Quality used when the request omits one
    pub default_quality: u8,

    /// Whether variants may be larger than their source
    pub allow_upscale: bool,

    /// Include a SHA-256 of the source bytes in the signature
    pub content_hashing: bool,

    /// Maximum wait for the keyed lock (`None` waits forever)
    pub lock_timeout: Option<Duration>,

    /// Capacity of the in-memory dimension memo
    pub dimension_cache_entries: usize,
}

impl Default for ResizeSettings {
    fn default() -> Self {
        Self {
            default_quality: DEFAULT_QUALITY,
            allow_upscale: false,
            content_hashing: false,
            lock_timeout: Some(DEFAULT_LOCK_TIMEOUT),
            dimension_cache_entries: DEFAULT_DIMENSION_CACHE_ENTRIES,
        }
    }
}

// =============================================================================
// Request / Response Types
// =============================================================================

/// A request for a resized variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResizeRequest {
    /// Source path relative to the content root
    pub source_id: String,

    /// Requested bounding width
    pub width: Option<u32>,

    /// Requested bounding height
    pub height: Option<u32>,

    /// Requested quality (configured default when absent)
    pub quality: Option<u8>,
}

impl ResizeRequest {
    /// Create a request with no resize options.
    pub fn new(source_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            width: None,
            height: None,
            quality: None,
        }
    }

    /// Set the bounding width.
    pub fn with_width(mut self, width: u32) -> Self {
        self.width = Some(width);
        self
    }

    /// Set the bounding height.
    pub fn with_height(mut self, height: u32) -> Self {
        self.height = Some(height);
        self
    }

    /// Set the output quality.
    pub fn with_quality(mut self, quality: u8) -> Self {
        self.quality = Some(quality);
        self
    }

    /// Whether this request asks for a resize at all.
    pub fn wants_resize(&self) -> bool {
        self.width.is_some() || self.height.is_some()
    }
}

/// A resolved source image.
#[derive(Debug, Clone)]
pub struct SourceFile {
    /// Canonical absolute path inside the content root
    pub path: PathBuf,

    /// Size in bytes
    pub size: u64,

    /// Last modification time
    pub modified: SystemTime,

    /// Revision marker used in cache keys
    pub signature: SourceSignature,

    /// MIME type inferred from the file extension
    pub content_type: &'static str,
}

/// Everything needed to serve or render a variant, computed without locking.
#[derive(Debug, Clone)]
pub struct ResizePlan {
    /// The request this plan was built from
    pub request: ResizeRequest,

    /// The resolved source
    pub source: SourceFile,

    /// Options after applying configured defaults
    pub options: KeyOptions,

    /// Cache key for this variant
    pub key: CacheKey,

    /// Location of the variant in the store
    pub cache_path: PathBuf,
}

/// Result of [`ResizeService::ensure_resized`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResizeOutcome {
    /// Path of the committed variant
    pub path: PathBuf,

    /// MIME type of the variant
    pub content_type: &'static str,

    /// Variant width in pixels (0 if it could not be determined on a hit)
    pub width: u32,

    /// Variant height in pixels (0 if it could not be determined on a hit)
    pub height: u32,

    /// Variant size in bytes
    pub size: u64,

    /// Variant bytes, read while the entry was known to exist
    pub data: Bytes,

    /// Whether the variant already existed
    pub cache_hit: bool,
}

// =============================================================================
// Resize Service
// =============================================================================

/// Service for rendering and caching resized variants.
///
/// # Type Parameters
///
/// * `C` - The codec used on cache misses
///
/// # Example
///
/// ```ignore
/// use image_resizer::resize::{ResizeRequest, ResizeService, ResizeSettings};
/// use image_resizer::cache::{ShardedFileStore, StoreConfig};
/// use image_resizer::codec::ImageCrateCodec;
///
/// let store = ShardedFileStore::new(StoreConfig::new("/var/cache/resizer"));
/// let service = ResizeService::new("/srv/images", store, ImageCrateCodec::new(), ResizeSettings::default());
///
/// let request = ResizeRequest::new("photos/cat.jpg").with_width(800);
/// let outcome = service.ensure_resized(&request).await?;
///
/// println!("{} ({}x{}, hit: {})", outcome.path.display(), outcome.width, outcome.height, outcome.cache_hit);
/// ```
pub struct ResizeService<C: ImageCodec> {
    /// Canonical content root; every source must resolve inside it
    content_root: PathBuf,

    store: Arc<ShardedFileStore>,

    /// One holder per cache path
    locks: Arc<KeyedLock<PathBuf>>,

    codec: Arc<C>,

    settings: ResizeSettings,

    /// Variant dimensions, so hits do not need to re-read headers
    dimensions: Mutex<LruCache<PathBuf, ImageInfo>>,
}

impl<C: ImageCodec> ResizeService<C> {
    /// Create a service.
    ///
    /// The content root is canonicalized once here; if that fails (the root
    /// does not exist yet) it is used as given.
    pub fn new(
        content_root: impl Into<PathBuf>,
        store: ShardedFileStore,
        codec: C,
        settings: ResizeSettings,
    ) -> Self {
        Self::with_shared(content_root, Arc::new(store), Arc::new(codec), settings)
    }

    /// Create a service from shared store and codec handles.
    pub fn with_shared(
        content_root: impl Into<PathBuf>,
        store: Arc<ShardedFileStore>,
        codec: Arc<C>,
        settings: ResizeSettings,
    ) -> Self {
        let content_root = content_root.into();
        let content_root = std::fs::canonicalize(&content_root).unwrap_or(content_root);
        let capacity =
            NonZeroUsize::new(settings.dimension_cache_entries).unwrap_or(NonZeroUsize::MIN);

        Self {
            content_root,
            store,
            locks: Arc::new(KeyedLock::new()),
            codec,
            settings,
            dimensions: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Use an externally owned lock set.
    pub fn with_lock(mut self, locks: Arc<KeyedLock<PathBuf>>) -> Self {
        self.locks = locks;
        self
    }

    /// The canonical content root.
    pub fn content_root(&self) -> &Path {
        &self.content_root
    }

    /// The variant store.
    pub fn store(&self) -> &Arc<ShardedFileStore> {
        &self.store
    }

    /// The keyed lock guarding variant rendering.
    pub fn locks(&self) -> &Arc<KeyedLock<PathBuf>> {
        &self.locks
    }

    /// The active settings.
    pub fn settings(&self) -> &ResizeSettings {
        &self.settings
    }

    /// Resolve a source and make sure its variant exists in the store.
    ///
    /// At most one caller renders a given variant at a time; everyone else
    /// waits on the keyed lock and then finds the committed file.
    ///
    /// # Errors
    ///
    /// - `SecurityViolation` if the path leaves the content root
    /// - `NotFound` if the source is missing or not a regular file
    /// - `Codec` if the codec fails (not retried)
    /// - `CacheIo`, `SourceIo` or `LockTimeout` otherwise
    pub async fn ensure_resized(&self, request: &ResizeRequest) -> Result<ResizeOutcome, ResizeError> {
        let plan = self.plan(request).await?;
        self.ensure_planned(&plan).await
    }

    /// Resolve the source and compute the variant location without rendering.
    pub async fn plan(&self, request: &ResizeRequest) -> Result<ResizePlan, ResizeError> {
        let source = self.resolve_original(&request.source_id).await?;

        let options = KeyOptions {
            width: request.width,
            height: request.height,
            quality: request.quality.unwrap_or(self.settings.default_quality),
            allow_upscale: self.settings.allow_upscale,
        };
        let key = derive_key(&source.path, &options, &source.signature);
        let cache_path = self.store.path(&key, &extension_of(&source.path));

        Ok(ResizePlan {
            request: request.clone(),
            source,
            options,
            key,
            cache_path,
        })
    }

    /// Make sure the planned variant exists, rendering it if needed.
    pub async fn ensure_planned(&self, plan: &ResizePlan) -> Result<ResizeOutcome, ResizeError> {
        let guard = match self.settings.lock_timeout {
            Some(timeout) => self
                .locks
                .acquire_timeout(plan.cache_path.clone(), timeout)
                .await
                .map_err(|_| ResizeError::LockTimeout {
                    path: plan.cache_path.clone(),
                })?,
            None => self.locks.acquire(plan.cache_path.clone()).await,
        };

        // Another request may have committed the variant while we waited.
        if self.store.exists(&plan.cache_path).await {
            if let Some(outcome) = self.cache_hit(plan).await? {
                return Ok(outcome);
            }
        }

        self.render(plan, guard).await
    }

    /// Resolve `source_id` to a regular file inside the content root.
    pub async fn resolve_original(&self, source_id: &str) -> Result<SourceFile, ResizeError> {
        let path = self.resolve(source_id).await?;

        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|e| self.source_error(source_id, &path, e))?;
        if !metadata.is_file() {
            return Err(ResizeError::NotFound {
                source_id: source_id.to_string(),
            });
        }

        let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        let mut signature = SourceSignature::from_metadata(modified, metadata.len());
        if self.settings.content_hashing {
            signature = signature.with_content_hash(&self.hash_source(&path).await?);
        }

        Ok(SourceFile {
            content_type: content_type_for_extension(&extension_of(&path)),
            path,
            size: metadata.len(),
            modified,
            signature,
        })
    }

    /// Read a resolved source's bytes.
    pub async fn read_source(&self, source: &SourceFile) -> Result<Bytes, ResizeError> {
        tokio::fs::read(&source.path)
            .await
            .map(Bytes::from)
            .map_err(|error| ResizeError::SourceIo {
                path: source.path.clone(),
                error,
            })
    }

    /// Store usage statistics.
    pub async fn cache_stats(&self) -> Result<StoreStats, ResizeError> {
        Ok(self.store.stats().await?)
    }

    /// Join `source_id` onto the content root and verify containment.
    async fn resolve(&self, source_id: &str) -> Result<PathBuf, ResizeError> {
        let violation = || ResizeError::SecurityViolation {
            source_id: source_id.to_string(),
        };

        let mut relative = PathBuf::new();
        for component in Path::new(source_id).components() {
            match component {
                Component::Normal(part) => relative.push(part),
                Component::CurDir | Component::RootDir => {}
                Component::ParentDir => {
                    if !relative.pop() {
                        return Err(violation());
                    }
                }
                Component::Prefix(_) => return Err(violation()),
            }
        }
        if relative.as_os_str().is_empty() {
            return Err(ResizeError::NotFound {
                source_id: source_id.to_string(),
            });
        }

        let joined = self.content_root.join(&relative);
        let canonical = tokio::fs::canonicalize(&joined)
            .await
            .map_err(|e| self.source_error(source_id, &joined, e))?;

        // Symlinks may point anywhere.
        if !canonical.starts_with(&self.content_root) {
            return Err(violation());
        }

        Ok(canonical)
    }

    async fn hash_source(&self, path: &Path) -> Result<String, ResizeError> {
        let owned = path.to_path_buf();
        tokio::task::spawn_blocking(move || std::fs::read(&owned).map(|data| content_digest(&data)))
            .await
            .map_err(|e| std::io::Error::other(e.to_string()))
            .and_then(|result| result)
            .map_err(|error| ResizeError::SourceIo {
                path: path.to_path_buf(),
                error,
            })
    }

    /// Serve a committed variant, or `None` if it was evicted after the
    /// existence check.
    ///
    /// Eviction does not take the keyed lock, so the entry can disappear at
    /// any point; the bytes are read here and carried in the outcome.
    async fn cache_hit(&self, plan: &ResizePlan) -> Result<Option<ResizeOutcome>, ResizeError> {
        let data = match self.store.read(&plan.cache_path).await {
            Ok(data) => data,
            Err(StoreError::Read { source, .. }) if source.kind() == std::io::ErrorKind::NotFound => {
                debug!(key = %plan.key, "Variant evicted before it could be read, rendering");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        if let Err(e) = self.store.touch(&plan.cache_path).await {
            debug!(path = %plan.cache_path.display(), error = %e, "Failed to update access time");
        }

        let info = self.variant_info(&plan.cache_path).await;

        debug!(
            source = %plan.request.source_id,
            key = %plan.key,
            width = info.width,
            height = info.height,
            "Variant cache hit"
        );

        Ok(Some(ResizeOutcome {
            path: plan.cache_path.clone(),
            content_type: info.content_type,
            width: info.width,
            height: info.height,
            size: data.len() as u64,
            data,
            cache_hit: true,
        }))
    }

    /// Render a missing variant and commit it.
    ///
    /// The commit runs in its own task that owns `guard`. If the caller is
    /// cancelled mid-write, the key stays held until the file is either
    /// renamed into place or removed, so no second writer can start on the
    /// same path in the meantime.
    async fn render(
        &self,
        plan: &ResizePlan,
        guard: KeyedLockGuard<PathBuf>,
    ) -> Result<ResizeOutcome, ResizeError> {
        let source = self.read_source(&plan.source).await?;

        let params = ResizeParams {
            width: plan.options.width,
            height: plan.options.height,
            quality: plan.options.quality,
            allow_upscale: plan.options.allow_upscale,
        };
        let encoded = self
            .codec
            .resize(source, params)
            .await
            .map_err(|error| ResizeError::Codec {
                source_id: plan.request.source_id.clone(),
                error,
            })?;

        let size = encoded.data.len() as u64;
        let commit = {
            let store = Arc::clone(&self.store);
            let path = plan.cache_path.clone();
            let data = encoded.data.clone();
            tokio::spawn(async move {
                let _guard = guard;
                store.enforce_size_limit(size).await?;
                store.write_atomically(&path, data).await
            })
        };
        commit.await.map_err(|e| StoreError::Write {
            path: plan.cache_path.clone(),
            source: std::io::Error::other(e.to_string()),
        })??;

        self.dimensions.lock().await.put(
            plan.cache_path.clone(),
            ImageInfo {
                width: encoded.width,
                height: encoded.height,
                content_type: encoded.content_type,
            },
        );

        debug!(
            source = %plan.request.source_id,
            key = %plan.key,
            width = encoded.width,
            height = encoded.height,
            bytes = size,
            "Variant cache miss, rendered"
        );

        Ok(ResizeOutcome {
            path: plan.cache_path.clone(),
            content_type: encoded.content_type,
            width: encoded.width,
            height: encoded.height,
            size,
            data: encoded.data,
            cache_hit: false,
        })
    }

    /// Dimensions of a committed variant, from the memo or its header.
    async fn variant_info(&self, path: &Path) -> ImageInfo {
        if let Some(info) = self.dimensions.lock().await.get(path) {
            return info.clone();
        }

        match self.codec.probe_path(path).await {
            Ok(info) => {
                self.dimensions
                    .lock()
                    .await
                    .put(path.to_path_buf(), info.clone());
                info
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read cached variant dimensions");
                ImageInfo {
                    width: 0,
                    height: 0,
                    content_type: content_type_for_extension(&extension_of(path)),
                }
            }
        }
    }

    fn source_error(&self, source_id: &str, path: &Path, error: std::io::Error) -> ResizeError {
        if error.kind() == std::io::ErrorKind::NotFound {
            ResizeError::NotFound {
                source_id: source_id.to_string(),
            }
        } else {
            ResizeError::SourceIo {
                path: path.to_path_buf(),
                error,
            }
        }
    }
}

fn extension_of(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default()
}

// =============================================================================
// Tests
// =============================================================================
