//! Sharded on-disk store for resized variants.
//!
//! Each variant lives at a path derived from its [`CacheKey`]. The leading
//! hex characters of the key are split into two-character directories so no
//! single directory grows unbounded:
//!
//! ```text
//! <root>/
//! └── 3f/                      <- key[0..2]
//!     └── a9/                  <- key[2..4]   (shard_depth = 2)
//!         ├── 01bc...e7.jpg    <- key[4..] + extension
//!         └── 77d0...42.png.tmp  <- in-flight write, never served
//! ```
//!
//! # Atomicity
//!
//! Writes go to `<name>.tmp` in the destination directory, are flushed and
//! `fsync`ed, then renamed over the final path. A reader therefore sees either
//! no file or the complete file. The whole sequence runs on the blocking pool,
//! so a request that is dropped mid-write never strands a temp file: the
//! blocking task either commits or cleans up after itself.
//!
//! # Eviction
//!
//! With a non-zero byte budget, [`ShardedFileStore::enforce_size_limit`] is
//! called before each write. When the tracked total plus the incoming size
//! exceeds the budget, the store rescans the tree and deletes entries in
//! least-recently-accessed order until the incoming entry fits. Temp files
//! are never eviction candidates.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use bytes::Bytes;
use filetime::FileTime;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::key::CacheKey;
use crate::error::StoreError;

/// Deepest supported directory sharding.
pub const MAX_SHARD_DEPTH: u8 = 4;

/// Suffix appended to in-flight writes.
pub const TEMP_SUFFIX: &str = ".tmp";

/// Default sharding depth.
pub const DEFAULT_SHARD_DEPTH: u8 = 2;

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for a [`ShardedFileStore`].
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Root directory of the cache tree
    pub root: PathBuf,

    /// Number of two-character directory levels (0 disables sharding)
    pub shard_depth: u8,

    /// Total byte budget (0 means unbounded)
    pub max_bytes: u64,
}

impl StoreConfig {
    /// Create a config with default sharding and no byte budget.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            shard_depth: DEFAULT_SHARD_DEPTH,
            max_bytes: 0,
        }
    }

    /// Set the sharding depth. Values above [`MAX_SHARD_DEPTH`] are clamped.
    pub fn with_shard_depth(mut self, depth: u8) -> Self {
        self.shard_depth = depth.min(MAX_SHARD_DEPTH);
        self
    }

    /// Set the total byte budget.
    pub fn with_max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = max_bytes;
        self
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Point-in-time usage of the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    /// Bytes held by committed entries
    pub total_bytes: u64,

    /// Number of committed entries
    pub entry_count: u64,

    /// Configured budget (0 means unbounded)
    pub max_bytes: u64,
}

/// Outcome of a startup prune.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneReport {
    /// Committed entries deleted
    pub removed_entries: usize,

    /// Orphaned temp files deleted
    pub removed_temp_files: usize,

    /// Files that could not be deleted
    pub failures: usize,
}

#[derive(Debug, Clone, Copy, Default)]
struct Usage {
    bytes: u64,
    entries: u64,
    /// Bytes reserved by `enforce_size_limit` for writes not yet committed
    reserved: u64,
}

struct ScannedEntry {
    path: PathBuf,
    size: u64,
    accessed: SystemTime,
}

#[derive(Default)]
struct Scan {
    entries: Vec<ScannedEntry>,
    temp_files: Vec<PathBuf>,
}

impl Scan {
    fn usage(&self) -> Usage {
        Usage {
            bytes: self.entries.iter().map(|e| e.size).sum(),
            entries: self.entries.len() as u64,
            reserved: 0,
        }
    }

    /// Entries ordered least-recently-accessed first.
    fn into_lru_order(mut self) -> Vec<ScannedEntry> {
        self.entries.sort_by_key(|e| e.accessed);
        self.entries
    }
}

// =============================================================================
// Sharded File Store
// =============================================================================

/// Atomic, size-bounded, folder-sharded file store.
///
/// The store exclusively owns the files under its root. Writes for one path
/// must be serialized by the caller (the resize orchestrator holds a keyed
/// lock around them); writes for distinct paths may run concurrently.
pub struct ShardedFileStore {
    config: StoreConfig,

    /// Tracked usage, `None` until the first scan. Also serves as the
    /// eviction lock: it is held for the whole scan-and-delete step.
    usage: Mutex<Option<Usage>>,
}

impl ShardedFileStore {
    /// Create a store. The root directory is created lazily on first write.
    pub fn new(config: StoreConfig) -> Self {
        let config = StoreConfig {
            shard_depth: config.shard_depth.min(MAX_SHARD_DEPTH),
            ..config
        };
        Self {
            config,
            usage: Mutex::new(None),
        }
    }

    /// The cache root directory.
    pub fn root(&self) -> &Path {
        &self.config.root
    }

    /// The configured byte budget (0 means unbounded).
    pub fn max_bytes(&self) -> u64 {
        self.config.max_bytes
    }

    /// Map a key to its on-disk location.
    ///
    /// `extension` may be given with or without a leading dot; it is
    /// lowercased. An empty extension yields a bare file name.
    pub fn path(&self, key: &CacheKey, extension: &str) -> PathBuf {
        let hex = key.as_str();
        let depth = usize::from(self.config.shard_depth).min(hex.len() / 2);

        let mut path = self.config.root.clone();
        for level in 0..depth {
            path.push(&hex[level * 2..level * 2 + 2]);
        }

        let rest = &hex[depth * 2..];
        let extension = extension.trim_start_matches('.');
        if extension.is_empty() {
            path.push(rest);
        } else {
            path.push(format!("{}.{}", rest, extension.to_ascii_lowercase()));
        }
        path
    }

    /// Whether a committed entry exists at `path`.
    ///
    /// Only a fast probe: callers that act on the answer re-check under the
    /// keyed lock.
    pub async fn exists(&self, path: &Path) -> bool {
        tokio::fs::metadata(path)
            .await
            .map(|m| m.is_file())
            .unwrap_or(false)
    }

    /// Read a committed entry.
    pub async fn read(&self, path: &Path) -> Result<Bytes, StoreError> {
        tokio::fs::read(path)
            .await
            .map(Bytes::from)
            .map_err(|source| StoreError::Read {
                path: path.to_path_buf(),
                source,
            })
    }

    /// Write `data` to `path` so that readers never observe a partial file.
    ///
    /// Missing shard directories are created. On any failure the temp file is
    /// removed before the error is returned. Whether it succeeds or fails, the
    /// write releases the room reserved for it by
    /// [`enforce_size_limit`](Self::enforce_size_limit).
    pub async fn write_atomically(&self, path: &Path, data: Bytes) -> Result<(), StoreError> {
        let target = path.to_path_buf();
        let len = data.len() as u64;

        let result = tokio::task::spawn_blocking(move || write_blocking(&target, &data))
            .await
            .map_err(|e| StoreError::Write {
                path: path.to_path_buf(),
                source: io::Error::other(e.to_string()),
            })
            .and_then(|result| result);

        let mut usage = self.usage.lock().await;
        if let Some(usage) = usage.as_mut() {
            usage.reserved = usage.reserved.saturating_sub(len);
            if let Ok(replaced) = &result {
                if let Some(old) = replaced {
                    usage.bytes = usage.bytes.saturating_sub(*old);
                    usage.entries = usage.entries.saturating_sub(1);
                }
                usage.bytes += len;
                usage.entries += 1;
            }
        }
        drop(usage);

        result?;
        debug!(path = %path.display(), bytes = len, "Committed cache entry");
        Ok(())
    }

    /// Make room for an entry of `incoming_bytes` and reserve it.
    ///
    /// The reservation counts against the budget until the matching
    /// [`write_atomically`](Self::write_atomically) finishes, so concurrent
    /// writers of different entries cannot all pass the check and overshoot
    /// it together. Returns the number of entries evicted. A budget of 0
    /// disables eviction and reservations.
    pub async fn enforce_size_limit(&self, incoming_bytes: u64) -> Result<usize, StoreError> {
        let max_bytes = self.config.max_bytes;
        if max_bytes == 0 {
            return Ok(0);
        }

        let mut usage = self.usage.lock().await;
        let current = match *usage {
            Some(current) => current,
            None => {
                let current = self.scan().await?.usage();
                *usage = Some(current);
                current
            }
        };

        let needed = current.reserved.saturating_add(incoming_bytes);
        if current.bytes.saturating_add(needed) <= max_bytes {
            *usage = Some(Usage {
                reserved: needed,
                ..current
            });
            return Ok(0);
        }

        let scan = self.scan().await?;
        let (remaining, evicted, freed) =
            tokio::task::spawn_blocking(move || evict_blocking(scan, max_bytes, needed))
                .await
                .map_err(|e| self.scan_error(io::Error::other(e.to_string())))?;

        *usage = Some(Usage {
            reserved: needed,
            ..remaining
        });

        if evicted > 0 {
            info!(
                evicted,
                freed_bytes = freed,
                remaining_bytes = remaining.bytes,
                max_bytes,
                "Evicted cache entries"
            );
        }
        Ok(evicted)
    }

    /// Delete the `batch` least-recently-accessed entries and every orphaned
    /// temp file.
    ///
    /// Intended to run once before the server starts accepting requests.
    /// Files that cannot be deleted are logged and skipped.
    pub async fn prune_on_startup(&self, batch: usize) -> Result<PruneReport, StoreError> {
        let mut usage = self.usage.lock().await;
        let scan = self.scan().await?;

        let report = tokio::task::spawn_blocking(move || {
            let mut report = PruneReport::default();

            for temp in &scan.temp_files {
                match fs::remove_file(temp) {
                    Ok(()) => report.removed_temp_files += 1,
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => {
                        warn!(path = %temp.display(), error = %e, "Failed to remove orphaned temp file");
                        report.failures += 1;
                    }
                }
            }

            for entry in scan.into_lru_order().into_iter().take(batch) {
                match fs::remove_file(&entry.path) {
                    Ok(()) => report.removed_entries += 1,
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => {
                        warn!(path = %entry.path.display(), error = %e, "Failed to prune cache entry");
                        report.failures += 1;
                    }
                }
            }

            report
        })
        .await
        .map_err(|e| self.scan_error(io::Error::other(e.to_string())))?;

        *usage = None;

        info!(
            removed_entries = report.removed_entries,
            removed_temp_files = report.removed_temp_files,
            failures = report.failures,
            "Pruned cache on startup"
        );
        Ok(report)
    }

    /// Mark an entry as just accessed so eviction keeps it.
    ///
    /// Access times are not reliably maintained by the filesystem (`noatime`,
    /// `relatime` mounts), so hits update them explicitly.
    pub async fn touch(&self, path: &Path) -> io::Result<()> {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || filetime::set_file_atime(&path, FileTime::now()))
            .await
            .map_err(|e| io::Error::other(e.to_string()))?
    }

    /// Current usage, scanning the tree if nothing is tracked yet.
    pub async fn stats(&self) -> Result<StoreStats, StoreError> {
        let mut usage = self.usage.lock().await;
        let current = match *usage {
            Some(current) => current,
            None => {
                let current = self.scan().await?.usage();
                *usage = Some(current);
                current
            }
        };

        Ok(StoreStats {
            total_bytes: current.bytes,
            entry_count: current.entries,
            max_bytes: self.config.max_bytes,
        })
    }

    async fn scan(&self) -> Result<Scan, StoreError> {
        let root = self.config.root.clone();
        tokio::task::spawn_blocking(move || scan_tree(&root))
            .await
            .map_err(|e| io::Error::other(e.to_string()))
            .and_then(|result| result)
            .map_err(|source| self.scan_error(source))
    }

    fn scan_error(&self, source: io::Error) -> StoreError {
        StoreError::Scan {
            path: self.config.root.clone(),
            source,
        }
    }
}

impl std::fmt::Debug for ShardedFileStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardedFileStore")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Blocking Helpers
// =============================================================================

/// Path of the temp file used while writing `path`.
pub fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(TEMP_SUFFIX);
    PathBuf::from(name)
}

fn is_temp_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.ends_with(TEMP_SUFFIX))
}

/// Removes the temp file on drop unless disarmed after a successful rename.
struct TempFileGuard {
    path: PathBuf,
    armed: bool,
}

impl TempFileGuard {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if self.armed {
            let _ = fs::remove_file(&self.path);
        }
    }
}

/// Returns the size of the entry that was replaced, if any.
fn write_blocking(path: &Path, data: &[u8]) -> Result<Option<u64>, StoreError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(|source| StoreError::CreateDir {
        path: parent.to_path_buf(),
        source,
    })?;

    let tmp = temp_path(path);
    let mut guard = TempFileGuard::new(tmp.clone());

    let write = |tmp: &Path| -> io::Result<()> {
        let mut file = fs::File::create(tmp)?;
        file.write_all(data)?;
        file.flush()?;
        file.sync_all()
    };
    write(&tmp).map_err(|source| StoreError::Write {
        path: tmp.clone(),
        source,
    })?;

    let replaced = fs::metadata(path)
        .ok()
        .filter(|m| m.is_file())
        .map(|m| m.len());

    fs::rename(&tmp, path).map_err(|source| StoreError::Commit {
        path: path.to_path_buf(),
        source,
    })?;
    guard.disarm();

    // Persist the rename itself. Not supported everywhere.
    if let Ok(dir) = fs::File::open(parent) {
        let _ = dir.sync_all();
    }

    Ok(replaced)
}

fn scan_tree(root: &Path) -> io::Result<Scan> {
    let mut scan = Scan::default();
    match walk(root, &mut scan) {
        Ok(()) => Ok(scan),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Scan::default()),
        Err(e) => Err(e),
    }
}

fn walk(dir: &Path, scan: &mut Scan) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let metadata = match entry.metadata() {
            Ok(metadata) => metadata,
            // Raced with a concurrent delete.
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        };

        if metadata.is_dir() {
            walk(&path, scan)?;
        } else if metadata.is_file() {
            if is_temp_file(&path) {
                scan.temp_files.push(path);
            } else {
                let accessed = metadata
                    .accessed()
                    .or_else(|_| metadata.modified())
                    .unwrap_or(SystemTime::UNIX_EPOCH);
                scan.entries.push(ScannedEntry {
                    path,
                    size: metadata.len(),
                    accessed,
                });
            }
        }
    }
    Ok(())
}

/// Delete entries oldest-first until `incoming` fits in `max_bytes`.
///
/// Returns the remaining usage, the number of evicted entries and the bytes
/// freed.
fn evict_blocking(scan: Scan, max_bytes: u64, incoming: u64) -> (Usage, usize, u64) {
    let mut usage = scan.usage();
    let mut evicted = 0;
    let mut freed = 0;

    for entry in scan.into_lru_order() {
        if usage.bytes.saturating_add(incoming) <= max_bytes {
            break;
        }

        match fs::remove_file(&entry.path) {
            Ok(()) => {
                evicted += 1;
                freed += entry.size;
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(path = %entry.path.display(), error = %e, "Failed to evict cache entry");
                continue;
            }
        }
        usage.bytes = usage.bytes.saturating_sub(entry.size);
        usage.entries = usage.entries.saturating_sub(1);
    }

    (usage, evicted, freed)
}

// =============================================================================
// Tests
// =============================================================================
