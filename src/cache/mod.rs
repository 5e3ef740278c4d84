//! Variant cache building blocks.
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │                  ResizeService                   │
//! └─────┬──────────────────┬──────────────────┬──────┘
//!       │                  │                  │
//!       ▼                  ▼                  ▼
//! ┌───────────┐   ┌──────────────────┐   ┌───────────┐
//! │ derive_key│   │ ShardedFileStore │   │ KeyedLock │
//! │ (SHA-256) │   │ (atomic writes,  │   │ (one task │
//! │           │   │  LRU eviction)   │   │  per key) │
//! └───────────┘   └──────────────────┘   └───────────┘
//! ```
//!
//! - [`derive_key`]: deterministic key for (source path, options, signature)
//! - [`ShardedFileStore`]: maps keys to sharded paths and owns the files
//! - [`KeyedLock`]: collapses concurrent work on the same key

mod key;
mod lock;
mod store;

pub use key::{
    content_digest, derive_key, normalize_path, CacheKey, KeyOptions, SourceSignature,
    CACHE_KEY_LEN,
};
pub use lock::{KeyedLock, KeyedLockGuard, LockTimeout};
pub use store::{
    temp_path, PruneReport, ShardedFileStore, StoreConfig, StoreStats, DEFAULT_SHARD_DEPTH,
    MAX_SHARD_DEPTH, TEMP_SUFFIX,
};
