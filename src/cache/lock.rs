//! Per-key async mutual exclusion.
//!
//! [`KeyedLock`] hands out one async mutex per key on demand. Entries are
//! reference counted under a single structural mutex: every in-progress
//! `acquire` and every live guard holds one reference, and the entry is
//! removed from the map when the last reference goes away. The map therefore
//! only ever contains keys that are currently held or waited on.
//!
//! The structural mutex is a `std::sync::Mutex` that is only taken for map
//! lookups and reference count updates, never across an `.await`. This lets
//! release happen in `Drop`, which covers normal returns, `?` early exits,
//! panics, and futures dropped mid-wait (request cancellation).
//!
//! # Example
//!
//! ```
//! use image_resizer::cache::KeyedLock;
//!
//! #[tokio::main]
//! async fn main() {
//!     let locks = KeyedLock::new();
//!
//!     let guard = locks.acquire("variant-a".to_string()).await;
//!     assert_eq!(locks.len(), 1);
//!
//!     drop(guard);
//!     assert!(locks.is_empty());
//! }
//! ```

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Returned by [`KeyedLock::acquire_timeout`] when the wait expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockTimeout;

impl fmt::Display for LockTimeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("timed out waiting for keyed lock")
    }
}

impl std::error::Error for LockTimeout {}

/// Bookkeeping for one key.
struct Entry {
    mutex: Arc<AsyncMutex<()>>,
    /// Number of live tickets (waiters plus the holder)
    refs: usize,
}

type EntryMap<K> = Arc<Mutex<HashMap<K, Entry>>>;

/// A set of async mutexes addressed by key.
///
/// Guards share ownership of the entry map, so they are `'static` whenever
/// the key is, and can be moved into spawned tasks that must finish before
/// the key is released.
pub struct KeyedLock<K> {
    entries: EntryMap<K>,
}

impl<K> KeyedLock<K>
where
    K: Eq + Hash + Clone,
{
    /// Create an empty lock set.
    pub fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Wait until no other guard exists for `key`, then take it.
    ///
    /// Guards for different keys never block each other.
    pub async fn acquire(&self, key: K) -> KeyedLockGuard<K> {
        let (ticket, mutex) = self.register(key);
        let guard = mutex.lock_owned().await;

        KeyedLockGuard {
            _guard: guard,
            _ticket: ticket,
        }
    }

    /// Like [`acquire`](Self::acquire), giving up after `timeout`.
    pub async fn acquire_timeout(
        &self,
        key: K,
        timeout: Duration,
    ) -> Result<KeyedLockGuard<K>, LockTimeout> {
        tokio::time::timeout(timeout, self.acquire(key))
            .await
            .map_err(|_| LockTimeout)
    }

    /// Number of keys currently held or waited on.
    pub fn len(&self) -> usize {
        lock_map(&self.entries).len()
    }

    /// Returns `true` when no key is held or waited on.
    pub fn is_empty(&self) -> bool {
        lock_map(&self.entries).is_empty()
    }

    fn register(&self, key: K) -> (Ticket<K>, Arc<AsyncMutex<()>>) {
        let mut entries = lock_map(&self.entries);
        let entry = entries.entry(key.clone()).or_insert_with(|| Entry {
            mutex: Arc::new(AsyncMutex::new(())),
            refs: 0,
        });
        entry.refs += 1;
        let mutex = Arc::clone(&entry.mutex);

        let ticket = Ticket {
            entries: Arc::clone(&self.entries),
            key,
        };
        (ticket, mutex)
    }
}

fn lock_map<K>(entries: &Mutex<HashMap<K, Entry>>) -> MutexGuard<'_, HashMap<K, Entry>> {
    // The map is consistent after every critical section, so a poisoned
    // lock is still safe to use.
    entries.lock().unwrap_or_else(|e| e.into_inner())
}

impl<K> Default for KeyedLock<K>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> fmt::Debug for KeyedLock<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let len = self
            .entries
            .lock()
            .map(|entries| entries.len())
            .unwrap_or_default();
        f.debug_struct("KeyedLock").field("keys", &len).finish()
    }
}

/// One reference to a map entry, released on drop.
struct Ticket<K>
where
    K: Eq + Hash + Clone,
{
    entries: EntryMap<K>,
    key: K,
}

impl<K> Drop for Ticket<K>
where
    K: Eq + Hash + Clone,
{
    fn drop(&mut self) {
        let mut entries = lock_map(&self.entries);
        if let Some(entry) = entries.get_mut(&self.key) {
            entry.refs -= 1;
            if entry.refs == 0 {
                entries.remove(&self.key);
            }
        }
    }
}

/// Exclusive hold on one key. Dropping it releases the key.
#[must_use = "the key is released as soon as the guard is dropped"]
pub struct KeyedLockGuard<K>
where
    K: Eq + Hash + Clone,
{
    // Field order matters: the mutex guard is dropped before the ticket, so a
    // waiter never observes a removed entry while still queued on its mutex.
    _guard: OwnedMutexGuard<()>,
    _ticket: Ticket<K>,
}

impl<K> KeyedLockGuard<K>
where
    K: Eq + Hash + Clone,
{
    /// Release the key explicitly.
    pub fn release(self) {
        drop(self);
    }
}

// =============================================================================
// Tests
// =============================================================================
