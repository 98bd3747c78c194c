//! Execution lock cache for at-most-one in-flight execution.
//!
//! Every step execution is guarded by a lock keyed on
//! `(step kind, correlation id, attempt)`. The cache guarantees:
//!
//! - **Mutual exclusion**: A second acquisition of a held key reports the
//!   current holder instead of succeeding
//! - **TTL expiry**: An abandoned lock (worker death) expires and can be
//!   taken over, bounding staleness
//! - **Guaranteed release**: [`LockGuard`] releases on every exit path,
//!   including panics, via its `Drop` implementation
//!
//! The trait is intentionally synchronous: lock operations are quick
//! metadata updates, and a synchronous surface lets the guard release in
//! `Drop` without an executor. A shared-cache implementation sits behind the
//! same trait in production deployments.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::{Error, Result};

/// Default lock TTL (12 hours).
///
/// Long enough to outlive any conversion operation; short enough that a
/// crashed worker's lock does not orphan work forever.
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(12 * 60 * 60);

/// Identity of one lockable unit of work.
///
/// The attempt counter is part of the key so that a retry of a failed step
/// never contends with a stale lock from the original attempt.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockKey {
    /// The step kind label (e.g. `convert_gpkg`).
    pub step_kind: String,
    /// The step's correlation id.
    pub correlation_id: String,
    /// Attempt number (1-indexed).
    pub attempt: u32,
}

impl LockKey {
    /// Creates a new lock key.
    #[must_use]
    pub fn new(step_kind: impl Into<String>, correlation_id: impl Into<String>, attempt: u32) -> Self {
        Self {
            step_kind: step_kind.into(),
            correlation_id: correlation_id.into(),
            attempt,
        }
    }

    /// Returns the canonical cache key string.
    #[must_use]
    pub fn canonical_string(&self) -> String {
        format!("{}:{}:{}", self.step_kind, self.correlation_id, self.attempt)
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.canonical_string())
    }
}

/// Result of a lock acquisition attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireResult {
    /// The lock was acquired by this owner.
    Acquired,
    /// The lock is held by another owner; the dispatch should be requeued.
    Held {
        /// Identifier of the current holder.
        holder: String,
    },
}

impl AcquireResult {
    /// Returns true if the lock was acquired.
    #[must_use]
    pub const fn is_acquired(&self) -> bool {
        matches!(self, Self::Acquired)
    }
}

/// Lock cache abstraction.
///
/// All methods are `Send + Sync` so the cache can be shared across worker
/// tasks behind an `Arc`.
pub trait LockCache: Send + Sync {
    /// Attempts to acquire the lock for `key` on behalf of `owner`.
    ///
    /// Acquiring a key already held by the same owner refreshes the TTL and
    /// succeeds (re-entrant for the holder). An expired lock is taken over.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache itself fails.
    fn try_acquire(&self, key: &LockKey, owner: &str, ttl: Duration) -> Result<AcquireResult>;

    /// Releases the lock if held by `owner`.
    ///
    /// Returns `true` if the lock was released, `false` if it was not held
    /// by this owner (already expired or taken over).
    ///
    /// # Errors
    ///
    /// Returns an error if the cache itself fails.
    fn release(&self, key: &LockKey, owner: &str) -> Result<bool>;

    /// Returns true if the key is currently held and unexpired.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache itself fails.
    fn is_locked(&self, key: &LockKey) -> Result<bool>;
}

#[derive(Debug, Clone)]
struct LockEntry {
    owner: String,
    expires_at: DateTime<Utc>,
}

impl LockEntry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Converts a lock poison error to a storage error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("lock cache poisoned")
}

/// In-memory lock cache.
///
/// Suitable for tests and single-node deployments; state is lost when the
/// process exits, which is acceptable because every entry carries a TTL.
#[derive(Debug, Default)]
pub struct InMemoryLockCache {
    entries: RwLock<HashMap<String, LockEntry>>,
}

impl InMemoryLockCache {
    /// Creates a new empty lock cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of live (unexpired) locks.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache lock is poisoned.
    pub fn live_count(&self) -> Result<usize> {
        let now = Utc::now();
        let entries = self.entries.read().map_err(poison_err)?;
        Ok(entries.values().filter(|e| !e.is_expired(now)).count())
    }
}

impl LockCache for InMemoryLockCache {
    fn try_acquire(&self, key: &LockKey, owner: &str, ttl: Duration) -> Result<AcquireResult> {
        let now = Utc::now();
        let expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        let mut entries = self.entries.write().map_err(poison_err)?;
        let cache_key = key.canonical_string();

        if let Some(existing) = entries.get(&cache_key) {
            if !existing.is_expired(now) && existing.owner != owner {
                return Ok(AcquireResult::Held {
                    holder: existing.owner.clone(),
                });
            }
        }

        entries.insert(
            cache_key,
            LockEntry {
                owner: owner.to_string(),
                expires_at,
            },
        );
        drop(entries);

        Ok(AcquireResult::Acquired)
    }

    fn release(&self, key: &LockKey, owner: &str) -> Result<bool> {
        let mut entries = self.entries.write().map_err(poison_err)?;
        let cache_key = key.canonical_string();

        match entries.get(&cache_key) {
            Some(entry) if entry.owner == owner => {
                entries.remove(&cache_key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn is_locked(&self, key: &LockKey) -> Result<bool> {
        let now = Utc::now();
        let entries = self.entries.read().map_err(poison_err)?;
        Ok(entries
            .get(&key.canonical_string())
            .is_some_and(|e| !e.is_expired(now)))
    }
}

/// RAII guard for a held lock.
///
/// The lock is released when `release` is called or when the guard is
/// dropped, whichever comes first. This is the scoped-acquisition
/// discipline: no exit path, panic included, leaves the lock held past the
/// guard's lifetime.
pub struct LockGuard {
    cache: Arc<dyn LockCache>,
    key: LockKey,
    owner: String,
    released: bool,
}

impl LockGuard {
    /// Creates a guard for a lock that has already been acquired.
    #[must_use]
    pub fn new(cache: Arc<dyn LockCache>, key: LockKey, owner: impl Into<String>) -> Self {
        Self {
            cache,
            key,
            owner: owner.into(),
            released: false,
        }
    }

    /// Returns the guarded key.
    #[must_use]
    pub fn key(&self) -> &LockKey {
        &self.key
    }

    /// Explicitly releases the lock.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache fails; the guard is consumed either way.
    pub fn release(mut self) -> Result<bool> {
        self.released = true;
        self.cache.release(&self.key, &self.owner)
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = self.cache.release(&self.key, &self.owner) {
                tracing::warn!(key = %self.key, error = %e, "failed to release lock on drop");
            }
        }
    }
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard")
            .field("key", &self.key)
            .field("owner", &self.owner)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> LockKey {
        LockKey::new("convert_gpkg", "01ARZ3NDEKTSV4RRFFQ69G5FAV", 1)
    }

    #[test]
    fn acquire_then_conflict() {
        let cache = InMemoryLockCache::new();

        let first = cache.try_acquire(&key(), "worker-a", DEFAULT_LOCK_TTL).unwrap();
        assert!(first.is_acquired());

        let second = cache.try_acquire(&key(), "worker-b", DEFAULT_LOCK_TTL).unwrap();
        assert_eq!(
            second,
            AcquireResult::Held {
                holder: "worker-a".to_string()
            }
        );
    }

    #[test]
    fn exactly_one_of_two_concurrent_acquires_wins() {
        let cache = Arc::new(InMemoryLockCache::new());
        let barrier = Arc::new(std::sync::Barrier::new(2));

        let handles: Vec<_> = ["worker-a", "worker-b"]
            .into_iter()
            .map(|owner| {
                let cache = Arc::clone(&cache);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    cache.try_acquire(&key(), owner, DEFAULT_LOCK_TTL).unwrap()
                })
            })
            .collect();

        let results: Vec<AcquireResult> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();
        let acquired = results.iter().filter(|r| r.is_acquired()).count();
        assert_eq!(acquired, 1, "exactly one acquire must succeed: {results:?}");
    }

    #[test]
    fn same_owner_reacquires() {
        let cache = InMemoryLockCache::new();

        assert!(cache
            .try_acquire(&key(), "worker-a", DEFAULT_LOCK_TTL)
            .unwrap()
            .is_acquired());
        assert!(cache
            .try_acquire(&key(), "worker-a", DEFAULT_LOCK_TTL)
            .unwrap()
            .is_acquired());
    }

    #[test]
    fn expired_lock_is_taken_over() {
        let cache = InMemoryLockCache::new();

        assert!(cache
            .try_acquire(&key(), "worker-a", Duration::ZERO)
            .unwrap()
            .is_acquired());

        // TTL of zero: immediately expired, so another owner can take it.
        let second = cache.try_acquire(&key(), "worker-b", DEFAULT_LOCK_TTL).unwrap();
        assert!(second.is_acquired());
    }

    #[test]
    fn release_requires_owner() {
        let cache = InMemoryLockCache::new();
        cache
            .try_acquire(&key(), "worker-a", DEFAULT_LOCK_TTL)
            .unwrap();

        assert!(!cache.release(&key(), "worker-b").unwrap());
        assert!(cache.is_locked(&key()).unwrap());

        assert!(cache.release(&key(), "worker-a").unwrap());
        assert!(!cache.is_locked(&key()).unwrap());
    }

    #[test]
    fn guard_releases_on_drop() {
        let cache: Arc<dyn LockCache> = Arc::new(InMemoryLockCache::new());
        cache
            .try_acquire(&key(), "worker-a", DEFAULT_LOCK_TTL)
            .unwrap();

        {
            let _guard = LockGuard::new(Arc::clone(&cache), key(), "worker-a");
        }

        assert!(!cache.is_locked(&key()).unwrap());
    }

    #[test]
    fn guard_releases_on_panic() {
        let cache: Arc<dyn LockCache> = Arc::new(InMemoryLockCache::new());
        cache
            .try_acquire(&key(), "worker-a", DEFAULT_LOCK_TTL)
            .unwrap();

        let cache_clone = Arc::clone(&cache);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _guard = LockGuard::new(cache_clone, key(), "worker-a");
            panic!("step execution blew up");
        }));
        assert!(result.is_err());

        assert!(!cache.is_locked(&key()).unwrap());
    }

    #[test]
    fn attempt_is_part_of_the_key() {
        let cache = InMemoryLockCache::new();
        let retry = LockKey::new("convert_gpkg", "01ARZ3NDEKTSV4RRFFQ69G5FAV", 2);

        assert!(cache
            .try_acquire(&key(), "worker-a", DEFAULT_LOCK_TTL)
            .unwrap()
            .is_acquired());
        assert!(cache
            .try_acquire(&retry, "worker-b", DEFAULT_LOCK_TTL)
            .unwrap()
            .is_acquired());
    }
}
