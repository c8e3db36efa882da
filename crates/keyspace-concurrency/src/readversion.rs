//! Read-version caching (§4.D): avoids a GetReadVersion round trip for
//! reads that can tolerate some staleness.
//!
//! A cached version is only ever used to *pin* a transaction's initial
//! read snapshot — it never substitutes for the store's own commit
//! version, so a `Server`-policy caller always sees a transaction that
//! asked the store directly.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use keyspace_storage::KvStore;

/// How stale a cached read version may be before a request goes to the
/// store to refresh it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePolicy {
    /// Always ask the store for the current version.
    Server,
    /// Use whatever version is cached, however old.
    Cached,
    /// Use the cached version if it was refreshed within the last `n`.
    Stale(Duration),
}

#[derive(Debug, Clone, Copy)]
struct CachedVersion {
    version: u64,
    refreshed_at: Instant,
}

/// Caches the store's current commit version, refreshing it on demand
/// per [`CachePolicy`]. Shared across every session opened against one
/// container.
pub struct ReadVersionCache {
    cached: Mutex<Option<CachedVersion>>,
    refresh_count: AtomicU64,
}

impl Default for ReadVersionCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadVersionCache {
    pub fn new() -> Self {
        ReadVersionCache {
            cached: Mutex::new(None),
            refresh_count: AtomicU64::new(0),
        }
    }

    /// Resolve a read version per `policy`, refreshing from `store` when
    /// the policy demands it.
    pub fn get(&self, store: &dyn KvStore, policy: CachePolicy) -> u64 {
        match policy {
            CachePolicy::Server => self.refresh(store),
            CachePolicy::Cached => {
                let mut guard = self.cached.lock();
                match *guard {
                    Some(entry) => entry.version,
                    None => {
                        drop(guard);
                        self.refresh(store)
                    }
                }
            }
            CachePolicy::Stale(max_age) => {
                let guard = self.cached.lock();
                match *guard {
                    Some(entry) if entry.refreshed_at.elapsed() <= max_age => entry.version,
                    _ => {
                        drop(guard);
                        self.refresh(store)
                    }
                }
            }
        }
    }

    fn refresh(&self, store: &dyn KvStore) -> u64 {
        let version = store.current_version();
        self.update(version);
        version
    }

    /// Record a freshly observed commit version, e.g. right after a
    /// transaction commits, so subsequent `Cached`/`Stale` reads see it
    /// without another round trip.
    pub fn update(&self, version: u64) {
        *self.cached.lock() = Some(CachedVersion {
            version,
            refreshed_at: Instant::now(),
        });
        self.refresh_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn clear(&self) {
        *self.cached.lock() = None;
    }

    /// `(cached_version, times_refreshed)`, for diagnostics.
    pub fn info(&self) -> (Option<u64>, u64) {
        (
            self.cached.lock().map(|e| e.version),
            self.refresh_count.load(Ordering::Relaxed),
        )
    }
}
