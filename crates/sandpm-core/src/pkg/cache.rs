//! TTL-keyed store of raw fetched bytes.
//!
//! The store and the clock are injectable so tests can freeze or advance
//! time and inspect exactly what was cached. Two key namespaces share one
//! store: `metadata:{name}` (registry documents, expiring) and
//! `resolved:{name}` (resolved packages, never expiring).

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

/// Cache key for a package's registry metadata.
#[must_use]
pub fn metadata_key(name: &str) -> String {
    format!("metadata:{name}")
}

/// Cache key for a package's resolved record.
#[must_use]
pub fn resolved_key(name: &str) -> String {
    format!("resolved:{name}")
}

/// A cached payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub key: String,
    pub payload: Bytes,
    pub fetched_at: DateTime<Utc>,
    /// `None` means the entry never expires.
    pub expires_at: Option<DateTime<Utc>>,
}

impl CacheEntry {
    /// Whether the entry is past its expiry at `now`.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires| now >= expires)
    }
}

/// Backing storage for cache entries.
pub trait CacheStore: Send + Sync + fmt::Debug {
    /// Look up an entry regardless of expiry.
    fn get(&self, key: &str) -> Option<CacheEntry>;

    /// Insert or replace an entry.
    fn set(&self, entry: CacheEntry);

    /// Remove an entry. Returns whether it existed.
    fn invalidate(&self, key: &str) -> bool;

    /// Remove every entry.
    fn clear(&self);

    /// Snapshot of all entries.
    fn entries(&self) -> Vec<CacheEntry>;
}

/// Process-local [`CacheStore`].
#[derive(Debug, Default)]
pub struct MemoryCacheStore {
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl MemoryCacheStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl CacheStore for MemoryCacheStore {
    fn get(&self, key: &str) -> Option<CacheEntry> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.get(key).cloned()
    }

    fn set(&self, entry: CacheEntry) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.insert(entry.key.clone(), entry);
    }

    fn invalidate(&self, key: &str) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.remove(key).is_some()
    }

    fn clear(&self) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.clear();
    }

    fn entries(&self) -> Vec<CacheEntry> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.values().cloned().collect()
    }
}

/// Source of the current time.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: RwLock<DateTime<Utc>>,
}

impl ManualClock {
    #[must_use]
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: RwLock::new(start),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.write().unwrap_or_else(PoisonError::into_inner);
        *now = add_duration(*now, by).unwrap_or(DateTime::<Utc>::MAX_UTC);
    }

    /// Jump to an absolute time.
    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.write().unwrap_or_else(PoisonError::into_inner) = to;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(DateTime::<Utc>::UNIX_EPOCH)
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.read().unwrap_or_else(PoisonError::into_inner)
    }
}

fn add_duration(at: DateTime<Utc>, by: Duration) -> Option<DateTime<Utc>> {
    let delta = chrono::Duration::from_std(by).ok()?;
    at.checked_add_signed(delta)
}

/// Cache statistics.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    /// Total entries, expired ones included.
    pub entries: usize,
    /// Entries that are still fresh.
    pub valid_entries: usize,
    /// Total payload bytes.
    pub size: usize,
    /// `valid_entries / entries`, or 0 for an empty cache.
    ///
    /// This measures freshness of what is stored, not lookups. See `hits`
    /// and `misses` for real lookup counts.
    pub hit_rate: f64,
    /// Lookups answered from the cache.
    pub hits: u64,
    /// Lookups that found nothing fresh.
    pub misses: u64,
}

/// Shared TTL cache over a [`CacheStore`] and a [`Clock`].
///
/// Clones share the same store and counters.
#[derive(Debug, Clone)]
pub struct MetadataCache {
    store: Arc<dyn CacheStore>,
    clock: Arc<dyn Clock>,
    hits: Arc<AtomicU64>,
    misses: Arc<AtomicU64>,
}

impl Default for MetadataCache {
    fn default() -> Self {
        Self::new(Arc::new(MemoryCacheStore::new()), Arc::new(SystemClock))
    }
}

impl MetadataCache {
    #[must_use]
    pub fn new(store: Arc<dyn CacheStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            hits: Arc::new(AtomicU64::new(0)),
            misses: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Current time according to the cache's clock.
    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Return the payload for `key` if present and unexpired.
    ///
    /// Expired entries are evicted on the way out.
    #[must_use]
    pub fn get_fresh(&self, key: &str) -> Option<Bytes> {
        let now = self.clock.now();
        match self.store.get(key) {
            Some(entry) if !entry.is_expired(now) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.payload)
            }
            Some(_) => {
                self.store.invalidate(key);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Store a payload. `ttl = None` stores it without expiry.
    ///
    /// A TTL too large to represent is treated as no expiry.
    pub fn put(&self, key: impl Into<String>, payload: impl Into<Bytes>, ttl: Option<Duration>) {
        let now = self.clock.now();
        self.store.set(CacheEntry {
            key: key.into(),
            payload: payload.into(),
            fetched_at: now,
            expires_at: ttl.and_then(|ttl| add_duration(now, ttl)),
        });
    }

    /// Drop one entry.
    pub fn invalidate(&self, key: &str) -> bool {
        self.store.invalidate(key)
    }

    /// Drop every entry and reset the lookup counters.
    pub fn clear(&self) {
        self.store.clear();
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }

    /// Snapshot statistics.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn stats(&self) -> CacheStats {
        let now = self.clock.now();
        let entries = self.store.entries();
        let valid_entries = entries.iter().filter(|e| !e.is_expired(now)).count();
        let size = entries.iter().map(|e| e.payload.len()).sum();
        let hit_rate = if entries.is_empty() {
            0.0
        } else {
            valid_entries as f64 / entries.len() as f64
        };

        CacheStats {
            entries: entries.len(),
            valid_entries,
            size,
            hit_rate,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}
