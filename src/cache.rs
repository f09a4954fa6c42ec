//! Response cache: TTL-aware and size-bounded with LRU eviction.
//!
//! Expiry is enforced lazily on read. Writes never push the cache past
//! `max_size`; when a new key arrives at capacity the least recently accessed
//! entry goes first.

use lru::LruCache;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

use crate::types::instant_after;

/// Configuration for the response cache.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of cached responses.
    pub max_size: usize,
    /// TTL applied when the caller does not supply one, in milliseconds.
    #[serde(with = "crate::serde_millis")]
    pub default_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: 100,
            default_ttl: Duration::from_secs(5 * 60),
        }
    }
}

impl CacheConfig {
    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }
}

#[derive(Debug)]
struct CacheEntry {
    value: Value,
    inserted_at: Instant,
    expires_at: Instant,
    last_access_at: Instant,
    access_count: u64,
}

/// Read-only view of one entry's bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryInfo {
    pub inserted_at: Instant,
    pub expires_at: Instant,
    pub last_access_at: Instant,
    pub access_count: u64,
}

/// Cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub sets: u64,
    pub size: usize,
    pub max_size: usize,
    pub hit_rate: f64,
}

#[derive(Debug)]
struct CacheInner {
    // Recency order of the LruCache mirrors `last_access_at`.
    entries: LruCache<String, CacheEntry>,
    hits: u64,
    misses: u64,
    evictions: u64,
    sets: u64,
}

#[derive(Debug)]
pub struct CacheService {
    max_size: NonZeroUsize,
    inner: Mutex<CacheInner>,
}

impl CacheService {
    pub fn new(config: CacheConfig) -> Self {
        let max_size = NonZeroUsize::new(config.max_size).unwrap_or(NonZeroUsize::MIN);
        Self {
            max_size,
            inner: Mutex::new(CacheInner {
                entries: LruCache::new(max_size),
                hits: 0,
                misses: 0,
                evictions: 0,
                sets: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Look up `key`. Expired entries are removed and reported as a miss.
    pub fn get(&self, key: &str) -> Option<Value> {
        let now = Instant::now();
        let mut guard = self.lock();
        let inner = &mut *guard;

        let expired = match inner.entries.peek(key) {
            Some(entry) => now >= entry.expires_at,
            None => {
                inner.misses += 1;
                return None;
            }
        };

        if expired {
            inner.entries.pop(key);
            inner.misses += 1;
            tracing::debug!(key, "cache entry expired");
            return None;
        }

        let entry = inner.entries.get_mut(key)?;
        entry.last_access_at = now;
        entry.access_count += 1;
        inner.hits += 1;
        Some(entry.value.clone())
    }

    /// Store `value` under `key` for `ttl`.
    pub fn set(&self, key: impl Into<String>, value: Value, ttl: Duration) {
        let key = key.into();
        let now = Instant::now();
        let mut guard = self.lock();
        let inner = &mut *guard;

        if !inner.entries.contains(&key) && inner.entries.len() >= self.max_size.get() {
            if let Some((evicted, _)) = inner.entries.pop_lru() {
                inner.evictions += 1;
                tracing::debug!(key = %evicted, "evicted least recently used cache entry");
            }
        }

        inner.entries.put(
            key,
            CacheEntry {
                value,
                inserted_at: now,
                expires_at: instant_after(now, ttl),
                last_access_at: now,
                access_count: 0,
            },
        );
        inner.sets += 1;
    }

    /// Whether `key` holds a live entry. Does not touch recency or counters.
    pub fn contains_key(&self, key: &str) -> bool {
        let now = Instant::now();
        self.lock()
            .entries
            .peek(key)
            .is_some_and(|entry| now < entry.expires_at)
    }

    /// Bookkeeping for `key`, without touching recency or counters.
    pub fn entry_info(&self, key: &str) -> Option<EntryInfo> {
        self.lock().entries.peek(key).map(|entry| EntryInfo {
            inserted_at: entry.inserted_at,
            expires_at: entry.expires_at,
            last_access_at: entry.last_access_at,
            access_count: entry.access_count,
        })
    }

    pub fn remove(&self, key: &str) -> bool {
        self.lock().entries.pop(key).is_some()
    }

    /// Remove every expired entry. Returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.lock();
        let expired: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, entry)| now >= entry.expires_at)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            inner.entries.pop(key);
        }
        expired.len()
    }

    /// Number of stored entries, including expired ones not yet read.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.lock();
        let lookups = inner.hits + inner.misses;
        CacheStats {
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
            sets: inner.sets,
            size: inner.entries.len(),
            max_size: self.max_size.get(),
            hit_rate: if lookups == 0 {
                0.0
            } else {
                inner.hits as f64 / lookups as f64
            },
        }
    }

    /// Drop every entry and zero the counters.
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.entries.clear();
        inner.hits = 0;
        inner.misses = 0;
        inner.evictions = 0;
        inner.sets = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const TTL: Duration = Duration::from_millis(1000);

    fn cache(max_size: usize) -> CacheService {
        CacheService::new(CacheConfig::default().with_max_size(max_size))
    }

    #[tokio::test(start_paused = true)]
    async fn set_then_get_returns_value() {
        let cache = cache(10);
        cache.set("k", json!({"temp": 21.5}), TTL);
        assert_eq!(cache.get("k"), Some(json!({"temp": 21.5})));

        let info = cache.entry_info("k").unwrap();
        assert_eq!(info.access_count, 1);
        assert_eq!(info.expires_at, info.inserted_at + TTL);
    }

    #[tokio::test(start_paused = true)]
    async fn unbounded_ttl_is_clamped() {
        let cache = cache(10);
        cache.set("k", json!("forever"), Duration::MAX);
        tokio::time::advance(Duration::from_secs(3600)).await;
        assert_eq!(cache.get("k"), Some(json!("forever")));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entry_is_a_miss_and_removed() {
        let cache = cache(10);
        cache.set("k", json!(1), TTL);
        tokio::time::advance(Duration::from_millis(999)).await;
        assert!(cache.get("k").is_some());

        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(cache.len(), 1);
        assert!(cache.get("k").is_none());
        assert_eq!(cache.len(), 0);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn evicts_least_recently_accessed() {
        let cache = cache(3);
        cache.set("a", json!("a"), TTL);
        tokio::time::advance(Duration::from_millis(1)).await;
        cache.set("b", json!("b"), TTL);
        tokio::time::advance(Duration::from_millis(1)).await;
        cache.set("c", json!("c"), TTL);
        tokio::time::advance(Duration::from_millis(1)).await;

        // Touch "a" so "b" becomes the oldest access.
        assert!(cache.get("a").is_some());
        cache.set("d", json!("d"), TTL);

        assert_eq!(cache.len(), 3);
        assert!(!cache.contains_key("b"));
        assert!(cache.contains_key("a"));
        assert!(cache.contains_key("c"));
        assert!(cache.contains_key("d"));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn ties_fall_back_to_insertion_order() {
        let cache = cache(2);
        cache.set("first", json!(1), TTL);
        cache.set("second", json!(2), TTL);
        cache.set("third", json!(3), TTL);

        assert!(!cache.contains_key("first"));
        assert!(cache.contains_key("second"));
        assert!(cache.contains_key("third"));
    }

    #[test]
    fn overwriting_existing_key_does_not_evict() {
        let cache = cache(2);
        cache.set("a", json!(1), TTL);
        cache.set("b", json!(2), TTL);
        cache.set("a", json!(3), TTL);

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.stats().evictions, 0);
        assert_eq!(cache.get("a"), Some(json!(3)));
        assert_eq!(cache.get("b"), Some(json!(2)));
    }

    #[test]
    fn hit_rate_counts_lookups() {
        let cache = cache(4);
        assert_eq!(cache.stats().hit_rate, 0.0);

        cache.set("k", json!(true), TTL);
        cache.get("k");
        cache.get("k");
        cache.get("k");
        cache.get("missing");

        let stats = cache.stats();
        assert_eq!(stats.sets, 1);
        assert_eq!(stats.hit_rate, 0.75);
        assert_eq!(stats.max_size, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn purge_expired_removes_only_stale_entries() {
        let cache = cache(10);
        cache.set("short", json!(1), Duration::from_millis(100));
        cache.set("long", json!(2), Duration::from_millis(5000));
        tokio::time::advance(Duration::from_millis(200)).await;

        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.len(), 1);
        assert!(cache.contains_key("long"));
    }

    #[test]
    fn clear_drops_entries_and_counters() {
        let cache = cache(4);
        cache.set("k", json!(1), TTL);
        cache.get("k");
        cache.clear();

        assert!(cache.is_empty());
        let stats = cache.stats();
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.sets, 0);
    }

    #[test]
    fn zero_max_size_still_holds_one_entry() {
        let cache = cache(0);
        cache.set("a", json!(1), TTL);
        cache.set("b", json!(2), TTL);
        assert_eq!(cache.len(), 1);
        assert!(cache.contains_key("b"));
    }
}
