//! Bounded LRU cache with per-entry TTL
//!
//! Expired entries are never returned. They are dropped lazily when a
//! lookup finds them, when an insert needs room, or by
//! [`Cache::purge_expired`].
//!
//! Recency is tracked with a logical access counter alongside the access
//! timestamp. Every `get` hit and every `set` bumps the counter, so two
//! entries can never tie and eviction order is exactly access order.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Cache sizing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of entries
    pub capacity: usize,
    /// TTL applied by [`Cache::set_default`]
    pub default_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            default_ttl_secs: 300,
        }
    }
}

impl CacheConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }
}

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    /// `None` when the TTL reaches past what `Instant` can represent
    expires_at: Option<Instant>,
    last_accessed_at: Instant,
    access_seq: u64,
}

impl<V> CacheEntry<V> {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|expires_at| expires_at > now)
    }
}

/// Point-in-time cache counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub sets: u64,
    pub size: usize,
    pub capacity: usize,
}

impl CacheStats {
    /// Hits over lookups, 0.0 before the first lookup
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            0.0
        } else {
            self.hits as f64 / lookups as f64
        }
    }
}

struct CacheInner<K, V> {
    entries: HashMap<K, CacheEntry<V>>,
    next_seq: u64,
    stats: CacheStats,
}

impl<K: Eq + Hash + Clone, V> CacheInner<K, V> {
    fn touch(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    fn purge_expired(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.is_live(now));
        let removed = before - self.entries.len();
        self.stats.expirations += removed as u64;
        removed
    }

    fn evict_lru(&mut self) -> Option<K> {
        let victim = self
            .entries
            .iter()
            .min_by_key(|(_, entry)| (entry.last_accessed_at, entry.access_seq))
            .map(|(key, _)| key.clone())?;
        self.entries.remove(&victim);
        self.stats.evictions += 1;
        Some(victim)
    }
}

/// Thread-safe LRU + TTL cache
pub struct Cache<K, V> {
    inner: Mutex<CacheInner<K, V>>,
    capacity: usize,
    default_ttl: Duration,
}

impl<K, V> Cache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// A capacity of zero is raised to one
    pub fn new(config: &CacheConfig) -> Self {
        Self::with_capacity(config.capacity, config.default_ttl())
    }

    pub fn with_capacity(capacity: usize, default_ttl: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(CacheInner {
                entries: HashMap::with_capacity(capacity.min(1024)),
                next_seq: 0,
                stats: CacheStats {
                    capacity,
                    ..Default::default()
                },
            }),
            capacity,
            default_ttl,
        }
    }

    /// Live value for `key`, refreshing its recency
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let seq = inner.touch();

        let live = inner.entries.get(key).map(|entry| entry.is_live(now));
        match live {
            Some(true) => {
                inner.stats.hits += 1;
                let entry = inner.entries.get_mut(key)?;
                entry.last_accessed_at = now;
                entry.access_seq = seq;
                Some(entry.value.clone())
            }
            Some(false) => {
                inner.entries.remove(key);
                inner.stats.expirations += 1;
                inner.stats.misses += 1;
                None
            }
            None => {
                inner.stats.misses += 1;
                None
            }
        }
    }

    /// Insert or replace `key`, evicting the least recently used entry when
    /// a new key arrives at capacity
    pub fn set(&self, key: K, value: V, ttl: Duration) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let seq = inner.touch();
        inner.stats.sets += 1;

        if !inner.entries.contains_key(&key) && inner.entries.len() >= self.capacity {
            // Expired entries go first; they can never be hits again
            if inner.purge_expired(now) == 0 {
                if inner.evict_lru().is_some() {
                    debug!(capacity = self.capacity, "cache evicted least recently used entry");
                }
            }
        }

        inner.entries.insert(
            key,
            CacheEntry {
                value,
                expires_at: now.checked_add(ttl),
                last_accessed_at: now,
                access_seq: seq,
            },
        );
    }

    /// Cached value for `key`, or the output of `compute` stored under `ttl`
    ///
    /// The lock is not held while `compute` runs, so concurrent misses on the
    /// same key may each compute; the last one stored wins. Errors are
    /// returned as-is and never cached.
    pub async fn get_or_try_insert_with<Q, F, E>(
        &self,
        key: &Q,
        ttl: Duration,
        compute: F,
    ) -> Result<V, E>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ToOwned<Owned = K> + ?Sized,
        F: Future<Output = Result<V, E>>,
    {
        if let Some(value) = self.get(key) {
            return Ok(value);
        }
        let value = compute.await?;
        self.set(key.to_owned(), value.clone(), ttl);
        Ok(value)
    }

    /// [`set`](Self::set) with the configured default TTL
    pub fn set_default(&self, key: K, value: V) {
        self.set(key, value, self.default_ttl);
    }

    /// Remove `key` whether live or expired; `true` if something was removed
    pub fn invalidate<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.inner.lock().entries.remove(key).is_some()
    }

    /// Whether a live entry exists; does not refresh recency
    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let now = Instant::now();
        self.inner
            .lock()
            .entries
            .get(key)
            .is_some_and(|entry| entry.is_live(now))
    }

    /// Drop every expired entry, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        self.inner.lock().purge_expired(Instant::now())
    }

    pub fn clear(&self) {
        self.inner.lock().entries.clear();
    }

    /// Stored entries, expired ones not yet purged included
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            size: inner.entries.len(),
            ..inner.stats.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(60);

    #[tokio::test(start_paused = true)]
    async fn test_lru_eviction_by_access_not_insertion() {
        let cache: Cache<&str, u32> = Cache::with_capacity(2, TTL);
        cache.set("a", 1, TTL);
        cache.set("b", 2, TTL);

        // Touch "a" so "b" becomes least recently used
        assert_eq!(cache.get("a"), Some(1));
        cache.set("c", 3, TTL);

        assert!(cache.contains_key("a"));
        assert!(!cache.contains_key("b"));
        assert!(cache.contains_key("c"));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_untouched_oldest_is_evicted() {
        let cache: Cache<&str, u32> = Cache::with_capacity(2, TTL);
        cache.set("a", 1, TTL);
        cache.set("b", 2, TTL);
        cache.set("c", 3, TTL);

        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.get("b"), Some(2));
        assert_eq!(cache.get("c"), Some(3));
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_replacing_key_does_not_evict() {
        let cache: Cache<&str, u32> = Cache::with_capacity(2, TTL);
        cache.set("a", 1, TTL);
        cache.set("b", 2, TTL);
        cache.set("a", 10, TTL);

        assert_eq!(cache.get("a"), Some(10));
        assert_eq!(cache.get("b"), Some(2));
        assert_eq!(cache.stats().evictions, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entry_is_a_miss() {
        let cache: Cache<String, u32> = Cache::with_capacity(10, TTL);
        cache.set("k".to_string(), 1, Duration::from_secs(5));

        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(cache.get("k"), Some(1));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(cache.get("k"), None);
        // Removed lazily by the lookup
        assert_eq!(cache.len(), 0);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.expirations, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_at_capacity_prefers_expired_entries() {
        let cache: Cache<&str, u32> = Cache::with_capacity(2, TTL);
        cache.set("short", 1, Duration::from_secs(1));
        cache.set("long", 2, TTL);
        tokio::time::advance(Duration::from_secs(2)).await;

        cache.set("new", 3, TTL);
        assert!(cache.contains_key("long"));
        assert!(cache.contains_key("new"));
        assert_eq!(cache.stats().evictions, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_invalidate_and_clear() {
        let cache: Cache<&str, u32> = Cache::with_capacity(10, TTL);
        cache.set("a", 1, Duration::from_secs(1));
        cache.set("b", 2, Duration::from_secs(1));
        cache.set_default("c", 3);
        tokio::time::advance(Duration::from_secs(2)).await;

        assert_eq!(cache.purge_expired(), 2);
        assert!(cache.invalidate("c"));
        assert!(!cache.invalidate("c"));

        cache.set_default("d", 4);
        cache.clear();
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrepresentable_ttl_never_expires() {
        let cache: Cache<&str, u32> = Cache::with_capacity(4, TTL);
        cache.set("forever", 1, Duration::MAX);

        tokio::time::advance(Duration::from_secs(365 * 24 * 3600)).await;
        assert_eq!(cache.get("forever"), Some(1));
        assert_eq!(cache.purge_expired(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_or_try_insert_with_computes_once() {
        let cache: Cache<String, u32> = Cache::with_capacity(4, TTL);
        let runs = std::sync::atomic::AtomicU32::new(0);
        let compute = || {
            let runs = &runs;
            async move {
                runs.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Ok::<_, String>(42)
            }
        };

        assert_eq!(cache.get_or_try_insert_with("answer", TTL, compute()).await, Ok(42));
        assert_eq!(cache.get_or_try_insert_with("answer", TTL, compute()).await, Ok(42));
        assert_eq!(runs.load(std::sync::atomic::Ordering::SeqCst), 1);

        // Recomputed once the entry expires
        tokio::time::advance(TTL).await;
        assert_eq!(cache.get_or_try_insert_with("answer", TTL, compute()).await, Ok(42));
        assert_eq!(runs.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_or_try_insert_with_does_not_cache_errors() {
        let cache: Cache<String, u32> = Cache::with_capacity(4, TTL);

        let failed = cache
            .get_or_try_insert_with("k", TTL, async { Err::<u32, _>("upstream down") })
            .await;
        assert_eq!(failed, Err("upstream down"));
        assert!(!cache.contains_key("k"));

        let ok = cache
            .get_or_try_insert_with("k", TTL, async { Ok::<_, &str>(7) })
            .await;
        assert_eq!(ok, Ok(7));
        assert_eq!(cache.get("k"), Some(7));
    }

    #[test]
    fn test_zero_capacity_is_raised() {
        let cache: Cache<u32, u32> = Cache::new(&CacheConfig {
            capacity: 0,
            default_ttl_secs: 1,
        });
        assert_eq!(cache.capacity(), 1);
    }

    #[test]
    fn test_hit_rate() {
        let stats = CacheStats {
            hits: 3,
            misses: 1,
            ..Default::default()
        };
        assert_eq!(stats.hit_rate(), 0.75);
        assert_eq!(CacheStats::default().hit_rate(), 0.0);
    }
}
