//! In-process L1 cache: bounded LRU with per-entry absolute expiry.
//!
//! Values are always serialized payloads; the cache never holds live
//! objects or pending computations. A background sweeper removes expired
//! entries every 60 seconds; LRU eviction kicks in on size pressure.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Clone)]
struct CacheItem {
    value: String,
    created_at: Instant,
    expires_at: Option<Instant>,
    last_accessed: Instant,
    access_count: u64,
    /// Set when the entry was written without an L2 counterpart (L2 down).
    /// Such entries must never be promoted or have their TTL extended.
    l1_only: bool,
}

impl CacheItem {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now > at)
    }
}

/// Counters for cache observability. All atomic; read via [`MemoryCache::stats`].
#[derive(Debug, Default)]
pub struct CacheCounters {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub sets: AtomicU64,
    pub deletes: AtomicU64,
    pub evictions: AtomicU64,
    pub expired_cleanups: AtomicU64,
}

/// Point-in-time stats snapshot.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
    pub evictions: u64,
    pub expired_cleanups: u64,
    pub size: usize,
    pub max_size: usize,
    pub hit_rate: f64,
}

/// L1 LRU cache with TTL. Thread-safe under concurrent readers/writers.
#[derive(Debug)]
pub struct MemoryCache {
    inner: Mutex<HashMap<String, CacheItem>>,
    max_size: usize,
    default_ttl: Duration,
    counters: CacheCounters,
}

impl MemoryCache {
    pub fn new(max_size: usize, default_ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(HashMap::with_capacity(max_size.min(1024))),
            max_size: max_size.max(1),
            default_ttl,
            counters: CacheCounters::default(),
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        let mut map = self.inner.lock();
        match map.get_mut(key) {
            Some(item) if !item.is_expired(now) => {
                item.last_accessed = now;
                item.access_count += 1;
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                Some(item.value.clone())
            }
            Some(_) => {
                map.remove(key);
                self.counters.expired_cleanups.fetch_add(1, Ordering::Relaxed);
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Whether `key` holds a live entry flagged L1-only.
    pub fn is_l1_only(&self, key: &str) -> bool {
        let now = Instant::now();
        let map = self.inner.lock();
        map.get(key).is_some_and(|i| !i.is_expired(now) && i.l1_only)
    }

    pub fn set(&self, key: &str, value: String, ttl: Option<Duration>) {
        self.set_inner(key, value, ttl, false)
    }

    /// Write an entry with no L2 counterpart; it will never be promoted.
    pub fn set_l1_only(&self, key: &str, value: String, ttl: Option<Duration>) {
        self.set_inner(key, value, ttl, true)
    }

    fn set_inner(&self, key: &str, value: String, ttl: Option<Duration>, l1_only: bool) {
        let now = Instant::now();
        let ttl = ttl.unwrap_or(self.default_ttl);
        let item = CacheItem {
            value,
            created_at: now,
            expires_at: Some(now + ttl),
            last_accessed: now,
            access_count: 0,
            l1_only,
        };

        let mut map = self.inner.lock();
        // Replacement is atomic under the lock; entries are never mutated
        // in place after creation.
        let replacing = map.contains_key(key);
        if !replacing && map.len() >= self.max_size {
            self.evict_lru(&mut map);
        }
        map.insert(key.to_string(), item);
        self.counters.sets.fetch_add(1, Ordering::Relaxed);
    }

    /// Evict the least-recently-accessed entry. A linear scan is fine at the
    /// default ceiling of 1000 entries and avoids a second index.
    fn evict_lru(&self, map: &mut HashMap<String, CacheItem>) {
        if let Some(victim) = map
            .iter()
            .min_by_key(|(_, item)| item.last_accessed)
            .map(|(k, _)| k.clone())
        {
            let item = map.remove(&victim);
            self.counters.evictions.fetch_add(1, Ordering::Relaxed);
            let age_s = item.map(|i| i.created_at.elapsed().as_secs()).unwrap_or(0);
            debug!(key = %victim, age_s, "evicted LRU cache entry");
        }
    }

    pub fn delete(&self, key: &str) -> bool {
        let removed = self.inner.lock().remove(key).is_some();
        if removed {
            self.counters.deletes.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    /// Remove every entry whose key starts with `prefix`. Returns the count.
    pub fn invalidate_prefix(&self, prefix: &str) -> usize {
        let mut map = self.inner.lock();
        let victims: Vec<String> = map
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        for k in &victims {
            map.remove(k);
        }
        self.counters
            .deletes
            .fetch_add(victims.len() as u64, Ordering::Relaxed);
        victims.len()
    }

    /// Drop expired entries. Returns how many were removed.
    pub fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let mut map = self.inner.lock();
        let victims: Vec<String> = map
            .iter()
            .filter(|(_, item)| item.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        for k in &victims {
            map.remove(k);
        }
        self.counters
            .expired_cleanups
            .fetch_add(victims.len() as u64, Ordering::Relaxed);
        if !victims.is_empty() {
            debug!(count = victims.len(), "swept expired L1 entries");
        }
        victims.len()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn clear(&self) {
        self.inner.lock().clear();
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.counters.hits.load(Ordering::Relaxed);
        let misses = self.counters.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            hits,
            misses,
            sets: self.counters.sets.load(Ordering::Relaxed),
            deletes: self.counters.deletes.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            expired_cleanups: self.counters.expired_cleanups.load(Ordering::Relaxed),
            size: self.len(),
            max_size: self.max_size,
            hit_rate: if total > 0 {
                hits as f64 / total as f64
            } else {
                0.0
            },
        }
    }

    /// Spawn the background sweeper; runs until the cache is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> tokio::task::JoinHandle<()> {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Some(cache) = weak.upgrade() else { break };
                cache.cleanup_expired();
            }
        })
    }
}
