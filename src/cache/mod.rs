//! Capacity-limited LRU cache with optional expiry
//!
//! Used to memoize per-key lookups (geo enrichment, service names) that
//! repeat across millions of packets. The key/value table is a sharded
//! `DashMap`; the only serialized section is the access-order list, which
//! is held for O(1) relinking and never while a value is being computed.
//!
//! Lock order is always access-order first, then table shard. Readers
//! release their shard guard before touching the order list.

mod order;

use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, RecvTimeoutError, Sender};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, trace, warn};

use crate::error::{CapflowError, Result};
use order::AccessOrder;

/// Cached value plus bookkeeping
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub value: V,
    pub created_at: Instant,
    pub last_access: Instant,
}

impl<V> CacheEntry<V> {
    fn new(value: V) -> Self {
        let now = Instant::now();
        Self { value, created_at: now, last_access: now }
    }

    fn is_expired(&self, expiry: Option<Duration>, now: Instant) -> bool {
        match expiry {
            Some(ttl) => now.duration_since(self.created_at) >= ttl,
            None => false,
        }
    }
}

/// Construction options
#[derive(Debug, Clone)]
pub struct CacheOptions {
    /// Maximum resident entries; must be > 0
    pub capacity: usize,
    /// Entries older than this are treated as absent
    pub expiry: Option<Duration>,
    /// Background sweep period; only used when `expiry` is set
    pub sweep_interval: Option<Duration>,
}

impl CacheOptions {
    pub fn new(capacity: usize) -> Self {
        Self { capacity, expiry: None, sweep_interval: None }
    }

    pub fn with_expiry(mut self, expiry: Duration) -> Self {
        self.expiry = Some(expiry);
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = Some(interval);
        self
    }
}

/// Read-only snapshot of cache counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entries: usize,
    pub capacity: usize,
}

impl CacheStats {
    /// Hit rate as a percentage of lookups
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            0.0
        } else {
            self.hits as f64 / lookups as f64 * 100.0
        }
    }
}

struct CacheInner<K, V> {
    table: DashMap<K, CacheEntry<V>>,
    order: Mutex<AccessOrder<K>>,
    capacity: usize,
    expiry: Option<Duration>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl<K, V> CacheInner<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    fn lookup(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        let mut expired = false;
        let found = match self.table.get_mut(key) {
            Some(mut entry) => {
                if entry.is_expired(self.expiry, now) {
                    expired = true;
                    None
                } else {
                    entry.last_access = now;
                    Some(entry.value.clone())
                }
            }
            None => None,
        };

        if expired {
            self.remove_if_expired(key, now);
        }

        match found {
            Some(value) => {
                self.order.lock().touch(key);
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(value)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    fn store(&self, key: K, value: V) {
        let mut order = self.order.lock();
        self.table.insert(key.clone(), CacheEntry::new(value));
        order.insert(key);
        while order.len() > self.capacity {
            match order.pop_lru() {
                Some(victim) => {
                    self.table.remove(&victim);
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                    trace!("Evicted least recently used entry");
                }
                None => break,
            }
        }
    }

    fn remove_if_expired(&self, key: &K, now: Instant) -> bool {
        let mut order = self.order.lock();
        let expiry = self.expiry;
        if self.table.remove_if(key, |_, e| e.is_expired(expiry, now)).is_some() {
            order.remove(key);
            self.evictions.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    fn purge_expired(&self) -> usize {
        if self.expiry.is_none() {
            return 0;
        }
        let now = Instant::now();
        // Collect first: iterating holds shard locks, and the order lock must come first
        let candidates: Vec<K> = self
            .table
            .iter()
            .filter(|e| e.value().is_expired(self.expiry, now))
            .map(|e| e.key().clone())
            .collect();

        candidates
            .iter()
            .filter(|k| self.remove_if_expired(k, now))
            .count()
    }
}

/// Background thread that periodically removes expired entries
struct Sweeper {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        self.stop.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Cache sweeper thread panicked");
            }
        }
    }
}

/// Thread-safe LRU cache with optional time-based expiry
pub struct CapacityCache<K, V> {
    inner: Arc<CacheInner<K, V>>,
    _sweeper: Option<Sweeper>,
}

impl<K, V> CapacityCache<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Create a cache holding at most `capacity` entries
    pub fn new(capacity: usize) -> Result<Self> {
        Self::with_options(CacheOptions::new(capacity))
    }

    pub fn with_options(options: CacheOptions) -> Result<Self> {
        if options.capacity == 0 {
            return Err(CapflowError::config("cache capacity must be greater than zero"));
        }
        if options.expiry == Some(Duration::ZERO) {
            return Err(CapflowError::config("cache expiry must be non-zero"));
        }

        let inner = Arc::new(CacheInner {
            table: DashMap::with_capacity(options.capacity),
            order: Mutex::new(AccessOrder::with_capacity(options.capacity)),
            capacity: options.capacity,
            expiry: options.expiry,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        });

        let sweeper = match (options.expiry, options.sweep_interval) {
            (Some(_), Some(interval)) if !interval.is_zero() => {
                Some(spawn_sweeper(Arc::downgrade(&inner), interval)?)
            }
            _ => None,
        };

        debug!(capacity = options.capacity, expiry = ?options.expiry, "Created capacity cache");
        Ok(Self { inner, _sweeper: sweeper })
    }

    /// Look up a value, counting a hit or a miss
    pub fn get(&self, key: &K) -> Option<V> {
        self.inner.lookup(key)
    }

    /// Insert or replace a value, evicting the least recently used entry if full
    pub fn put(&self, key: K, value: V) {
        self.inner.store(key, value);
    }

    /// Return the cached value or compute, store and return it
    ///
    /// The factory runs outside every lock; two threads missing on the same
    /// key may both compute, and the later store wins.
    pub fn get_or_compute<F>(&self, key: K, factory: F) -> V
    where
        F: FnOnce() -> V,
    {
        if let Some(value) = self.inner.lookup(&key) {
            return value;
        }
        let value = factory();
        self.inner.store(key, value.clone());
        value
    }

    /// Like `get_or_compute`, but a failing factory stores nothing
    pub fn try_get_or_compute<F, E>(&self, key: K, factory: F) -> std::result::Result<V, E>
    where
        F: FnOnce() -> std::result::Result<V, E>,
    {
        if let Some(value) = self.inner.lookup(&key) {
            return Ok(value);
        }
        let value = factory()?;
        self.inner.store(key, value.clone());
        Ok(value)
    }

    pub fn remove(&self, key: &K) -> bool {
        let mut order = self.inner.order.lock();
        let removed = self.inner.table.remove(key).is_some();
        order.remove(key);
        removed
    }

    pub fn contains(&self, key: &K) -> bool {
        let now = Instant::now();
        self.inner
            .table
            .get(key)
            .map(|e| !e.is_expired(self.inner.expiry, now))
            .unwrap_or(false)
    }

    pub fn clear(&self) {
        let mut order = self.inner.order.lock();
        self.inner.table.clear();
        order.clear();
    }

    /// Remove every expired entry now; returns how many were removed
    pub fn purge_expired(&self) -> usize {
        self.inner.purge_expired()
    }

    pub fn len(&self) -> usize {
        self.inner.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.table.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.inner.hits.load(Ordering::Relaxed),
            misses: self.inner.misses.load(Ordering::Relaxed),
            evictions: self.inner.evictions.load(Ordering::Relaxed),
            entries: self.len(),
            capacity: self.inner.capacity,
        }
    }

    /// Zero the hit/miss/eviction counters
    pub fn reset_stats(&self) {
        self.inner.hits.store(0, Ordering::Relaxed);
        self.inner.misses.store(0, Ordering::Relaxed);
        self.inner.evictions.store(0, Ordering::Relaxed);
    }
}

fn spawn_sweeper<K, V>(inner: Weak<CacheInner<K, V>>, interval: Duration) -> Result<Sweeper>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    let (stop_tx, stop_rx) = channel::bounded::<()>(0);
    let handle = thread::Builder::new()
        .name("capflow-cache-sweep".to_string())
        .spawn(move || loop {
            match stop_rx.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => {
                    let Some(inner) = inner.upgrade() else { break };
                    let removed = inner.purge_expired();
                    if removed > 0 {
                        debug!(removed, "Swept expired cache entries");
                    }
                }
                _ => break,
            }
        })?;

    Ok(Sweeper { stop: Some(stop_tx), handle: Some(handle) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_zero_capacity_rejected() {
        assert!(matches!(
            CapacityCache::<u32, u32>::new(0),
            Err(CapflowError::Config(_))
        ));
    }

    #[test]
    fn test_lru_evicts_oldest_insert() {
        let cache = CapacityCache::new(3).unwrap();
        for k in 1..=4 {
            cache.put(k, k * 10);
        }
        assert!(!cache.contains(&1));
        assert_eq!(cache.get(&2), Some(20));
        assert_eq!(cache.get(&3), Some(30));
        assert_eq!(cache.get(&4), Some(40));
        assert_eq!(cache.len(), 3);
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_get_refreshes_recency() {
        let cache = CapacityCache::new(3).unwrap();
        cache.put("a", 1);
        cache.put("b", 2);
        cache.put("c", 3);
        assert_eq!(cache.get(&"a"), Some(1));
        cache.put("d", 4);
        // "b" was least recently touched
        assert!(!cache.contains(&"b"));
        assert!(cache.contains(&"a"));
        assert!(cache.contains(&"c"));
        assert!(cache.contains(&"d"));
    }

    #[test]
    fn test_resident_set_is_most_recent_keys() {
        let cache = CapacityCache::new(4).unwrap();
        let mut touched: Vec<u32> = Vec::new();
        let ops: [(bool, u32); 12] = [
            (true, 1), (true, 2), (true, 3), (false, 1), (true, 4), (true, 5),
            (false, 3), (true, 6), (false, 1), (true, 7), (false, 5), (true, 8),
        ];
        for (is_put, key) in ops {
            if is_put {
                cache.put(key, key);
            } else if cache.get(&key).is_none() {
                continue;
            }
            touched.retain(|k| *k != key);
            touched.push(key);
        }
        let expected: Vec<u32> = touched.iter().rev().take(4).copied().collect();
        for key in &expected {
            assert!(cache.contains(key), "key {} should be resident", key);
        }
        assert_eq!(cache.len(), 4);
    }

    #[test]
    fn test_get_or_compute_counts_hits_and_misses() {
        let cache = CapacityCache::new(8).unwrap();
        let calls = AtomicUsize::new(0);
        let compute = || {
            calls.fetch_add(1, Ordering::SeqCst);
            "value".to_string()
        };

        assert_eq!(cache.get_or_compute(7u16, compute), "value");
        assert_eq!(cache.get_or_compute(7u16, compute), "value");
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hit_rate(), 50.0);

        cache.reset_stats();
        assert_eq!(cache.stats().hits, 0);
    }

    #[test]
    fn test_failed_factory_stores_nothing() {
        let cache: CapacityCache<u32, u32> = CapacityCache::new(2).unwrap();
        let result: std::result::Result<u32, String> =
            cache.try_get_or_compute(1, || Err("lookup failed".to_string()));
        assert!(result.is_err());
        assert!(!cache.contains(&1));
        assert_eq!(cache.try_get_or_compute(1, || Ok::<_, String>(5)).unwrap(), 5);
        assert!(cache.contains(&1));
    }

    #[test]
    fn test_expired_entry_is_absent_even_if_recent() {
        let cache =
            CapacityCache::with_options(CacheOptions::new(4).with_expiry(Duration::from_millis(30)))
                .unwrap();
        cache.put(1, "one");
        assert_eq!(cache.get(&1), Some("one"));
        thread::sleep(Duration::from_millis(50));
        // Most recently used, but older than the expiry
        assert_eq!(cache.get(&1), None);
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_background_sweep_removes_expired() {
        let cache = CapacityCache::with_options(
            CacheOptions::new(16)
                .with_expiry(Duration::from_millis(20))
                .with_sweep_interval(Duration::from_millis(10)),
        )
        .unwrap();
        for k in 0..5 {
            cache.put(k, k);
        }
        let deadline = Instant::now() + Duration::from_secs(2);
        while !cache.is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(cache.is_empty());
    }

    #[test]
    fn test_remove_and_clear() {
        let cache = CapacityCache::new(4).unwrap();
        cache.put(1, 1);
        cache.put(2, 2);
        assert!(cache.remove(&1));
        assert!(!cache.remove(&1));
        cache.clear();
        assert!(cache.is_empty());
        // Order list is cleared too: filling to capacity evicts nothing
        for k in 0..4 {
            cache.put(k, k);
        }
        assert_eq!(cache.stats().evictions, 0);
    }

    #[test]
    fn test_concurrent_access_respects_capacity() {
        let cache = Arc::new(CapacityCache::new(64).unwrap());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let cache = Arc::clone(&cache);
                thread::spawn(move || {
                    for i in 0..2_000u32 {
                        let key = (i * 7 + t) % 256;
                        cache.get_or_compute(key, || key * 2);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(cache.len() <= 64);
        let stats = cache.stats();
        assert_eq!(stats.hits + stats.misses, 16_000);
    }
}
