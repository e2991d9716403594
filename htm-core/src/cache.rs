//! Query-result cache for recall.
//!
//! LRU with per-entry TTL. Strictly a performance hint: any write,
//! soft-delete, or restore invalidates the whole cache, so stale results
//! are never served after a mutation.

use crate::timeframe::Timeframe;
use crate::types::SearchHit;
use lru::LruCache;
use parking_lot::RwLock;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

/// Cache key combining every parameter that affects a result set.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryKey {
    /// Search strategy name (`vector`, `fulltext`, `hybrid`, `topic`).
    pub strategy: &'static str,
    /// Query text.
    pub query: String,
    /// Resolved timeframe intervals, when any.
    pub timeframe: Option<Timeframe>,
    /// Result limit.
    pub limit: usize,
    /// Hybrid weights, scaled to avoid float hashing.
    pub weights: (u32, u32),
}

impl QueryKey {
    /// Build a key for a strategy and query.
    #[must_use]
    pub fn new(strategy: &'static str, query: &str) -> Self {
        Self {
            strategy,
            query: query.to_string(),
            timeframe: None,
            limit: 10,
            weights: (0, 0),
        }
    }

    /// Attach a timeframe.
    #[must_use]
    pub fn with_timeframe(mut self, timeframe: Option<Timeframe>) -> Self {
        self.timeframe = timeframe;
        self
    }

    /// Attach a result limit.
    #[must_use]
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// Attach hybrid weights.
    #[must_use]
    pub fn with_weights(mut self, vector: f32, tag: f32) -> Self {
        self.weights = ((vector * 10_000.0) as u32, (tag * 10_000.0) as u32);
        self
    }

    fn compute_hash(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.strategy.hash(&mut hasher);
        self.query.hash(&mut hasher);
        self.limit.hash(&mut hasher);
        self.weights.hash(&mut hasher);
        if let Some(frame) = &self.timeframe {
            for (start, end) in &frame.intervals {
                start.timestamp_micros().hash(&mut hasher);
                end.timestamp_micros().hash(&mut hasher);
            }
        }
        hasher.finish()
    }
}

#[derive(Clone)]
struct CachedResult {
    hits: Vec<SearchHit>,
    cached_at: Instant,
    ttl: Duration,
}

impl CachedResult {
    fn is_expired(&self) -> bool {
        self.cached_at.elapsed() >= self.ttl
    }
}

/// Cache counters for monitoring.
#[derive(Debug, Clone, Default)]
pub struct CacheMetrics {
    /// Total lookups served from the cache.
    pub hits: u64,
    /// Total lookups that missed.
    pub misses: u64,
    /// Total full invalidations.
    pub invalidations: u64,
}

impl CacheMetrics {
    /// Hit rate in `[0, 1]`.
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Thread-safe bounded LRU with TTL over recall results.
pub struct QueryCache {
    cache: Option<RwLock<LruCache<u64, CachedResult>>>,
    metrics: RwLock<CacheMetrics>,
    ttl: Duration,
}

impl QueryCache {
    /// Create a cache; a zero capacity disables caching entirely.
    #[must_use]
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            cache: NonZeroUsize::new(capacity).map(|cap| RwLock::new(LruCache::new(cap))),
            metrics: RwLock::new(CacheMetrics::default()),
            ttl,
        }
    }

    /// Look up a result set.
    #[must_use]
    pub fn get(&self, key: &QueryKey) -> Option<Vec<SearchHit>> {
        let cache = self.cache.as_ref()?;
        let hash = key.compute_hash();
        let mut guard = cache.write();
        match guard.get(&hash) {
            Some(entry) if !entry.is_expired() => {
                self.metrics.write().hits += 1;
                Some(entry.hits.clone())
            }
            Some(_) => {
                guard.pop(&hash);
                self.metrics.write().misses += 1;
                None
            }
            None => {
                self.metrics.write().misses += 1;
                None
            }
        }
    }

    /// Store a result set.
    pub fn put(&self, key: &QueryKey, hits: Vec<SearchHit>) {
        let Some(cache) = self.cache.as_ref() else {
            return;
        };
        cache.write().put(
            key.compute_hash(),
            CachedResult {
                hits,
                cached_at: Instant::now(),
                ttl: self.ttl,
            },
        );
    }

    /// Drop every entry. Called on any write, soft-delete, or restore.
    pub fn invalidate_all(&self) {
        if let Some(cache) = self.cache.as_ref() {
            cache.write().clear();
            self.metrics.write().invalidations += 1;
        }
    }

    /// Snapshot of the counters.
    #[must_use]
    pub fn metrics(&self) -> CacheMetrics {
        self.metrics.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(query: &str) -> QueryKey {
        QueryKey::new("hybrid", query).with_limit(5)
    }

    #[test]
    fn hit_after_put() {
        let cache = QueryCache::new(10, Duration::from_secs(60));
        assert!(cache.get(&key("q")).is_none());
        cache.put(&key("q"), Vec::new());
        assert!(cache.get(&key("q")).is_some());

        let metrics = cache.metrics();
        assert_eq!(metrics.hits, 1);
        assert_eq!(metrics.misses, 1);
        assert!((metrics.hit_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn different_parameters_are_different_keys() {
        let cache = QueryCache::new(10, Duration::from_secs(60));
        cache.put(&key("q"), Vec::new());
        assert!(cache.get(&key("q").with_limit(7)).is_none());
        assert!(cache.get(&QueryKey::new("vector", "q").with_limit(5)).is_none());
        assert!(cache
            .get(&key("q").with_weights(0.5, 0.5))
            .is_none());
    }

    #[test]
    fn expired_entries_miss() {
        let cache = QueryCache::new(10, Duration::from_millis(0));
        cache.put(&key("q"), Vec::new());
        assert!(cache.get(&key("q")).is_none());
    }

    #[test]
    fn invalidate_all_clears() {
        let cache = QueryCache::new(10, Duration::from_secs(60));
        cache.put(&key("a"), Vec::new());
        cache.put(&key("b"), Vec::new());
        cache.invalidate_all();
        assert!(cache.get(&key("a")).is_none());
        assert!(cache.get(&key("b")).is_none());
        assert_eq!(cache.metrics().invalidations, 1);
    }

    #[test]
    fn zero_capacity_disables_caching() {
        let cache = QueryCache::new(0, Duration::from_secs(60));
        cache.put(&key("q"), Vec::new());
        assert!(cache.get(&key("q")).is_none());
        cache.invalidate_all();
        assert_eq!(cache.metrics().invalidations, 0);
    }

    #[test]
    fn lru_evicts_oldest() {
        let cache = QueryCache::new(2, Duration::from_secs(60));
        cache.put(&key("a"), Vec::new());
        cache.put(&key("b"), Vec::new());
        cache.put(&key("c"), Vec::new());
        assert!(cache.get(&key("a")).is_none());
        assert!(cache.get(&key("b")).is_some());
        assert!(cache.get(&key("c")).is_some());
    }
}
