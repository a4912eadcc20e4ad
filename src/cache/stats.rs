//! Cache statistics for the operational debug surface.
//!
//! Counters are tracked twice: locally (for [`snapshot`]) and through
//! the `metrics` facade for whatever recorder the host application
//! installs.
//!
//! [`snapshot`]: CacheStats::snapshot

use std::sync::atomic::{AtomicU64, Ordering};

use metrics::counter;
use serde::Serialize;

pub(crate) const METRIC_HIT_TOTAL: &str = "syncline_cache_hit_total";
pub(crate) const METRIC_MISS_TOTAL: &str = "syncline_cache_miss_total";
pub(crate) const METRIC_EVICT_TOTAL: &str = "syncline_cache_evict_total";
pub(crate) const METRIC_STALE_HIT_TOTAL: &str = "syncline_cache_stale_hit_total";

/// Hit/miss/eviction/stale-hit counters for one cache instance.
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    stale_hits: AtomicU64,
}

impl CacheStats {
    pub(crate) fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        counter!(METRIC_HIT_TOTAL).increment(1);
    }

    pub(crate) fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        counter!(METRIC_MISS_TOTAL).increment(1);
    }

    pub(crate) fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
        counter!(METRIC_EVICT_TOTAL).increment(1);
    }

    pub(crate) fn record_stale_hit(&self) {
        self.stale_hits.fetch_add(1, Ordering::Relaxed);
        counter!(METRIC_STALE_HIT_TOTAL).increment(1);
    }

    pub fn snapshot(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            stale_hits: self.stale_hits.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.evictions.store(0, Ordering::Relaxed);
        self.stale_hits.store(0, Ordering::Relaxed);
    }
}

/// Point-in-time copy of the counters, serializable for debug tooling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub stale_hits: u64,
}
