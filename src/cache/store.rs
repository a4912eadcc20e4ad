//! Query cache storage.
//!
//! LRU-backed store with per-entry freshness, tag invalidation, and
//! eviction pinning for tables with unconfirmed optimistic writes.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use lru::LruCache;
use tokio::time::Instant;
use tracing::debug;

use crate::backend::QueryValue;
use crate::lock::write_guard;
use crate::optimistic::MutationTracker;
use crate::query::QueryKey;

use super::entry::{CacheEntry, CacheLookup, Freshness};
use super::stats::{CacheStats, CacheStatsSnapshot};

const COMPONENT: &str = "cache::store";

/// Read options for [`QueryCache::get`].
#[derive(Debug, Clone, Copy, Default)]
pub struct GetOptions {
    /// Serve values past their soft expiry, flagged stale, instead of
    /// missing. The caller decides whether to revalidate in the
    /// background or block on freshness.
    pub allow_stale: bool,
    /// Serve values past their hard TTL. Degraded-read fallback for
    /// callers whose fetch just failed; never the normal path.
    pub allow_expired: bool,
}

/// In-memory store of query results keyed by canonical query signature.
pub struct QueryCache {
    entries: RwLock<LruCache<QueryKey, CacheEntry>>,
    capacity: usize,
    stats: CacheStats,
    mutations: Arc<MutationTracker>,
}

impl QueryCache {
    /// Create a cache holding at most `capacity` entries.
    pub fn new(capacity: usize, mutations: Arc<MutationTracker>) -> Self {
        Self {
            // Unbounded storage; capacity is enforced manually so
            // entries pinned by pending writes can be skipped.
            entries: RwLock::new(LruCache::unbounded()),
            capacity: capacity.max(1),
            stats: CacheStats::default(),
            mutations,
        }
    }

    /// Look up `key`.
    ///
    /// Fresh entries always hit. Stale entries hit only with
    /// `allow_stale`; hard-expired entries only with `allow_expired`.
    /// Everything else is a miss. Hard-expired entries stay resident
    /// until replaced, invalidated, or evicted, so a failed refetch can
    /// still degrade to them.
    pub fn get(&self, key: &QueryKey, options: GetOptions) -> Option<CacheLookup> {
        let now = Instant::now();
        let mut entries = write_guard(&self.entries, COMPONENT, "get");
        let Some(entry) = entries.get(key) else {
            self.stats.record_miss();
            return None;
        };

        let freshness = entry.freshness_at(now);
        match freshness {
            Freshness::Fresh => {
                self.stats.record_hit();
                Some(CacheLookup {
                    value: entry.value.clone(),
                    freshness,
                })
            }
            Freshness::Stale if options.allow_stale => {
                self.stats.record_stale_hit();
                Some(CacheLookup {
                    value: entry.value.clone(),
                    freshness,
                })
            }
            Freshness::Expired if options.allow_expired => {
                self.stats.record_stale_hit();
                Some(CacheLookup {
                    value: entry.value.clone(),
                    freshness,
                })
            }
            _ => {
                self.stats.record_miss();
                None
            }
        }
    }

    /// Insert or replace the entry for `key`.
    ///
    /// `stale_after` is clamped to `ttl`. `tags` should minimally name
    /// the source table.
    pub fn set(
        &self,
        key: QueryKey,
        value: QueryValue,
        ttl: Duration,
        stale_after: Duration,
        tags: HashSet<String>,
    ) {
        let entry = CacheEntry::new(value, ttl, stale_after, tags);
        let mut entries = write_guard(&self.entries, COMPONENT, "set");
        entries.put(key, entry);
        self.enforce_capacity(&mut entries);
    }

    /// Drop one key.
    pub fn invalidate(&self, key: &QueryKey) {
        write_guard(&self.entries, COMPONENT, "invalidate").pop(key);
    }

    /// Drop every entry tagged with `tag`.
    ///
    /// The single invalidation primitive shared by the mutation path and
    /// the realtime path; repeated calls for the same tag are harmless
    /// no-ops. Returns the number of entries removed.
    pub fn invalidate_by_tag(&self, tag: &str) -> usize {
        let mut entries = write_guard(&self.entries, COMPONENT, "invalidate_by_tag");
        let doomed: Vec<QueryKey> = entries
            .iter()
            .filter(|(_, entry)| entry.tags.contains(tag))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &doomed {
            entries.pop(key);
        }
        if !doomed.is_empty() {
            debug!(tag, removed = doomed.len(), "tag invalidation");
        }
        doomed.len()
    }

    /// Drop everything and zero the counters. Test isolation hook.
    pub fn clear(&self) {
        write_guard(&self.entries, COMPONENT, "clear").clear();
        self.stats.reset();
    }

    /// Maintenance sweep dropping hard-expired entries. Returns the
    /// number removed; each counts as an eviction.
    pub fn remove_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = write_guard(&self.entries, COMPONENT, "remove_expired");
        let doomed: Vec<QueryKey> = entries
            .iter()
            .filter(|(_, entry)| entry.freshness_at(now) == Freshness::Expired)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &doomed {
            entries.pop(key);
            self.stats.record_eviction();
        }
        doomed.len()
    }

    pub fn len(&self) -> usize {
        write_guard(&self.entries, COMPONENT, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        self.stats.snapshot()
    }

    /// Evict least-recently-used entries until capacity holds, skipping
    /// entries whose table has an unconfirmed optimistic write.
    fn enforce_capacity(&self, entries: &mut LruCache<QueryKey, CacheEntry>) {
        while entries.len() > self.capacity {
            let pinned = self.mutations.pending_tables();
            let victim = entries
                .iter()
                .rev()
                .find(|(_, entry)| entry.tags.is_disjoint(&pinned))
                .map(|(key, _)| key.clone());
            match victim {
                Some(key) => {
                    entries.pop(&key);
                    self.stats.record_eviction();
                    debug!(key = %key, "capacity eviction");
                }
                // every resident entry has a pending write against its table
                None => break,
            }
        }
    }
}
