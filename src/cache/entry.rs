//! Cache entry lifecycle types.

use std::collections::HashSet;
use std::time::Duration;

use tokio::time::Instant;

use crate::backend::QueryValue;

/// Freshness of a cached value at lookup time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// Younger than `stale_after`.
    Fresh,
    /// Past soft expiry; servable but should be revalidated.
    Stale,
    /// Past hard expiry; a miss on the normal read path.
    Expired,
}

/// One cached query result. Owned exclusively by the [`QueryCache`];
/// replaced in place on revalidation, never mutated externally.
///
/// [`QueryCache`]: super::QueryCache
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub(crate) value: QueryValue,
    pub(crate) inserted_at: Instant,
    pub(crate) stale_after: Duration,
    pub(crate) ttl: Duration,
    pub(crate) tags: HashSet<String>,
}

impl CacheEntry {
    pub(crate) fn new(
        value: QueryValue,
        ttl: Duration,
        stale_after: Duration,
        tags: HashSet<String>,
    ) -> Self {
        // soft expiry can never outlive hard expiry
        let stale_after = stale_after.min(ttl);
        Self {
            value,
            inserted_at: Instant::now(),
            stale_after,
            ttl,
            tags,
        }
    }

    pub(crate) fn freshness_at(&self, now: Instant) -> Freshness {
        let age = now.duration_since(self.inserted_at);
        if age >= self.ttl {
            Freshness::Expired
        } else if age >= self.stale_after {
            Freshness::Stale
        } else {
            Freshness::Fresh
        }
    }

    pub fn value(&self) -> &QueryValue {
        &self.value
    }

    pub fn tags(&self) -> &HashSet<String> {
        &self.tags
    }
}

/// A cache read: the value plus how fresh it was at lookup time.
#[derive(Debug, Clone)]
pub struct CacheLookup {
    pub value: QueryValue,
    pub freshness: Freshness,
}
