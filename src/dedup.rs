//! Request deduplication.
//!
//! Collapses concurrent identical fetches into one backend call: every
//! caller for a key awaits the same shared in-flight future and receives
//! the same resolved value or the same error. Nothing is cached here —
//! what happens to the settled value is the query cache's concern, and
//! retry is the fetch layer's.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tracing::debug;

use crate::backend::QueryValue;
use crate::error::SyncError;
use crate::lock::lock_guard;
use crate::query::QueryKey;

const COMPONENT: &str = "dedup";

type SharedFetch = Shared<BoxFuture<'static, Result<QueryValue, SyncError>>>;

struct InFlight {
    generation: u64,
    fetch: SharedFetch,
}

/// Key → in-flight fetch map. One per client.
pub struct RequestDeduplicator {
    in_flight: Mutex<HashMap<QueryKey, InFlight>>,
    generation: AtomicU64,
}

impl RequestDeduplicator {
    pub fn new() -> Self {
        Self {
            in_flight: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    /// Run `fetch` for `key`, joining an already in-flight call when one
    /// exists (in which case `fetch` is never invoked). The slot is
    /// cleared when the call settles, success or error, no matter how
    /// many callers awaited it.
    pub async fn run<F, Fut>(&self, key: &QueryKey, fetch: F) -> Result<QueryValue, SyncError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<QueryValue, SyncError>> + Send + 'static,
    {
        let (generation, shared) = {
            let mut in_flight = lock_guard(&self.in_flight, COMPONENT, "run");
            if let Some(existing) = in_flight.get(key) {
                debug!(key = %key, "joining in-flight request");
                (existing.generation, existing.fetch.clone())
            } else {
                let generation = self.generation.fetch_add(1, Ordering::SeqCst);
                let shared = fetch().boxed().shared();
                in_flight.insert(
                    key.clone(),
                    InFlight {
                        generation,
                        fetch: shared.clone(),
                    },
                );
                (generation, shared)
            }
        };

        let result = shared.await;

        // First settler clears the slot; the generation check keeps a
        // racing newer fetch for the same key from being dropped.
        let mut in_flight = lock_guard(&self.in_flight, COMPONENT, "run.settle");
        if in_flight
            .get(key)
            .is_some_and(|entry| entry.generation == generation)
        {
            in_flight.remove(key);
        }

        result
    }

    /// Number of keys currently in flight.
    pub fn in_flight_count(&self) -> usize {
        lock_guard(&self.in_flight, COMPONENT, "in_flight_count").len()
    }

    /// Forget every in-flight slot. Outstanding callers keep their
    /// shared futures; the next call per key starts fresh. Test
    /// isolation hook.
    pub fn clear(&self) {
        lock_guard(&self.in_flight, COMPONENT, "clear").clear();
    }
}

impl Default for RequestDeduplicator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use serde_json::Value;

    use crate::query::QuerySpec;

    use super::*;

    fn key(name: &str) -> QueryKey {
        QuerySpec::table(name).key()
    }

    fn scalar(n: i64) -> QueryValue {
        QueryValue::Scalar(Value::from(n))
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_one_execution() {
        let dedup = RequestDeduplicator::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let fetch = || {
            let calls = Arc::clone(&calls);
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(scalar(7))
            }
        };

        let key = key("entries");
        let (a, b, c) = tokio::join!(
            dedup.run(&key, fetch()),
            dedup.run(&key, fetch()),
            dedup.run(&key, fetch()),
        );

        assert_eq!(a, Ok(scalar(7)));
        assert_eq!(b, Ok(scalar(7)));
        assert_eq!(c, Ok(scalar(7)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(dedup.in_flight_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn errors_propagate_to_every_caller() {
        let dedup = RequestDeduplicator::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let fetch = || {
            let calls = Arc::clone(&calls);
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                Err(SyncError::network("connection refused"))
            }
        };

        let key = key("entries");
        let (a, b) = tokio::join!(dedup.run(&key, fetch()), dedup.run(&key, fetch()));

        assert_eq!(a, Err(SyncError::network("connection refused")));
        assert_eq!(a, b);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn slot_clears_after_settle_so_next_call_runs_fresh() {
        let dedup = RequestDeduplicator::new();
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let calls = Arc::clone(&calls);
            let result = dedup
                .run(&key("entries"), move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(scalar(1))
                })
                .await;
            assert!(result.is_ok());
        }

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(dedup.in_flight_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn distinct_keys_run_independently() {
        let dedup = RequestDeduplicator::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let fetch = |n: i64| {
            let calls = Arc::clone(&calls);
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok(scalar(n))
            }
        };

        let entries_key = key("entries");
        let categories_key = key("categories");
        let (a, b) = tokio::join!(
            dedup.run(&entries_key, fetch(1)),
            dedup.run(&categories_key, fetch(2)),
        );

        assert_eq!(a, Ok(scalar(1)));
        assert_eq!(b, Ok(scalar(2)));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
