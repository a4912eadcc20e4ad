//! Synchronization client.
//!
//! The explicit context object composing the query cache, request
//! deduplicator, optimistic mutation tracker, and realtime subscription
//! manager. Construct one per application at startup and inject it into
//! consumers; `clear()` gives tests a clean slate without rebuilding it.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use metrics::histogram;
use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::backend::{ChangeEvent, DataBackend, MutationOp, QueryValue, Row};
use crate::cache::{CacheStatsSnapshot, Freshness, GetOptions, QueryCache};
use crate::config::SyncSettings;
use crate::dedup::RequestDeduplicator;
use crate::error::SyncError;
use crate::optimistic::MutationTracker;
use crate::query::{QueryKey, QuerySpec};
use crate::realtime::{SubscriptionHandle, SubscriptionInfo, SubscriptionManager};
use crate::retry::RetryPolicy;

const METRIC_FETCH_MS: &str = "syncline_fetch_ms";

/// What a read hands to the UI.
#[derive(Debug, Clone)]
pub struct ReadResult {
    /// Cached or fetched value with pending mutations merged in; `None`
    /// only when nothing is available at all.
    pub data: Option<QueryValue>,
    /// True when a background fetch was started and no value is
    /// available yet (non-blocking reads only).
    pub is_loading: bool,
    /// True when `data` is past its soft expiry (or served past its hard
    /// TTL on the degraded path).
    pub is_stale: bool,
    pub error: Option<SyncError>,
}

impl ReadResult {
    fn value(data: QueryValue, is_stale: bool, error: Option<SyncError>) -> Self {
        Self {
            data: Some(data),
            is_loading: false,
            is_stale,
            error,
        }
    }

    fn loading() -> Self {
        Self {
            data: None,
            is_loading: true,
            is_stale: false,
            error: None,
        }
    }

    fn failed(error: SyncError) -> Self {
        Self {
            data: None,
            is_loading: false,
            is_stale: false,
            error: Some(error),
        }
    }
}

/// Outcome of a mutate call. Failed writes are never silently dropped:
/// `error` carries what the UI must surface.
#[derive(Debug, Clone)]
pub struct MutationOutcome {
    pub mutation_id: Uuid,
    pub success: bool,
    /// Authoritative post-mutation row on success.
    pub data: Option<Row>,
    pub error: Option<SyncError>,
}

/// Operational snapshot for debug tooling. Read-only.
#[derive(Debug, Clone, Serialize)]
pub struct SyncStats {
    pub cache: CacheStatsSnapshot,
    pub pending_mutations: usize,
    pub subscriptions: Vec<SubscriptionInfo>,
}

struct ClientCore {
    settings: SyncSettings,
    backend: Arc<dyn DataBackend>,
    cache: Arc<QueryCache>,
    dedup: RequestDeduplicator,
    mutations: Arc<MutationTracker>,
    retry: RetryPolicy,
    /// Cleared on shutdown; background work checks it before writing
    /// results back so nothing lands after teardown.
    live: AtomicBool,
}

/// One per application. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct SyncClient {
    core: Arc<ClientCore>,
    realtime: SubscriptionManager,
}

impl SyncClient {
    pub fn new(settings: SyncSettings, backend: Arc<dyn DataBackend>) -> Self {
        let mutations = Arc::new(MutationTracker::new());
        let cache = Arc::new(QueryCache::new(
            settings.query_capacity,
            Arc::clone(&mutations),
        ));
        let realtime = SubscriptionManager::new(
            Arc::clone(&backend),
            Arc::clone(&cache),
            settings.realtime_retry(),
        );
        let retry = settings.fetch_retry();
        Self {
            core: Arc::new(ClientCore {
                settings,
                backend,
                cache,
                dedup: RequestDeduplicator::new(),
                mutations,
                retry,
                live: AtomicBool::new(true),
            }),
            realtime,
        }
    }

    /// Read through the cache, fetching on miss.
    ///
    /// Fresh hits return immediately. Stale hits return immediately,
    /// flagged, and revalidate in the background. Misses block on the
    /// (deduplicated, retried) fetch. When the fetch fails and a
    /// hard-expired value is still resident, it is served as degraded
    /// data with a [`SyncError::StaleRead`] warning attached.
    pub async fn read(&self, spec: &QuerySpec) -> ReadResult {
        let key = spec.key();
        let lookup = self.core.cache.get(
            &key,
            GetOptions {
                allow_stale: true,
                allow_expired: false,
            },
        );
        match lookup {
            Some(lookup) if lookup.freshness == Freshness::Fresh => {
                ReadResult::value(self.merged(spec, lookup.value), false, None)
            }
            Some(lookup) => {
                self.spawn_revalidate(spec.clone());
                ReadResult::value(self.merged(spec, lookup.value), true, None)
            }
            None => match self.fetch_and_store(spec, None).await {
                Ok(value) => ReadResult::value(self.merged(spec, value), false, None),
                Err(err) => self.degraded(spec, &key, err),
            },
        }
    }

    /// Read with per-query freshness overrides instead of the configured
    /// defaults. `stale_after` is clamped to `ttl` when stored.
    pub async fn read_with_ttl(
        &self,
        spec: &QuerySpec,
        ttl: Duration,
        stale_after: Duration,
    ) -> ReadResult {
        let key = spec.key();
        let lookup = self.core.cache.get(
            &key,
            GetOptions {
                allow_stale: true,
                allow_expired: false,
            },
        );
        match lookup {
            Some(lookup) if lookup.freshness == Freshness::Fresh => {
                ReadResult::value(self.merged(spec, lookup.value), false, None)
            }
            Some(lookup) => {
                self.spawn_revalidate(spec.clone());
                ReadResult::value(self.merged(spec, lookup.value), true, None)
            }
            None => match self.fetch_and_store(spec, Some((ttl, stale_after))).await {
                Ok(value) => ReadResult::value(self.merged(spec, value), false, None),
                Err(err) => self.degraded(spec, &key, err),
            },
        }
    }

    /// Non-blocking read for render paths: returns what is cached right
    /// now and kicks off a background fetch when one is needed. Must be
    /// called within a tokio runtime.
    pub fn read_cached(&self, spec: &QuerySpec) -> ReadResult {
        let key = spec.key();
        let lookup = self.core.cache.get(
            &key,
            GetOptions {
                allow_stale: true,
                allow_expired: false,
            },
        );
        match lookup {
            Some(lookup) if lookup.freshness == Freshness::Fresh => {
                ReadResult::value(self.merged(spec, lookup.value), false, None)
            }
            Some(lookup) => {
                self.spawn_revalidate(spec.clone());
                ReadResult::value(self.merged(spec, lookup.value), true, None)
            }
            None => {
                self.spawn_revalidate(spec.clone());
                ReadResult::loading()
            }
        }
    }

    /// Bypass freshness and fetch from the backend. Still deduplicated;
    /// the cache entry is replaced on success.
    pub async fn refetch(&self, spec: &QuerySpec) -> Result<QueryValue, SyncError> {
        self.fetch_and_store(spec, None).await
    }

    /// Warm the cache ahead of navigation. A no-op when a fresh entry
    /// already exists.
    pub async fn prefetch(&self, spec: &QuerySpec) -> Result<(), SyncError> {
        let key = spec.key();
        if let Some(lookup) = self.core.cache.get(&key, GetOptions::default())
            && lookup.freshness == Freshness::Fresh
        {
            return Ok(());
        }
        self.fetch_and_store(spec, None).await.map(|_| ())
    }

    /// Issue a write. The optimistic prediction is visible to merged
    /// reads before the backend round-trip begins; on success the
    /// prediction is retired and the table's cache entries invalidated,
    /// on failure it is rolled back and the error surfaced.
    pub async fn mutate(&self, table: &str, operation: MutationOp, payload: Row) -> MutationOutcome {
        let mutation_id = self
            .core
            .mutations
            .apply(table, operation, payload.clone());

        let core = &self.core;
        let timeout = core.settings.request_timeout();
        let result = core
            .retry
            .run("mutate", |_attempt| {
                let payload = payload.clone();
                async move {
                    bounded(timeout, core.backend.mutate(table, operation, payload)).await
                }
            })
            .await;

        match result {
            Ok(row) => {
                if let Some(confirmed) = self.core.mutations.confirm(mutation_id) {
                    // next read replaces the optimistic overlay with
                    // authoritative server state
                    self.core.cache.invalidate_by_tag(&confirmed.table);
                }
                MutationOutcome {
                    mutation_id,
                    success: true,
                    data: Some(row),
                    error: None,
                }
            }
            Err(err) => {
                self.core.mutations.fail(mutation_id, &err);
                MutationOutcome {
                    mutation_id,
                    success: false,
                    data: None,
                    error: Some(err),
                }
            }
        }
    }

    /// Subscribe to realtime changes for a table; affected cache entries
    /// are invalidated as notifications arrive.
    pub fn subscribe(&self, table: &str, filter: Option<&str>) -> SubscriptionHandle {
        self.realtime.subscribe(table, filter, |_| {})
    }

    /// Subscribe with a consumer callback invoked per change event,
    /// after the cache invalidation for that change has been applied.
    pub fn subscribe_with(
        &self,
        table: &str,
        filter: Option<&str>,
        on_change: impl Fn(&ChangeEvent) + Send + Sync + 'static,
    ) -> SubscriptionHandle {
        self.realtime.subscribe(table, filter, on_change)
    }

    /// Operational snapshot for the debug surface.
    pub fn stats(&self) -> SyncStats {
        SyncStats {
            cache: self.core.cache.stats(),
            pending_mutations: self.core.mutations.len(),
            subscriptions: self.realtime.subscriptions(),
        }
    }

    pub fn cache(&self) -> &QueryCache {
        &self.core.cache
    }

    pub fn mutations(&self) -> &MutationTracker {
        &self.core.mutations
    }

    /// Drop all cached and pending state. Test isolation hook.
    pub fn clear(&self) {
        self.core.cache.clear();
        self.core.mutations.clear();
        self.core.dedup.clear();
    }

    /// Stop writing results back and close every realtime channel.
    /// Outstanding backend calls are not aborted; their effects are
    /// discarded.
    pub fn shutdown(&self) {
        self.core.live.store(false, Ordering::SeqCst);
        self.realtime.shutdown();
        debug!("sync client shut down");
    }

    async fn fetch_and_store(
        &self,
        spec: &QuerySpec,
        freshness_override: Option<(Duration, Duration)>,
    ) -> Result<QueryValue, SyncError> {
        let key = spec.key();
        let core = Arc::clone(&self.core);
        let fetch_spec = spec.clone();
        let started = std::time::Instant::now();

        let value = self
            .core
            .dedup
            .run(&key, move || async move {
                let timeout = core.settings.request_timeout();
                core.retry
                    .run("fetch", |_attempt| {
                        let spec = fetch_spec.clone();
                        let core = Arc::clone(&core);
                        async move { bounded(timeout, core.backend.query(&spec)).await }
                    })
                    .await
            })
            .await?;

        histogram!(METRIC_FETCH_MS).record(started.elapsed().as_secs_f64() * 1000.0);

        if self.core.live.load(Ordering::SeqCst) {
            let (ttl, stale_after) = freshness_override.unwrap_or((
                self.core.settings.default_ttl(),
                self.core.settings.default_stale_after(),
            ));
            self.core.cache.set(
                key,
                value.clone(),
                ttl,
                stale_after,
                HashSet::from([spec.table.clone()]),
            );
        }

        Ok(value)
    }

    fn spawn_revalidate(&self, spec: QuerySpec) {
        let client = self.clone();
        tokio::spawn(async move {
            if !client.core.live.load(Ordering::SeqCst) {
                return;
            }
            if let Err(err) = client.fetch_and_store(&spec, None).await {
                warn!(key = %spec.key(), error = %err, "background revalidation failed");
            }
        });
    }

    /// Overlay pending optimistic mutations onto a row-list result.
    /// Single rows and scalars are returned as fetched.
    fn merged(&self, spec: &QuerySpec, value: QueryValue) -> QueryValue {
        match value {
            QueryValue::Rows(rows) => {
                QueryValue::Rows(self.core.mutations.merge_into(&spec.table, rows))
            }
            other => other,
        }
    }

    fn degraded(&self, spec: &QuerySpec, key: &QueryKey, err: SyncError) -> ReadResult {
        let lookup = self.core.cache.get(
            key,
            GetOptions {
                allow_stale: true,
                allow_expired: true,
            },
        );
        match lookup {
            Some(lookup) => {
                warn!(key = %key, "serving hard-expired data after failed fetch");
                ReadResult::value(
                    self.merged(spec, lookup.value),
                    true,
                    Some(SyncError::stale_read(key.as_str())),
                )
            }
            None => ReadResult::failed(err),
        }
    }
}

async fn bounded<T>(
    limit: Duration,
    fut: impl Future<Output = Result<T, SyncError>>,
) -> Result<T, SyncError> {
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(SyncError::timeout(limit.as_millis() as u64)),
    }
}
