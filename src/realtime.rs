//! Realtime subscription management.
//!
//! Owns one backend change-stream channel per (table, filter) pair,
//! reference-counted across consumers. Every received change invalidates
//! the affected table's cache entries (coarse invalidation: correctness
//! over precision) before fanning out to consumer callbacks. Transport
//! failures are absorbed into automatic reconnection with the shared
//! backoff policy; while disconnected, cached data keeps being served.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use futures::StreamExt;
use metrics::{counter, gauge};
use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::{ChangeEvent, DataBackend};
use crate::cache::QueryCache;
use crate::lock::{lock_guard, read_guard, write_guard};
use crate::retry::RetryPolicy;

const COMPONENT: &str = "realtime";
const METRIC_RECONNECT_TOTAL: &str = "syncline_realtime_reconnect_total";
const METRIC_CHANNELS_ACTIVE: &str = "syncline_realtime_channels_active";

/// Connection status of one subscription channel.
///
/// `Closed` is terminal for a channel instance; a later subscribe for
/// the same (table, filter) creates a fresh instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChannelStatus {
    Inactive,
    Connecting,
    Connected,
    Error,
    Closed,
}

/// Snapshot of one channel for the operational surface.
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionInfo {
    pub id: Uuid,
    pub table: String,
    pub filter: Option<String>,
    pub status: ChannelStatus,
    pub subscriber_count: usize,
    pub last_updated: OffsetDateTime,
}

type ChannelKey = (String, Option<String>);
type OnChange = Box<dyn Fn(&ChangeEvent) + Send + Sync>;

struct ChannelState {
    id: Uuid,
    table: String,
    filter: Option<String>,
    status: ChannelStatus,
    subscriber_count: usize,
    last_updated: OffsetDateTime,
}

impl ChannelState {
    fn info(&self) -> SubscriptionInfo {
        SubscriptionInfo {
            id: self.id,
            table: self.table.clone(),
            filter: self.filter.clone(),
            status: self.status,
            subscriber_count: self.subscriber_count,
            last_updated: self.last_updated,
        }
    }
}

struct Listener {
    id: u64,
    on_change: OnChange,
}

struct Channel {
    state: Arc<RwLock<ChannelState>>,
    listeners: Arc<Mutex<Vec<Listener>>>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
    next_listener_id: u64,
}

struct ManagerInner {
    backend: Arc<dyn DataBackend>,
    cache: Arc<QueryCache>,
    reconnect: RetryPolicy,
    channels: Mutex<HashMap<ChannelKey, Channel>>,
}

impl ManagerInner {
    fn release(&self, key: &ChannelKey, listener_id: u64) {
        let mut channels = lock_guard(&self.channels, COMPONENT, "release");
        let Some(channel) = channels.get_mut(key) else {
            return;
        };

        lock_guard(&channel.listeners, COMPONENT, "release.listeners")
            .retain(|listener| listener.id != listener_id);

        let remaining = {
            let mut state = write_guard(&channel.state, COMPONENT, "release.state");
            state.subscriber_count = state.subscriber_count.saturating_sub(1);
            state.last_updated = OffsetDateTime::now_utc();
            state.subscriber_count
        };

        if remaining == 0
            && let Some(channel) = channels.remove(key)
        {
            close_channel(channel);
        }
    }
}

/// Reference-counted realtime channels over one data backend.
///
/// Cheap to clone; clones share state. Channels are spawned onto the
/// ambient tokio runtime, so `subscribe` must be called within one.
#[derive(Clone)]
pub struct SubscriptionManager {
    inner: Arc<ManagerInner>,
}

impl SubscriptionManager {
    pub fn new(
        backend: Arc<dyn DataBackend>,
        cache: Arc<QueryCache>,
        reconnect: RetryPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                backend,
                cache,
                reconnect,
                channels: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Subscribe to changes on `(table, filter)`.
    ///
    /// The first subscriber opens the transport channel; later ones
    /// share it. The returned handle releases the reference on drop, and
    /// releasing the last reference closes the channel deterministically.
    pub fn subscribe(
        &self,
        table: &str,
        filter: Option<&str>,
        on_change: impl Fn(&ChangeEvent) + Send + Sync + 'static,
    ) -> SubscriptionHandle {
        let key: ChannelKey = (table.to_string(), filter.map(str::to_string));

        let mut channels = lock_guard(&self.inner.channels, COMPONENT, "subscribe");
        let channel = channels
            .entry(key.clone())
            .or_insert_with(|| self.open_channel(&key));

        channel.next_listener_id += 1;
        let listener_id = channel.next_listener_id;
        lock_guard(&channel.listeners, COMPONENT, "subscribe.listeners").push(Listener {
            id: listener_id,
            on_change: Box::new(on_change),
        });

        {
            let mut state = write_guard(&channel.state, COMPONENT, "subscribe.state");
            state.subscriber_count += 1;
            state.last_updated = OffsetDateTime::now_utc();
            debug!(
                table = %state.table,
                subscriber_count = state.subscriber_count,
                "realtime subscriber added"
            );
        }

        SubscriptionHandle {
            manager: Arc::downgrade(&self.inner),
            key,
            listener_id,
            released: AtomicBool::new(false),
        }
    }

    fn open_channel(&self, key: &ChannelKey) -> Channel {
        let state = Arc::new(RwLock::new(ChannelState {
            id: Uuid::new_v4(),
            table: key.0.clone(),
            filter: key.1.clone(),
            status: ChannelStatus::Inactive,
            subscriber_count: 0,
            last_updated: OffsetDateTime::now_utc(),
        }));
        let listeners: Arc<Mutex<Vec<Listener>>> = Arc::new(Mutex::new(Vec::new()));
        let (shutdown, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(run_channel(
            Arc::clone(&self.inner.backend),
            Arc::clone(&self.inner.cache),
            self.inner.reconnect.clone(),
            Arc::clone(&state),
            Arc::clone(&listeners),
            shutdown_rx,
        ));

        gauge!(METRIC_CHANNELS_ACTIVE).increment(1.0);
        info!(table = %key.0, filter = ?key.1, "realtime channel opened");

        Channel {
            state,
            listeners,
            shutdown,
            task,
            next_listener_id: 0,
        }
    }

    /// Snapshot of every live channel for the operational surface.
    pub fn subscriptions(&self) -> Vec<SubscriptionInfo> {
        lock_guard(&self.inner.channels, COMPONENT, "subscriptions")
            .values()
            .map(|channel| read_guard(&channel.state, COMPONENT, "subscriptions.state").info())
            .collect()
    }

    /// Status of the channel for `(table, filter)`, if one is live.
    pub fn channel_status(&self, table: &str, filter: Option<&str>) -> Option<ChannelStatus> {
        let key: ChannelKey = (table.to_string(), filter.map(str::to_string));
        lock_guard(&self.inner.channels, COMPONENT, "channel_status")
            .get(&key)
            .map(|channel| read_guard(&channel.state, COMPONENT, "channel_status.state").status)
    }

    /// Number of consumers on the channel for `(table, filter)`.
    pub fn subscriber_count(&self, table: &str, filter: Option<&str>) -> usize {
        let key: ChannelKey = (table.to_string(), filter.map(str::to_string));
        lock_guard(&self.inner.channels, COMPONENT, "subscriber_count")
            .get(&key)
            .map(|channel| {
                read_guard(&channel.state, COMPONENT, "subscriber_count.state").subscriber_count
            })
            .unwrap_or(0)
    }

    /// Close every channel. Transport sockets are the only OS resources
    /// this layer owns; they must not outlive the client.
    pub fn shutdown(&self) {
        let channels: Vec<Channel> = {
            let mut map = lock_guard(&self.inner.channels, COMPONENT, "shutdown");
            map.drain().map(|(_, channel)| channel).collect()
        };
        for channel in channels {
            close_channel(channel);
        }
    }
}

fn close_channel(channel: Channel) {
    {
        let mut state = write_guard(&channel.state, COMPONENT, "close");
        state.status = ChannelStatus::Closed;
        state.last_updated = OffsetDateTime::now_utc();
        info!(table = %state.table, "realtime channel closed");
    }
    let _ = channel.shutdown.send(true);
    channel.task.abort();
    gauge!(METRIC_CHANNELS_ACTIVE).decrement(1.0);
}

fn set_status(state: &Arc<RwLock<ChannelState>>, status: ChannelStatus) {
    let mut state = write_guard(state, COMPONENT, "set_status");
    state.status = status;
    state.last_updated = OffsetDateTime::now_utc();
}

async fn run_channel(
    backend: Arc<dyn DataBackend>,
    cache: Arc<QueryCache>,
    reconnect: RetryPolicy,
    state: Arc<RwLock<ChannelState>>,
    listeners: Arc<Mutex<Vec<Listener>>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let (table, filter) = {
        let state = read_guard(&state, COMPONENT, "run_channel");
        (state.table.clone(), state.filter.clone())
    };

    let mut attempt: u32 = 0;
    loop {
        set_status(&state, ChannelStatus::Connecting);

        let connected = tokio::select! {
            _ = shutdown.changed() => return,
            result = backend.subscribe_changes(&table, filter.as_deref()) => result,
        };

        match connected {
            Ok(mut changes) => {
                set_status(&state, ChannelStatus::Connected);
                attempt = 0;
                info!(table = %table, "realtime channel connected");

                loop {
                    tokio::select! {
                        _ = shutdown.changed() => return,
                        next = changes.next() => match next {
                            Some(change) => {
                                // Coarse invalidation: drop every entry
                                // for the table rather than patching the
                                // changed row. At-least-once delivery
                                // makes duplicates harmless.
                                cache.invalidate_by_tag(&change.table);
                                {
                                    let mut state =
                                        write_guard(&state, COMPONENT, "run_channel.change");
                                    state.last_updated = OffsetDateTime::now_utc();
                                }
                                for listener in
                                    lock_guard(&listeners, COMPONENT, "run_channel.fanout").iter()
                                {
                                    (listener.on_change)(&change);
                                }
                            }
                            None => {
                                warn!(table = %table, "realtime stream ended");
                                break;
                            }
                        }
                    }
                }
            }
            Err(err) => {
                warn!(table = %table, error = %err, "realtime connect failed");
            }
        }

        set_status(&state, ChannelStatus::Error);
        counter!(METRIC_RECONNECT_TOTAL).increment(1);
        attempt = attempt.saturating_add(1);
        let delay = reconnect.delay_for(attempt);
        debug!(
            table = %table,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "scheduling realtime reconnect"
        );

        tokio::select! {
            _ = shutdown.changed() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// RAII handle for one consumer's interest in a realtime channel.
///
/// Dropping the handle (or calling [`unsubscribe`]) releases the
/// reference; the channel closes when the last handle goes away. The
/// manager's channel map is only a cache of live resources — handles own
/// the lifetime.
///
/// [`unsubscribe`]: SubscriptionHandle::unsubscribe
pub struct SubscriptionHandle {
    manager: Weak<ManagerInner>,
    key: ChannelKey,
    listener_id: u64,
    released: AtomicBool,
}

impl SubscriptionHandle {
    pub fn table(&self) -> &str {
        &self.key.0
    }

    pub fn filter(&self) -> Option<&str> {
        self.key.1.as_deref()
    }

    /// Release explicitly instead of via drop.
    pub fn unsubscribe(self) {}

    fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(inner) = self.manager.upgrade() {
            inner.release(&self.key, self.listener_id);
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use async_trait::async_trait;
    use futures::channel::mpsc::{self, UnboundedSender};
    use serde_json::Value;

    use crate::backend::{ChangeStream, MutationOp, QueryValue, Row};
    use crate::error::SyncError;
    use crate::optimistic::MutationTracker;
    use crate::query::QuerySpec;

    use super::*;

    struct StreamBackend {
        subscribe_calls: AtomicUsize,
        fail_subscribes: AtomicUsize,
        senders: Mutex<Vec<UnboundedSender<ChangeEvent>>>,
    }

    impl StreamBackend {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                subscribe_calls: AtomicUsize::new(0),
                fail_subscribes: AtomicUsize::new(0),
                senders: Mutex::new(Vec::new()),
            })
        }

        fn push_change(&self, table: &str) {
            let change = ChangeEvent {
                table: table.to_string(),
                op: MutationOp::Update,
                row: None,
            };
            for sender in self.senders.lock().unwrap().iter() {
                let _ = sender.unbounded_send(change.clone());
            }
        }
    }

    #[async_trait]
    impl DataBackend for StreamBackend {
        async fn query(&self, _spec: &QuerySpec) -> Result<QueryValue, SyncError> {
            Ok(QueryValue::Rows(vec![]))
        }

        async fn mutate(
            &self,
            table: &str,
            op: MutationOp,
            _payload: Row,
        ) -> Result<Row, SyncError> {
            Err(SyncError::rejected(table, op.as_str(), "not supported"))
        }

        async fn subscribe_changes(
            &self,
            _table: &str,
            _filter: Option<&str>,
        ) -> Result<ChangeStream, SyncError> {
            self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
            if self
                .fail_subscribes
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(SyncError::network("transport down"));
            }
            let (sender, receiver) = mpsc::unbounded();
            self.senders.lock().unwrap().push(sender);
            Ok(receiver.boxed())
        }
    }

    fn manager(backend: Arc<StreamBackend>) -> (SubscriptionManager, Arc<QueryCache>) {
        let cache = Arc::new(QueryCache::new(16, Arc::new(MutationTracker::new())));
        let reconnect = RetryPolicy {
            initial_delay: Duration::from_millis(10),
            jitter: Duration::ZERO,
            ..RetryPolicy::default()
        };
        (
            SubscriptionManager::new(backend, Arc::clone(&cache), reconnect),
            cache,
        )
    }

    async fn settle<F: Fn() -> bool>(condition: F) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("condition never settled");
    }

    #[tokio::test(start_paused = true)]
    async fn consumers_share_one_transport_channel() {
        let backend = StreamBackend::new();
        let (manager, _cache) = manager(Arc::clone(&backend));

        let first = manager.subscribe("entries", None, |_| {});
        let second = manager.subscribe("entries", None, |_| {});
        let third = manager.subscribe("entries", None, |_| {});

        settle(|| manager.channel_status("entries", None) == Some(ChannelStatus::Connected)).await;
        assert_eq!(backend.subscribe_calls.load(Ordering::SeqCst), 1);
        assert_eq!(manager.subscriber_count("entries", None), 3);

        drop(first);
        drop(second);
        assert_eq!(manager.subscriber_count("entries", None), 1);
        assert!(manager.channel_status("entries", None).is_some());

        drop(third);
        assert_eq!(manager.subscriber_count("entries", None), 0);
        assert!(manager.channel_status("entries", None).is_none());
        assert!(manager.subscriptions().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn changes_invalidate_cache_and_reach_listeners() {
        let backend = StreamBackend::new();
        let (manager, cache) = manager(Arc::clone(&backend));

        cache.set(
            QuerySpec::table("entries").key(),
            QueryValue::Scalar(Value::from(1)),
            Duration::from_secs(60),
            Duration::from_secs(60),
            HashSet::from(["entries".to_string()]),
        );

        let seen = Arc::new(AtomicUsize::new(0));
        let seen_by_listener = Arc::clone(&seen);
        let _handle = manager.subscribe("entries", None, move |change| {
            assert_eq!(change.table, "entries");
            seen_by_listener.fetch_add(1, Ordering::SeqCst);
        });

        settle(|| manager.channel_status("entries", None) == Some(ChannelStatus::Connected)).await;
        backend.push_change("entries");

        settle(|| seen.load(Ordering::SeqCst) == 1).await;
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_connect_retries_until_connected() {
        let backend = StreamBackend::new();
        backend.fail_subscribes.store(2, Ordering::SeqCst);
        let (manager, _cache) = manager(Arc::clone(&backend));

        let _handle = manager.subscribe("entries", None, |_| {});

        settle(|| manager.channel_status("entries", None) == Some(ChannelStatus::Connected)).await;
        assert_eq!(backend.subscribe_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn resubscribe_after_close_creates_a_fresh_instance() {
        let backend = StreamBackend::new();
        let (manager, _cache) = manager(Arc::clone(&backend));

        let handle = manager.subscribe("entries", None, |_| {});
        settle(|| manager.channel_status("entries", None) == Some(ChannelStatus::Connected)).await;
        let first_id = manager.subscriptions()[0].id;
        drop(handle);

        let _handle = manager.subscribe("entries", None, |_| {});
        settle(|| manager.channel_status("entries", None) == Some(ChannelStatus::Connected)).await;
        let second_id = manager.subscriptions()[0].id;
        assert_ne!(first_id, second_id);
        assert_eq!(backend.subscribe_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_closes_every_channel() {
        let backend = StreamBackend::new();
        let (manager, _cache) = manager(Arc::clone(&backend));

        let _a = manager.subscribe("entries", None, |_| {});
        let _b = manager.subscribe("categories", None, |_| {});
        settle(|| manager.subscriptions().len() == 2).await;

        manager.shutdown();
        assert!(manager.subscriptions().is_empty());
    }
}
