//! Syncline: client-side data synchronization layer.
//!
//! Keeps a dashboard UI consistent with a hosted relational backend it
//! does not fully control. Four cooperating components, composed
//! bottom-up:
//!
//! - **Query cache**: canonical-keyed results with stale-while-revalidate
//!   freshness, tag-based invalidation, and LRU capacity eviction.
//! - **Request deduplicator**: at most one in-flight fetch per key;
//!   concurrent callers share the pending call's result.
//! - **Optimistic mutation tracker**: predicted writes overlaid onto
//!   reads until the backend confirms or rejects them.
//! - **Realtime subscription manager**: reference-counted change-stream
//!   channels that invalidate affected cache entries as changes arrive.
//!
//! Construct one [`SyncClient`] per application and inject it into
//! consumers; there is no global state.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use syncline::{DataBackend, QuerySpec, SyncClient, SyncSettings};
//!
//! # async fn example(backend: Arc<dyn DataBackend>) {
//! let client = SyncClient::new(SyncSettings::default(), backend);
//! let _entries = client.read(&QuerySpec::table("entries").limit(50)).await;
//! # }
//! ```

pub mod backend;
pub mod cache;
pub mod client;
pub mod config;
pub mod dedup;
pub mod error;
mod lock;
pub mod optimistic;
pub mod query;
pub mod realtime;
pub mod retry;
pub mod telemetry;

pub use backend::{ChangeEvent, ChangeStream, DataBackend, ID_COLUMN, MutationOp, QueryValue, Row};
pub use cache::{CacheEntry, CacheLookup, CacheStatsSnapshot, Freshness, GetOptions, QueryCache};
pub use client::{MutationOutcome, ReadResult, SyncClient, SyncStats};
pub use config::{LogFormat, LoggingSettings, SettingsError, SyncSettings};
pub use dedup::RequestDeduplicator;
pub use error::SyncError;
pub use optimistic::{MutationStatus, MutationTracker, PENDING_COLUMN, PendingMutation};
pub use query::{OrderBy, QueryKey, QuerySpec, SortOrder};
pub use realtime::{ChannelStatus, SubscriptionHandle, SubscriptionInfo, SubscriptionManager};
pub use retry::RetryPolicy;
pub use telemetry::TelemetryError;
