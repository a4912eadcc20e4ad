//! Abstract data backend consumed by the synchronization layer.
//!
//! The layer never owns a wire format; it talks to the remote store
//! through this trait and assumes idempotent point queries and
//! at-least-once delivery of change notifications.

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::{Map, Value};

use crate::error::SyncError;
use crate::query::QuerySpec;

/// A decoded backend row.
pub type Row = Map<String, Value>;

/// Column carrying row identity.
pub const ID_COLUMN: &str = "id";

/// A decoded query result: a single row, a row list, or a scalar
/// (e.g. a count).
#[derive(Debug, Clone, PartialEq)]
pub enum QueryValue {
    Row(Row),
    Rows(Vec<Row>),
    Scalar(Value),
}

impl QueryValue {
    /// The row list, when this value is one.
    pub fn rows(&self) -> Option<&[Row]> {
        match self {
            Self::Rows(rows) => Some(rows),
            _ => None,
        }
    }
}

/// Kind of write issued against a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationOp {
    Insert,
    Update,
    Delete,
}

impl MutationOp {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

/// One change notification from the backend's realtime stream.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub table: String,
    pub op: MutationOp,
    /// The changed row, when the transport includes it. The sync layer
    /// only uses the table name (coarse invalidation); the row is passed
    /// through to consumer callbacks.
    pub row: Option<Row>,
}

/// Stream of change notifications for one subscribed channel.
pub type ChangeStream = BoxStream<'static, ChangeEvent>;

/// Remote store the synchronization layer keeps the UI consistent with.
#[async_trait]
pub trait DataBackend: Send + Sync {
    /// Execute a point query.
    async fn query(&self, spec: &QuerySpec) -> Result<QueryValue, SyncError>;

    /// Execute a write and return the authoritative post-mutation row.
    async fn mutate(&self, table: &str, op: MutationOp, payload: Row)
    -> Result<Row, SyncError>;

    /// Open a change-notification channel for `(table, filter)`.
    ///
    /// The stream ends when the transport drops; reconnection is the
    /// caller's concern.
    async fn subscribe_changes(
        &self,
        table: &str,
        filter: Option<&str>,
    ) -> Result<ChangeStream, SyncError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mutation_op_names() {
        assert_eq!(MutationOp::Insert.as_str(), "insert");
        assert_eq!(MutationOp::Update.as_str(), "update");
        assert_eq!(MutationOp::Delete.as_str(), "delete");
    }

    #[test]
    fn rows_accessor() {
        let value = QueryValue::Rows(vec![Row::new()]);
        assert_eq!(value.rows().map(<[Row]>::len), Some(1));
        assert!(QueryValue::Scalar(Value::from(3)).rows().is_none());
    }
}
