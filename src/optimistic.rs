//! Optimistic mutation tracking.
//!
//! Records the client-predicted result of every write the instant it is
//! issued and overlays the predictions onto cache reads until the
//! backend confirms or rejects each one. The cache never stores a
//! prediction as authoritative, so rolling back a failed write is just
//! removing its overlay entry.

use std::collections::HashSet;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;
use time::OffsetDateTime;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::backend::{ID_COLUMN, MutationOp, Row};
use crate::error::SyncError;
use crate::lock::{read_guard, write_guard};

const COMPONENT: &str = "optimistic";

/// Column added to merged insert rows so the UI can render them as
/// still saving.
pub const PENDING_COLUMN: &str = "_pending";

/// Lifecycle of one tracked write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationStatus {
    Pending,
    Confirmed,
    Failed,
}

/// One client-issued write the backend has not yet acknowledged.
#[derive(Debug, Clone)]
pub struct PendingMutation {
    /// Client-generated, distinguishable from any server-assigned row id.
    pub id: Uuid,
    pub table: String,
    pub operation: MutationOp,
    /// Predicted post-mutation row (insert/update) or the identity to
    /// remove (delete).
    pub payload: Row,
    pub status: MutationStatus,
    pub issued_at: OffsetDateTime,
    /// Tiebreak for mutations issued within one clock tick.
    seq: u64,
}

/// Tracks unconfirmed writes and merges them over base row sets.
pub struct MutationTracker {
    pending: RwLock<Vec<PendingMutation>>,
    seq: AtomicU64,
}

impl MutationTracker {
    pub fn new() -> Self {
        Self {
            pending: RwLock::new(Vec::new()),
            seq: AtomicU64::new(0),
        }
    }

    /// Record a predicted write. Synchronous: the caller's UI update can
    /// happen before any network round-trip begins.
    pub fn apply(&self, table: impl Into<String>, operation: MutationOp, payload: Row) -> Uuid {
        let id = Uuid::new_v4();
        let mutation = PendingMutation {
            id,
            table: table.into(),
            operation,
            payload,
            status: MutationStatus::Pending,
            issued_at: OffsetDateTime::now_utc(),
            seq: self.seq.fetch_add(1, Ordering::SeqCst),
        };
        debug!(
            mutation_id = %id,
            table = %mutation.table,
            operation = operation.as_str(),
            "optimistic mutation applied"
        );
        write_guard(&self.pending, COMPONENT, "apply").push(mutation);
        id
    }

    /// Retire a confirmed mutation, returning it so the caller can
    /// invalidate the table's cache entries. Idempotent: a second call
    /// for the same id returns `None` and has no effect.
    pub fn confirm(&self, id: Uuid) -> Option<PendingMutation> {
        let confirmed = self.remove(id, MutationStatus::Confirmed);
        if let Some(mutation) = &confirmed {
            debug!(mutation_id = %id, table = %mutation.table, "optimistic mutation confirmed");
        }
        confirmed
    }

    /// Roll back a rejected mutation. The cache never held the predicted
    /// value as authoritative, so removing the overlay entry is the
    /// entire rollback. Idempotent.
    pub fn fail(&self, id: Uuid, error: &SyncError) -> Option<PendingMutation> {
        let failed = self.remove(id, MutationStatus::Failed);
        if let Some(mutation) = &failed {
            warn!(
                mutation_id = %id,
                table = %mutation.table,
                error = %error,
                "optimistic mutation rolled back"
            );
        }
        failed
    }

    fn remove(&self, id: Uuid, status: MutationStatus) -> Option<PendingMutation> {
        let mut pending = write_guard(&self.pending, COMPONENT, "remove");
        let index = pending.iter().position(|m| m.id == id)?;
        let mut mutation = pending.remove(index);
        mutation.status = status;
        Some(mutation)
    }

    /// Overlay the pending mutations for `table` onto `rows`.
    ///
    /// Mutations apply in issuance order (issued_at, then sequence), so
    /// later writes override earlier ones touching the same row identity
    /// and the output depends only on the pending set, never on call
    /// order. Inserts are appended with [`PENDING_COLUMN`] set; updates
    /// overwrite matching row fields; deletes filter matching rows out.
    pub fn merge_into(&self, table: &str, rows: Vec<Row>) -> Vec<Row> {
        let mut overlay: Vec<PendingMutation> = {
            read_guard(&self.pending, COMPONENT, "merge_into")
                .iter()
                .filter(|m| m.table == table)
                .cloned()
                .collect()
        };
        overlay.sort_by(|a, b| a.issued_at.cmp(&b.issued_at).then(a.seq.cmp(&b.seq)));

        let mut merged = rows;
        for mutation in overlay {
            match mutation.operation {
                MutationOp::Insert => {
                    let mut row = mutation.payload;
                    row.insert(PENDING_COLUMN.to_string(), Value::Bool(true));
                    merged.push(row);
                }
                MutationOp::Update => {
                    if let Some(target) = merged
                        .iter_mut()
                        .find(|row| same_identity(row, &mutation.payload))
                    {
                        for (column, value) in mutation.payload {
                            target.insert(column, value);
                        }
                    }
                }
                MutationOp::Delete => {
                    merged.retain(|row| !same_identity(row, &mutation.payload));
                }
            }
        }
        merged
    }

    /// Tables with at least one unconfirmed write. Cache entries tagged
    /// with these tables are pinned against eviction.
    pub fn pending_tables(&self) -> HashSet<String> {
        read_guard(&self.pending, COMPONENT, "pending_tables")
            .iter()
            .map(|m| m.table.clone())
            .collect()
    }

    /// Pending mutations for one table, in issuance order.
    pub fn pending_for(&self, table: &str) -> Vec<PendingMutation> {
        let mut mutations: Vec<PendingMutation> = read_guard(&self.pending, COMPONENT, "pending_for")
            .iter()
            .filter(|m| m.table == table)
            .cloned()
            .collect();
        mutations.sort_by(|a, b| a.issued_at.cmp(&b.issued_at).then(a.seq.cmp(&b.seq)));
        mutations
    }

    pub fn len(&self) -> usize {
        read_guard(&self.pending, COMPONENT, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every tracked mutation. Test isolation hook.
    pub fn clear(&self) {
        write_guard(&self.pending, COMPONENT, "clear").clear();
    }
}

impl Default for MutationTracker {
    fn default() -> Self {
        Self::new()
    }
}

fn same_identity(row: &Row, payload: &Row) -> bool {
    match (row.get(ID_COLUMN), payload.get(ID_COLUMN)) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}
