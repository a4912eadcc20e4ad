//! Error taxonomy for the synchronization layer.

use thiserror::Error;

/// Errors surfaced by the synchronization layer.
///
/// `Clone` so a single failure can be handed to every caller awaiting a
/// deduplicated request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    /// Transient transport failure. Retried with backoff before surfacing.
    #[error("network error: {message}")]
    Network { message: String },

    /// A bounded wait elapsed. Classified as transient, like [`SyncError::Network`].
    #[error("request timed out after {waited_ms}ms")]
    Timeout { waited_ms: u64 },

    /// The backend refused the request (constraint violation, malformed
    /// payload). Never retried; rolls back the optimistic prediction on
    /// the write path.
    #[error("backend rejected {operation} on `{table}`: {message}")]
    Rejected {
        table: String,
        operation: String,
        message: String,
    },

    /// A value was served past its hard TTL because no revalidation has
    /// succeeded. Degraded-data warning, not a hard failure.
    #[error("serving `{key}` past its hard TTL without a successful revalidation")]
    StaleRead { key: String },
}

impl SyncError {
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    pub fn timeout(waited_ms: u64) -> Self {
        Self::Timeout { waited_ms }
    }

    pub fn rejected(
        table: impl Into<String>,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Rejected {
            table: table.into(),
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn stale_read(key: impl Into<String>) -> Self {
        Self::StaleRead { key: key.into() }
    }

    /// Whether another attempt with backoff may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network { .. } | Self::Timeout { .. })
    }
}
