//! Error types for ironstep.

use thiserror::Error;

use crate::execution::ExecutionKey;

/// A `Result` alias with [`enum@Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while running transactional steps.
///
/// User functions report their own failures through their own error type,
/// which only needs `From<ironstep::Error>`. Those errors never pass through
/// this enum, so the caller gets them back exactly as the function raised them.
#[derive(Debug, Error)]
pub enum Error {
    /// Failed to serialize a step output or deserialize a recorded one.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// PostgreSQL storage error.
    ///
    /// Preserves the full `sqlx::Error` for matching on specific database
    /// error conditions (connection timeout, serialization failure, etc.).
    #[cfg(feature = "postgres")]
    #[error("postgres error: {0}")]
    Postgres(#[from] sqlx::Error),

    /// An output is already recorded for this execution.
    ///
    /// Raised by the ledger insert when another attempt won the race. The
    /// coordinator recovers from it by rolling back and re-checking the
    /// ledger; it only reaches callers that use a store directly.
    #[error("output already recorded for {0}")]
    Conflict(ExecutionKey),

    /// No workflow id or function number is bound for the current task.
    ///
    /// The data source is being used outside a workflow attempt.
    #[error("missing execution identity: {0}")]
    MissingExecutionIdentity(&'static str),

    /// The transaction handle was accessed outside an active step, or after
    /// the step that owned it released it.
    #[error("no active transaction: transactional client used outside a transaction step")]
    MissingContext,

    /// An isolation level string did not name a known level.
    #[error("invalid isolation level: {0}")]
    InvalidIsolationLevel(String),

    /// A ledger row could not be decoded.
    #[error("invalid output record for {key}: {reason}")]
    InvalidRecord {
        /// The execution the row belongs to.
        key: ExecutionKey,
        /// What was wrong with the row.
        reason: String,
    },

    /// The data source is not initialized, or was already destroyed.
    #[error("data source {name} is {state}")]
    Unavailable {
        /// The data source name.
        name: String,
        /// The lifecycle state it was found in.
        state: &'static str,
    },
}

impl Error {
    /// Returns `true` for [`Error::Conflict`].
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict(_))
    }
}
