use common::Xid;
use thiserror::Error;

use crate::{BranchKey, Sequence};

/// Errors that can occur when interacting with the transaction stores.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The requested row does not exist.
    #[error("{kind} '{key}' not found")]
    RowNotFound { kind: &'static str, key: String },

    /// A row with the same key already exists.
    #[error("{kind} '{key}' already exists")]
    DuplicateRow { kind: &'static str, key: String },

    /// The row carries a pending branch of another global transaction.
    #[error("{kind} '{key}' is locked by pending transaction {holder}")]
    ResourceBusy {
        kind: &'static str,
        key: String,
        holder: Xid,
    },

    /// The branch was already rolled back; late work is refused.
    #[error("branch {0} has already been rolled back")]
    Fenced(BranchKey),

    /// The branch already applied its change.
    #[error("branch {0} has already been applied")]
    DuplicateBranch(BranchKey),

    /// A concurrency conflict occurred when appending journal entries.
    #[error(
        "Concurrency conflict for transaction {xid}: expected sequence {expected}, found {actual}"
    )]
    ConcurrencyConflict {
        xid: Xid,
        expected: Sequence,
        actual: Sequence,
    },

    /// Journal entries failed validation before appending.
    #[error("Invalid journal append: {0}")]
    InvalidAppend(String),

    /// A stored value could not be interpreted.
    #[error("Invalid stored data: {0}")]
    InvalidData(String),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Outcome of a mutation: either the store failed or the change itself was rejected.
#[derive(Debug, Error)]
pub enum MutateError<E> {
    /// The row change was rejected by the caller's validation.
    #[error("change rejected: {0}")]
    Rejected(E),

    /// The store could not perform the mutation.
    #[error(transparent)]
    Store(#[from] StoreError),
}
