//! Saga error types.

use std::time::Duration;

use common::{BranchId, ErrorCode, Xid};
use domain::DomainError;
use thiserror::Error;
use tx_store::StoreError;

use crate::context::ContextConflictError;
use crate::state::TransactionStatus;

/// Errors that can occur during saga operations.
#[derive(Debug, Error)]
pub enum SagaError {
    /// Malformed input, rejected before any branch started.
    #[error("{0}")]
    Validation(String),

    /// A branch refused its work. The message is the participant's reason, verbatim.
    #[error("{message}")]
    BranchFailed {
        step: String,
        participant: String,
        code: ErrorCode,
        message: String,
    },

    /// A branch did not answer within the branch timeout.
    #[error("branch '{step}' at {participant} timed out after {timeout:?}")]
    BranchTimeout {
        step: String,
        participant: String,
        timeout: Duration,
    },

    /// Commit or rollback of some branches kept failing.
    #[error("transaction {xid} has unresolved branches {branches:?}; manual intervention required")]
    Unresolved { xid: Xid, branches: Vec<BranchId> },

    /// The transaction is in the wrong state for the requested operation.
    #[error("Invalid transaction state: expected {expected}, actual {actual}")]
    InvalidState {
        expected: String,
        actual: TransactionStatus,
    },

    /// No participant is registered under this resource kind.
    #[error("Unknown participant: {0}")]
    UnknownParticipant(String),

    /// The transaction does not exist.
    #[error("Transaction not found: {0}")]
    TransactionNotFound(Xid),

    /// The saga was aborted by its own logic after branches applied.
    #[error("{0}")]
    Aborted(String),

    /// The task running the saga panicked or was cancelled.
    #[error("saga task failed: {0}")]
    TaskFailed(String),

    #[error(transparent)]
    ContextConflict(#[from] ContextConflictError),

    /// Domain error.
    #[error("Domain error: {0}")]
    Domain(DomainError),

    /// Store error.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<DomainError> for SagaError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::Validation(message) => SagaError::Validation(message),
            other => SagaError::Domain(other),
        }
    }
}

impl SagaError {
    /// Maps the error onto the wire taxonomy.
    pub fn code(&self) -> ErrorCode {
        match self {
            SagaError::Validation(_) => ErrorCode::ValidationError,
            SagaError::BranchFailed { code, .. } => *code,
            SagaError::BranchTimeout { .. } => ErrorCode::BranchTimeout,
            SagaError::Unresolved { .. } => ErrorCode::DataInconsistency,
            SagaError::InvalidState { .. } => ErrorCode::TransactionFinished,
            SagaError::TransactionNotFound(_) => ErrorCode::NotFound,
            SagaError::Aborted(_) => ErrorCode::BusinessRuleViolation,
            SagaError::ContextConflict(_) => ErrorCode::ContextConflict,
            SagaError::Domain(err) => err.code(),
            SagaError::UnknownParticipant(_)
            | SagaError::TaskFailed(_)
            | SagaError::Store(_)
            | SagaError::Serialization(_) => ErrorCode::InternalError,
        }
    }
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;
