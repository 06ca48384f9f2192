//! Domain error types.

use common::ErrorCode;
use thiserror::Error;
use tx_store::{MutateError, StoreError};

use crate::order::OrderStatus;

/// Errors that can occur during domain operations.
#[derive(Debug, Error)]
pub enum DomainError {
    /// Malformed input.
    #[error("{0}")]
    Validation(String),

    /// The addressed row does not exist.
    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },

    /// Not enough stock or balance for the requested decrease.
    #[error("insufficient {what}: requested {requested}, available {available}")]
    Insufficient {
        what: &'static str,
        requested: String,
        available: String,
    },

    /// The order status cannot move as requested.
    #[error("Invalid status transition from {from} to {to}")]
    InvalidTransition { from: OrderStatus, to: OrderStatus },

    /// An error occurred in the underlying store.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl DomainError {
    /// Creates a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Maps the error onto the wire taxonomy.
    pub fn code(&self) -> ErrorCode {
        match self {
            DomainError::Validation(_) => ErrorCode::ValidationError,
            DomainError::NotFound { .. } => ErrorCode::NotFound,
            DomainError::Insufficient { .. } => ErrorCode::InsufficientResource,
            DomainError::InvalidTransition { .. } => ErrorCode::BusinessRuleViolation,
            DomainError::Store(StoreError::RowNotFound { .. }) => ErrorCode::NotFound,
            DomainError::Store(StoreError::ResourceBusy { .. }) => ErrorCode::ResourceBusy,
            DomainError::Store(StoreError::Fenced(_)) => ErrorCode::TransactionFinished,
            DomainError::Store(_) => ErrorCode::InternalError,
        }
    }
}

impl From<MutateError<DomainError>> for DomainError {
    fn from(err: MutateError<DomainError>) -> Self {
        match err {
            MutateError::Rejected(err) => err,
            MutateError::Store(StoreError::RowNotFound { kind, key }) => {
                DomainError::NotFound { kind, id: key }
            }
            MutateError::Store(err) => DomainError::Store(err),
        }
    }
}

/// Result type for domain operations.
pub type Result<T> = std::result::Result<T, DomainError>;
