//! Structured result envelope shared by every service boundary.

use serde::{Deserialize, Serialize};

/// Machine-readable error codes carried across service boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    Ok,
    /// Malformed input, rejected before any work started.
    ValidationError,
    NotFound,
    /// Not enough stock or balance.
    InsufficientResource,
    BusinessRuleViolation,
    /// The row is held by a pending branch of another transaction.
    ResourceBusy,
    BranchTimeout,
    /// The branch could not be reached at all.
    BranchUnavailable,
    /// The branch was already rolled back and refuses late work.
    TransactionFinished,
    ContextConflict,
    /// A commit or rollback could not be completed; manual intervention required.
    DataInconsistency,
    InternalError,
}

impl ErrorCode {
    /// Returns the wire name of the code.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Ok => "OK",
            ErrorCode::ValidationError => "VALIDATION_ERROR",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::InsufficientResource => "INSUFFICIENT_RESOURCE",
            ErrorCode::BusinessRuleViolation => "BUSINESS_RULE_VIOLATION",
            ErrorCode::ResourceBusy => "RESOURCE_BUSY",
            ErrorCode::BranchTimeout => "BRANCH_TIMEOUT",
            ErrorCode::BranchUnavailable => "BRANCH_UNAVAILABLE",
            ErrorCode::TransactionFinished => "TRANSACTION_FINISHED",
            ErrorCode::ContextConflict => "CONTEXT_CONFLICT",
            ErrorCode::DataInconsistency => "DATA_INCONSISTENCY",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }

    /// Returns true for failures decided by business rules rather than infrastructure.
    pub fn is_business(&self) -> bool {
        matches!(
            self,
            ErrorCode::ValidationError
                | ErrorCode::NotFound
                | ErrorCode::InsufficientResource
                | ErrorCode::BusinessRuleViolation
        )
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Response envelope: `{success, code, message, data}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommonResult<T> {
    pub success: bool,
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> CommonResult<T> {
    /// Successful result carrying data.
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            code: ErrorCode::Ok,
            message: "success".to_string(),
            data: Some(data),
        }
    }

    /// Successful result with a custom message.
    pub fn ok_with_message(data: T, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::ok(data)
        }
    }

    /// Failed result.
    pub fn failed(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            success: false,
            code,
            message: message.into(),
            data: None,
        }
    }
}
