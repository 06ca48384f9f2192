//! API error types with HTTP response mapping.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use common::{CommonResult, ErrorCode};
use domain::DomainError;
use saga::{BranchError, SagaError};

/// API-level error type that maps to HTTP responses.
///
/// Every variant renders as a failed `CommonResult` carrying an [`ErrorCode`].
#[derive(Debug)]
pub enum ApiError {
    /// Resource not found.
    NotFound(String),
    /// Bad request from the client.
    BadRequest(String),
    /// Participant failure.
    Branch(BranchError),
    /// Domain logic error.
    Domain(DomainError),
    /// Saga execution error.
    Saga(SagaError),
}

impl ApiError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ApiError::NotFound(_) => ErrorCode::NotFound,
            ApiError::BadRequest(_) => ErrorCode::ValidationError,
            ApiError::Branch(err) => err.code,
            ApiError::Domain(err) => err.code(),
            ApiError::Saga(err) => err.code(),
        }
    }

    fn message(&self) -> String {
        match self {
            ApiError::NotFound(msg) | ApiError::BadRequest(msg) => msg.clone(),
            ApiError::Branch(err) => err.message.clone(),
            ApiError::Domain(err) => err.to_string(),
            ApiError::Saga(err) => err.to_string(),
        }
    }
}

/// HTTP status for an error code.
pub fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::Ok => StatusCode::OK,
        ErrorCode::ValidationError => StatusCode::BAD_REQUEST,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::InsufficientResource | ErrorCode::BusinessRuleViolation => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        ErrorCode::ResourceBusy | ErrorCode::TransactionFinished | ErrorCode::ContextConflict => {
            StatusCode::CONFLICT
        }
        ErrorCode::BranchTimeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorCode::BranchUnavailable => StatusCode::BAD_GATEWAY,
        ErrorCode::DataInconsistency | ErrorCode::InternalError => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = self.code();
        let message = match code {
            ErrorCode::InternalError => {
                tracing::error!(error = %self.message(), "internal server error");
                "internal error".to_string()
            }
            ErrorCode::DataInconsistency => {
                tracing::error!(error = %self.message(), "request left inconsistent data");
                self.message()
            }
            _ => self.message(),
        };

        metrics::counter!("api_errors_total", "code" => code.as_str()).increment(1);

        let body = CommonResult::<()>::failed(code, message);
        (status_for(code), Json(body)).into_response()
    }
}

impl From<DomainError> for ApiError {
    fn from(err: DomainError) -> Self {
        ApiError::Domain(err)
    }
}

impl From<SagaError> for ApiError {
    fn from(err: SagaError) -> Self {
        ApiError::Saga(err)
    }
}

impl From<BranchError> for ApiError {
    fn from(err: BranchError) -> Self {
        ApiError::Branch(err)
    }
}
