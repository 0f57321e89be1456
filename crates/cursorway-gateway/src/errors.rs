//! Error responses for the HTTP API
//!
//! Every handler failure becomes an [`ApiError`], which picks the HTTP status
//! and renders the `{error, trace?, kind?}` payload clients expect.

use crate::metrics;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use cursorway_common::{CursorwayError, ExecutionError};
use serde::Serialize;
use std::fmt;
use tracing::{error, warn};

/// Wire `kind` for failures of transaction control operations
pub const OPERATION_KIND: &str = "O";

/// Error category for classification and metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Malformed body, unknown type code, bad limit
    Request,
    /// Fetch/execute with no query to run
    NoQuery,
    /// Unknown data source, connection or cursor
    NotFound,
    /// Error captured from a query execution
    Execution,
    /// Commit/rollback failure
    Operation,
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Request => write!(f, "request"),
            ErrorCategory::NoQuery => write!(f, "no_query"),
            ErrorCategory::NotFound => write!(f, "not_found"),
            ErrorCategory::Execution => write!(f, "execution"),
            ErrorCategory::Operation => write!(f, "operation"),
            ErrorCategory::Internal => write!(f, "internal"),
        }
    }
}

impl ErrorCategory {
    pub fn status(self) -> StatusCode {
        match self {
            ErrorCategory::Request | ErrorCategory::NoQuery => StatusCode::BAD_REQUEST,
            ErrorCategory::NotFound => StatusCode::NOT_FOUND,
            ErrorCategory::Execution | ErrorCategory::Operation => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            ErrorCategory::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Wire form of an error
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<&'static str>,
}

/// A classified handler failure
#[derive(Debug, thiserror::Error)]
#[error("{category}: {message}")]
pub struct ApiError {
    pub category: ErrorCategory,
    pub message: String,
    pub trace: Option<String>,
}

impl ApiError {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
            trace: None,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Request, message)
    }

    pub fn internal(err: impl fmt::Display) -> Self {
        Self::new(ErrorCategory::Internal, err.to_string())
    }

    /// An execution error taken from a cursor's error slot
    pub fn execution(err: ExecutionError) -> Self {
        Self {
            category: ErrorCategory::Execution,
            message: err.message,
            trace: err.cause,
        }
    }

    /// A failed commit or rollback
    pub fn operation(err: CursorwayError) -> Self {
        match err {
            CursorwayError::NotFound(_) => err.into(),
            other => Self::new(ErrorCategory::Operation, other.to_string()),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.category.status()
    }
}

impl From<CursorwayError> for ApiError {
    fn from(err: CursorwayError) -> Self {
        match err {
            CursorwayError::NotFound(what) => Self::new(ErrorCategory::NotFound, what),
            CursorwayError::NoQuery => Self::new(ErrorCategory::NoQuery, err.to_string()),
            CursorwayError::Execution(execution) => Self::execution(execution),
            CursorwayError::QueryCancelled | CursorwayError::DatabaseError(_) => {
                Self::new(ErrorCategory::Execution, err.to_string())
            }
            ref other if other.is_client_error() => Self::bad_request(other.to_string()),
            other => Self::internal(other),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        metrics::record_api_error(&self.category.to_string());
        let status = self.status();

        match self.category {
            ErrorCategory::NotFound => {
                warn!(status = status.as_u16(), "{}", self.message);
                return status.into_response();
            }
            ErrorCategory::Internal => error!(status = status.as_u16(), "{}", self.message),
            _ => warn!(status = status.as_u16(), category = %self.category, "{}", self.message),
        }

        let kind = (self.category == ErrorCategory::Operation).then_some(OPERATION_KIND);
        let body = ErrorBody {
            error: self.message,
            trace: self.trace,
            kind,
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let cases = [
            (CursorwayError::NoQuery, StatusCode::BAD_REQUEST),
            (CursorwayError::UnknownTypeCode("Q".into()), StatusCode::BAD_REQUEST),
            (CursorwayError::InvalidArgument("limit".into()), StatusCode::BAD_REQUEST),
            (CursorwayError::NotFound("cursor".into()), StatusCode::NOT_FOUND),
            (
                CursorwayError::Execution(ExecutionError::new("boom")),
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (CursorwayError::Internal("oops".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status(), status);
        }
    }

    #[test]
    fn test_execution_error_carries_trace() {
        let err = ApiError::execution(ExecutionError::with_cause("bad column", "Binder Error"));
        assert_eq!(err.category, ErrorCategory::Execution);
        assert_eq!(err.message, "bad column");
        assert_eq!(err.trace.as_deref(), Some("Binder Error"));
    }

    #[test]
    fn test_operation_errors_keep_not_found() {
        let err = ApiError::operation(CursorwayError::DatabaseError("busy".into()));
        assert_eq!(err.category, ErrorCategory::Operation);
        let err = ApiError::operation(CursorwayError::NotFound("connection".into()));
        assert_eq!(err.category, ErrorCategory::NotFound);
    }
}
