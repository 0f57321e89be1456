//! Error types for cursorway services

use std::fmt;

/// Result type alias using CursorwayError
pub type Result<T> = std::result::Result<T, CursorwayError>;

/// Main error type for cursorway services
#[derive(Debug, thiserror::Error)]
pub enum CursorwayError {
    /// Resource not found
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Invalid request/argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Fetch/describe before any execute, or execute without text and nothing to repeat
    #[error("Empty query")]
    NoQuery,

    /// A parameter carried a type code outside the known set
    #[error("unknown type code {0:?}")]
    UnknownTypeCode(String),

    /// Query execution error reported by the engine
    #[error("{0}")]
    Execution(ExecutionError),

    /// Query cancelled
    #[error("Query was cancelled")]
    QueryCancelled,

    /// Database error outside a running execution (open, connect, transaction control)
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CursorwayError {
    /// Create an internal error from any error type
    pub fn internal<E: fmt::Display>(err: E) -> Self {
        CursorwayError::Internal(err.to_string())
    }

    /// Get the error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            CursorwayError::NotFound(_) => "NOT_FOUND",
            CursorwayError::InvalidArgument(_) => "INVALID_ARGUMENT",
            CursorwayError::NoQuery => "NO_QUERY",
            CursorwayError::UnknownTypeCode(_) => "UNKNOWN_TYPE_CODE",
            CursorwayError::Execution(_) => "QUERY_FAILED",
            CursorwayError::QueryCancelled => "CANCELLED",
            CursorwayError::DatabaseError(_) => "DATABASE_ERROR",
            CursorwayError::ConfigError(_) => "CONFIG_ERROR",
            CursorwayError::SerializationError(_) => "SERIALIZATION_ERROR",
            CursorwayError::Internal(_) => "INTERNAL",
        }
    }

    /// Whether the client sent something we could not accept
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            CursorwayError::InvalidArgument(_)
                | CursorwayError::NoQuery
                | CursorwayError::UnknownTypeCode(_)
                | CursorwayError::SerializationError(_)
        )
    }
}

/// Error captured from a running execution.
///
/// `cause` carries the engine's detailed rendering and ends up in the wire `trace` field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionError {
    pub message: String,
    pub cause: Option<String>,
}

impl ExecutionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            cause: None,
        }
    }

    pub fn with_cause(message: impl Into<String>, cause: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            cause: Some(cause.into()),
        }
    }
}

impl fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl From<ExecutionError> for CursorwayError {
    fn from(err: ExecutionError) -> Self {
        CursorwayError::Execution(err)
    }
}

// Implement conversions from common error types
impl From<serde_json::Error> for CursorwayError {
    fn from(err: serde_json::Error) -> Self {
        CursorwayError::SerializationError(err.to_string())
    }
}

impl From<std::io::Error> for CursorwayError {
    fn from(err: std::io::Error) -> Self {
        CursorwayError::Internal(format!("IO error: {}", err))
    }
}

impl From<config::ConfigError> for CursorwayError {
    fn from(err: config::ConfigError) -> Self {
        CursorwayError::ConfigError(err.to_string())
    }
}
