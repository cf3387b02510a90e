//! Error types for the query dispatch service.
//!
//! This module defines all error types using `thiserror` for ergonomic error handling.
//! Every variant belongs to one of four kinds (see [`ErrorKind`]) which decide
//! the HTTP status and whether a caller may retry.

use crate::models::BackendType;
use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

/// Coarse error classification exposed to callers as `type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Missing or malformed request fields. Never retried.
    Validation,
    /// Write attempted under read-only policy, or stacked statements.
    DisallowedOperation,
    /// Backend unreachable or authentication failed.
    Connection,
    /// Backend reported a query failure.
    Execution,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::DisallowedOperation => "disallowed_operation",
            Self::Connection => "connection",
            Self::Execution => "execution",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Invalid request: {message}")]
    Validation { message: String },

    #[error("Operation not allowed: {operation} - {reason}")]
    DisallowedOperation { operation: String, reason: String },

    #[error("Connection failed: {message}")]
    Connection { message: String, suggestion: String },

    #[error("Query failed: {message}")]
    Execution {
        message: String,
        /// SQLSTATE for SQL backends, server error code for MongoDB/PostgREST
        code: Option<String>,
        suggestion: String,
    },

    #[error("Malformed query: {message} (near `{fragment}`)")]
    MalformedQuery { message: String, fragment: String },

    #[error("Timeout: {operation} exceeded {limit_ms}ms")]
    Timeout { operation: String, limit_ms: u64 },

    #[error("Internal error: {message}")]
    Internal { message: String },

    #[error("{backend}: {source}")]
    Backend {
        backend: BackendType,
        table: Option<String>,
        query_preview: String,
        #[source]
        source: Box<DbError>,
    },
}

impl DbError {
    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Create a disallowed operation error.
    pub fn disallowed(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::DisallowedOperation {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Create a connection error with a helpful suggestion.
    pub fn connection(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create an execution error with an optional backend error code.
    pub fn execution(
        message: impl Into<String>,
        code: Option<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self::Execution {
            message: message.into(),
            code,
            suggestion: suggestion.into(),
        }
    }

    /// Create a malformed query error pointing at the offending fragment.
    pub fn malformed(message: impl Into<String>, fragment: impl Into<String>) -> Self {
        Self::MalformedQuery {
            message: message.into(),
            fragment: fragment.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, limit: std::time::Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            limit_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Wrap this error with the backend it occurred on.
    ///
    /// Already-wrapped errors are returned unchanged.
    pub fn with_backend(
        self,
        backend: BackendType,
        table: Option<&str>,
        query_preview: impl Into<String>,
    ) -> Self {
        match self {
            Self::Backend { .. } => self,
            other => Self::Backend {
                backend,
                table: table.map(String::from),
                query_preview: query_preview.into(),
                source: Box::new(other),
            },
        }
    }

    /// The innermost error, with backend context stripped.
    pub fn root(&self) -> &DbError {
        match self {
            Self::Backend { source, .. } => source.root(),
            other => other,
        }
    }

    /// The error kind, used for the HTTP status and the `type` field.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation { .. } => ErrorKind::Validation,
            Self::DisallowedOperation { .. } => ErrorKind::DisallowedOperation,
            Self::Connection { .. } => ErrorKind::Connection,
            Self::Execution { .. }
            | Self::MalformedQuery { .. }
            | Self::Timeout { .. }
            | Self::Internal { .. } => ErrorKind::Execution,
            Self::Backend { source, .. } => source.kind(),
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self.root() {
            Self::Connection { suggestion, .. } => Some(suggestion),
            Self::Execution { suggestion, .. } => Some(suggestion),
            Self::Timeout { .. } => {
                Some("Consider narrowing the query or raising the query timeout")
            }
            _ => None,
        }
    }

    /// Backend error code (SQLSTATE, Mongo or PostgREST code), if any.
    pub fn code(&self) -> Option<&str> {
        match self.root() {
            Self::Execution { code, .. } => code.as_deref(),
            _ => None,
        }
    }

    /// Check if this error is retryable.
    ///
    /// The dispatcher never retries; this is advice for callers.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.root(),
            Self::Connection { .. } | Self::Timeout { .. }
        )
    }

    /// HTTP status for this error.
    pub fn status_code(&self) -> StatusCode {
        match self.kind() {
            ErrorKind::Validation | ErrorKind::DisallowedOperation => StatusCode::BAD_REQUEST,
            ErrorKind::Connection | ErrorKind::Execution => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Convert sqlx errors to DbError.
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => DbError::connection(
                msg.to_string(),
                "Check the connection string format and credentials",
            ),
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                DbError::execution(
                    db_err.message(),
                    code,
                    "Check the SQL syntax and referenced objects",
                )
            }
            sqlx::Error::RowNotFound => DbError::execution(
                "No rows returned",
                None,
                "Verify the query conditions match existing data",
            ),
            sqlx::Error::PoolTimedOut => DbError::connection(
                "Timed out acquiring a connection from the pool",
                "The database may be overloaded; retry later",
            ),
            sqlx::Error::PoolClosed => DbError::connection(
                "Connection pool is closed",
                "Retry the request to open a new pool",
            ),
            sqlx::Error::Io(io_err) => DbError::connection(
                format!("I/O error: {}", io_err),
                "Check network connectivity and database server status",
            ),
            sqlx::Error::Tls(tls_err) => DbError::connection(
                format!("TLS error: {}", tls_err),
                "Verify TLS configuration and certificates",
            ),
            sqlx::Error::Protocol(msg) => DbError::connection(
                format!("Protocol error: {}", msg),
                "Check database server compatibility",
            ),
            sqlx::Error::TypeNotFound { type_name } => DbError::execution(
                format!("Type not found: {}", type_name),
                None,
                "Check the types referenced by the query",
            ),
            sqlx::Error::ColumnNotFound(col) => DbError::execution(
                format!("Column not found: {}", col),
                None,
                "Check the column names referenced by the query",
            ),
            sqlx::Error::ColumnIndexOutOfBounds { index, len } => DbError::internal(format!(
                "Column index {} out of bounds (len: {})",
                index, len
            )),
            sqlx::Error::ColumnDecode { index, source } => {
                DbError::internal(format!("Failed to decode column {}: {}", index, source))
            }
            sqlx::Error::Decode(source) => DbError::internal(format!("Decode error: {}", source)),
            sqlx::Error::AnyDriverError(err) => DbError::connection(
                format!("Driver error: {}", err),
                "Check database driver configuration",
            ),
            sqlx::Error::WorkerCrashed => DbError::internal("Database worker crashed"),
            _ => DbError::internal(format!("Unknown database error: {}", err)),
        }
    }
}

/// Convert MongoDB driver errors to DbError.
impl From<mongodb::error::Error> for DbError {
    fn from(err: mongodb::error::Error) -> Self {
        use mongodb::error::ErrorKind as MongoKind;

        match err.kind.as_ref() {
            MongoKind::Command(cmd) => DbError::execution(
                cmd.message.clone(),
                Some(cmd.code.to_string()),
                "Check the pipeline stages and operators",
            ),
            MongoKind::Authentication { .. } => DbError::connection(
                err.to_string(),
                "Check the username, password and authSource in the connection URL",
            ),
            MongoKind::ServerSelection { .. } | MongoKind::Io(_) | MongoKind::DnsResolve { .. } => {
                DbError::connection(
                    err.to_string(),
                    "Check network connectivity and that the MongoDB server is running",
                )
            }
            MongoKind::InvalidArgument { .. } => DbError::execution(
                err.to_string(),
                None,
                "Check the filter or pipeline syntax",
            ),
            _ => DbError::execution(err.to_string(), None, "Check the query against the collection"),
        }
    }
}

/// Convert HTTP client errors (Supabase REST) to DbError.
impl From<reqwest::Error> for DbError {
    fn from(err: reqwest::Error) -> Self {
        // URLs never reach messages
        let err = err.without_url();
        if err.is_timeout() {
            DbError::connection(
                "Supabase request timed out",
                "Check that the Supabase project is reachable",
            )
        } else if err.is_connect() || err.is_request() {
            DbError::connection(
                format!("Supabase request failed: {}", err),
                "Check the Supabase project URL and network connectivity",
            )
        } else if err.is_decode() {
            DbError::execution(
                format!("Unexpected Supabase response: {}", err),
                None,
                "Check that the endpoint returns JSON rows",
            )
        } else {
            DbError::execution(
                format!("Supabase error: {}", err),
                err.status().map(|s| s.as_u16().to_string()),
                "Check the Supabase project configuration",
            )
        }
    }
}

/// Result type alias for dispatch operations.
pub type DbResult<T> = Result<T, DbError>;

/// JSON body of an error response.
#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    error: String,
    #[serde(rename = "type")]
    kind: ErrorKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    backend: Option<BackendType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    suggestion: Option<&'a str>,
    retryable: bool,
}

impl IntoResponse for DbError {
    fn into_response(self) -> Response {
        let backend = match &self {
            DbError::Backend { backend, .. } => Some(*backend),
            _ => None,
        };
        let body = ErrorBody {
            error: self.to_string(),
            kind: self.kind(),
            backend,
            code: self.code(),
            suggestion: self.suggestion(),
            retryable: self.is_retryable(),
        };
        (self.status_code(), Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_error_display() {
        let err = DbError::connection("Failed to connect", "Check credentials");
        assert!(err.to_string().contains("Connection failed"));
    }

    #[test]
    fn test_error_suggestion() {
        let err = DbError::execution(
            "Syntax error",
            Some("42601".to_string()),
            "Check SQL syntax",
        );
        assert_eq!(err.suggestion(), Some("Check SQL syntax"));
        assert_eq!(err.code(), Some("42601"));
    }

    #[test]
    fn test_timeout_message_keeps_sub_second_limits() {
        let err = DbError::timeout("query", Duration::from_millis(250));
        assert_eq!(err.to_string(), "Timeout: query exceeded 250ms");
    }

    #[test]
    fn test_error_retryable() {
        assert!(DbError::timeout("query", Duration::from_secs(30)).is_retryable());
        assert!(DbError::connection("err", "sugg").is_retryable());
        assert!(!DbError::disallowed("DELETE", "read-only").is_retryable());
        assert!(!DbError::execution("bad", None, "fix").is_retryable());
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(DbError::validation("x").kind(), ErrorKind::Validation);
        assert_eq!(
            DbError::disallowed("DROP", "x").kind(),
            ErrorKind::DisallowedOperation
        );
        assert_eq!(DbError::connection("x", "y").kind(), ErrorKind::Connection);
        assert_eq!(DbError::malformed("x", "y").kind(), ErrorKind::Execution);
        assert_eq!(DbError::timeout("q", Duration::from_secs(1)).kind(), ErrorKind::Execution);
    }

    #[test]
    fn test_backend_context_preserves_kind() {
        let err = DbError::connection("refused", "start the server").with_backend(
            BackendType::Postgres,
            Some("events"),
            "SELECT 1",
        );
        assert_eq!(err.kind(), ErrorKind::Connection);
        assert!(err.is_retryable());
        assert_eq!(err.suggestion(), Some("start the server"));
        assert!(err.to_string().starts_with("postgres: Connection failed"));
    }

    #[test]
    fn test_backend_context_not_nested_twice() {
        let err = DbError::validation("x")
            .with_backend(BackendType::MySql, None, "a")
            .with_backend(BackendType::Postgres, None, "b");
        match err {
            DbError::Backend { backend, .. } => assert_eq!(backend, BackendType::MySql),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(
            DbError::validation("x").status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            DbError::disallowed("x", "y").status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            DbError::connection("x", "y").status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            DbError::execution("x", None, "y").status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_kind_serializes_snake_case() {
        let json = serde_json::to_value(ErrorKind::DisallowedOperation).unwrap();
        assert_eq!(json, "disallowed_operation");
    }

    #[test]
    fn test_sqlx_pool_timeout_is_connection_error() {
        let err: DbError = sqlx::Error::PoolTimedOut.into();
        assert_eq!(err.kind(), ErrorKind::Connection);
    }

    #[test]
    fn test_sqlx_row_not_found_is_execution_error() {
        let err: DbError = sqlx::Error::RowNotFound.into();
        assert_eq!(err.kind(), ErrorKind::Execution);
    }
}
