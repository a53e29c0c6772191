//! Error types for dynamic datasource routing and local transactions.
//!
//! This module defines all error types using `thiserror` for ergonomic error handling.
//! Every variant maps onto an [`ErrorKind`], which is what transactional scopes match
//! against when deciding between commit and rollback.

use thiserror::Error;

/// Coarse classification of a [`DbError`].
///
/// Used by `rollback_for` / `no_rollback_for` lists on transactional scopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    UnresolvableSelector,
    UnknownDataSource,
    IllegalTransactionState,
    PartialFinalize,
    ConnectionAcquisition,
    Connection,
    Database,
    Timeout,
    InvalidInput,
    Internal,
}

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Unresolvable selector '{selector}': {reason}")]
    UnresolvableSelector { selector: String, reason: String },

    #[error("Unknown datasource '{key}': {hint}")]
    UnknownDataSource { key: String, hint: String },

    #[error("Illegal transaction state: {message}")]
    IllegalTransactionState { message: String },

    #[error(
        "Partial finalize of transaction {xid}: {succeeded} connection(s) finalized, {failed} failed: {source}"
    )]
    PartialFinalize {
        xid: String,
        succeeded: usize,
        failed: usize,
        /// First failure observed while finalizing.
        source: Box<DbError>,
        /// Error raised by the unit of work, when finalize ran because of it.
        cause: Option<Box<DbError>>,
    },

    #[error("Failed to acquire connection for '{key}': {message}")]
    ConnectionAcquisition { key: String, message: String },

    #[error("Connection failed: {message}")]
    Connection { message: String, suggestion: String },

    #[error("Database error: {message}")]
    Database {
        message: String,
        /// e.g., "42P01" for undefined table
        sql_state: Option<String>,
        suggestion: String,
    },

    #[error("Timeout: {operation} exceeded {elapsed_secs}s")]
    Timeout {
        operation: String,
        elapsed_secs: u32,
    },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl DbError {
    /// Create an unresolvable selector error.
    pub fn unresolvable_selector(selector: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::UnresolvableSelector {
            selector: selector.into(),
            reason: reason.into(),
        }
    }

    /// Create an unknown datasource error with a hint.
    pub fn unknown_data_source(key: impl Into<String>, hint: impl Into<String>) -> Self {
        Self::UnknownDataSource {
            key: key.into(),
            hint: hint.into(),
        }
    }

    /// Create an illegal transaction state error.
    pub fn illegal_transaction_state(message: impl Into<String>) -> Self {
        Self::IllegalTransactionState {
            message: message.into(),
        }
    }

    /// Create a partial finalize error from the first failure.
    pub fn partial_finalize(
        xid: impl Into<String>,
        succeeded: usize,
        failed: usize,
        source: DbError,
    ) -> Self {
        Self::PartialFinalize {
            xid: xid.into(),
            succeeded,
            failed,
            source: Box::new(source),
            cause: None,
        }
    }

    /// Create a connection acquisition error.
    pub fn connection_acquisition(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ConnectionAcquisition {
            key: key.into(),
            message: message.into(),
        }
    }

    /// Create a connection error with a helpful suggestion.
    pub fn connection(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create a database error with optional SQL state.
    pub fn database(
        message: impl Into<String>,
        sql_state: Option<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self::Database {
            message: message.into(),
            sql_state,
            suggestion: suggestion.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, elapsed_secs: u32) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed_secs,
        }
    }

    /// Create an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Attach the unit-of-work error that led to a failed finalize.
    ///
    /// Only `PartialFinalize` carries a cause; other errors are returned unchanged.
    pub fn with_cause(self, cause: DbError) -> Self {
        match self {
            Self::PartialFinalize {
                xid,
                succeeded,
                failed,
                source,
                ..
            } => Self::PartialFinalize {
                xid,
                succeeded,
                failed,
                source,
                cause: Some(Box::new(cause)),
            },
            other => other,
        }
    }

    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnresolvableSelector { .. } => ErrorKind::UnresolvableSelector,
            Self::UnknownDataSource { .. } => ErrorKind::UnknownDataSource,
            Self::IllegalTransactionState { .. } => ErrorKind::IllegalTransactionState,
            Self::PartialFinalize { .. } => ErrorKind::PartialFinalize,
            Self::ConnectionAcquisition { .. } => ErrorKind::ConnectionAcquisition,
            Self::Connection { .. } => ErrorKind::Connection,
            Self::Database { .. } => ErrorKind::Database,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::InvalidInput { .. } => ErrorKind::InvalidInput,
            Self::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Connection { suggestion, .. } => Some(suggestion),
            Self::Database { suggestion, .. } => Some(suggestion),
            Self::UnknownDataSource { hint, .. } => Some(hint),
            _ => None,
        }
    }

    /// The unit-of-work error attached to a partial finalize, if any.
    pub fn cause(&self) -> Option<&DbError> {
        match self {
            Self::PartialFinalize { cause, .. } => cause.as_deref(),
            _ => None,
        }
    }

    /// Check if this error is retryable.
    ///
    /// Selector and routing failures never are: configuration is static for a call.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::Timeout { .. } | Self::ConnectionAcquisition { .. }
        )
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
                DbError::database(
                    db_err.message(),
                    code,
                    "Check the SQL syntax and referenced objects",
                )
            }
            sqlx::Error::RowNotFound => DbError::database(
                "No rows returned",
                None,
                "Verify the query conditions match existing data",
            ),
            sqlx::Error::PoolTimedOut => DbError::timeout("connection pool acquire", 30),
            sqlx::Error::PoolClosed => {
                DbError::connection("Connection pool is closed", "Re-register the datasource")
            }
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
            sqlx::Error::WorkerCrashed => DbError::internal("Database worker crashed"),
            _ => DbError::internal(format!("Unknown database error: {}", err)),
        }
    }
}

/// Result type alias for datasource operations.
pub type DbResult<T> = Result<T, DbError>;
