//! Error types for the data-access core.
//!
//! Every failure that leaves the core is a [`DbError`]. Driver failures are
//! normalized by the classifier (see [`crate::db::classify`]) into the five
//! store-level kinds; the remaining variants are raised by the core itself.

use std::fmt;
use thiserror::Error;

/// Closed set of error kinds surfaced by the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Transient,
    ConstraintViolation,
    AuthFailure,
    SyntaxOrSchema,
    ResourceExhausted,
    PoolExhausted,
    PoolClosed,
    TransactionAlreadyActive,
    TransactionAlreadyClosed,
    BatchShapeMismatch,
    NotFound,
}

impl ErrorKind {
    /// Whether a caller may retry the operation with a fresh connection.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Transient | Self::ResourceExhausted)
    }

    /// Whether a driver failure of this kind leaves the connection unusable.
    pub fn breaks_connection(self) -> bool {
        matches!(
            self,
            Self::Transient | Self::AuthFailure | Self::SyntaxOrSchema
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::ConstraintViolation => "constraint_violation",
            Self::AuthFailure => "auth_failure",
            Self::SyntaxOrSchema => "syntax_or_schema",
            Self::ResourceExhausted => "resource_exhausted",
            Self::PoolExhausted => "pool_exhausted",
            Self::PoolClosed => "pool_closed",
            Self::TransactionAlreadyActive => "transaction_already_active",
            Self::TransactionAlreadyClosed => "transaction_already_closed",
            Self::BatchShapeMismatch => "batch_shape_mismatch",
            Self::NotFound => "not_found",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Transient failure: {message}")]
    Transient {
        message: String,
        /// SQLSTATE or driver result code, when the store reported one
        code: Option<String>,
    },

    #[error("Constraint violation: {message}")]
    ConstraintViolation {
        message: String,
        code: Option<String>,
    },

    #[error("Authentication failure: {message}")]
    AuthFailure {
        message: String,
        code: Option<String>,
    },

    #[error("Syntax or schema error: {message}")]
    SyntaxOrSchema {
        message: String,
        code: Option<String>,
    },

    #[error("Resource exhausted: {message}")]
    ResourceExhausted {
        message: String,
        code: Option<String>,
    },

    #[error("Pool exhausted: no connection became idle within {waited_ms}ms")]
    PoolExhausted { waited_ms: u64 },

    #[error("Pool closed: shutdown has been initiated")]
    PoolClosed,

    #[error("Transaction already active on connection {connection_id}")]
    TransactionAlreadyActive { connection_id: u64 },

    #[error("Transaction {transaction_id} already closed")]
    TransactionAlreadyClosed { transaction_id: String },

    #[error("Batch shape mismatch at tuple {index}: {reason}")]
    BatchShapeMismatch { index: usize, reason: String },

    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },
}

impl DbError {
    /// Build a store-level error of the given kind.
    ///
    /// Core-level kinds carry their own data; passing one of them here
    /// yields a `SyntaxOrSchema` error describing the misuse.
    pub fn store(kind: ErrorKind, message: impl Into<String>, code: Option<String>) -> Self {
        let message = message.into();
        match kind {
            ErrorKind::Transient => Self::Transient { message, code },
            ErrorKind::ConstraintViolation => Self::ConstraintViolation { message, code },
            ErrorKind::AuthFailure => Self::AuthFailure { message, code },
            ErrorKind::ResourceExhausted => Self::ResourceExhausted { message, code },
            ErrorKind::SyntaxOrSchema => Self::SyntaxOrSchema { message, code },
            other => Self::SyntaxOrSchema {
                message: format!("{other} is not a store error kind: {message}"),
                code,
            },
        }
    }

    /// Create a transient error.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
            code: None,
        }
    }

    /// Create a syntax/schema error (also used for mapping mistakes).
    pub fn schema(message: impl Into<String>) -> Self {
        Self::SyntaxOrSchema {
            message: message.into(),
            code: None,
        }
    }

    /// Create a pool exhausted error.
    pub fn pool_exhausted(waited: std::time::Duration) -> Self {
        Self::PoolExhausted {
            waited_ms: waited.as_millis() as u64,
        }
    }

    /// Create a transaction already closed error.
    pub fn transaction_closed(transaction_id: impl Into<String>) -> Self {
        Self::TransactionAlreadyClosed {
            transaction_id: transaction_id.into(),
        }
    }

    /// Create a batch shape mismatch error.
    pub fn batch_shape(index: usize, reason: impl Into<String>) -> Self {
        Self::BatchShapeMismatch {
            index,
            reason: reason.into(),
        }
    }

    /// Create a not found error.
    pub fn not_found(entity: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity: entity.into(),
            id: id.into(),
        }
    }

    /// Get the taxonomy kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transient { .. } => ErrorKind::Transient,
            Self::ConstraintViolation { .. } => ErrorKind::ConstraintViolation,
            Self::AuthFailure { .. } => ErrorKind::AuthFailure,
            Self::SyntaxOrSchema { .. } => ErrorKind::SyntaxOrSchema,
            Self::ResourceExhausted { .. } => ErrorKind::ResourceExhausted,
            Self::PoolExhausted { .. } => ErrorKind::PoolExhausted,
            Self::PoolClosed => ErrorKind::PoolClosed,
            Self::TransactionAlreadyActive { .. } => ErrorKind::TransactionAlreadyActive,
            Self::TransactionAlreadyClosed { .. } => ErrorKind::TransactionAlreadyClosed,
            Self::BatchShapeMismatch { .. } => ErrorKind::BatchShapeMismatch,
            Self::NotFound { .. } => ErrorKind::NotFound,
        }
    }

    /// Get the SQLSTATE or driver result code, if the store reported one.
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Transient { code, .. }
            | Self::ConstraintViolation { code, .. }
            | Self::AuthFailure { code, .. }
            | Self::SyntaxOrSchema { code, .. }
            | Self::ResourceExhausted { code, .. } => code.as_deref(),
            _ => None,
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;
