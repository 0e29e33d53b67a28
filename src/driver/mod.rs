//! Driver capability contract.
//!
//! The core never talks to a database product directly. A driver supplies a
//! [`Connector`] that opens sessions and a [`DriverConnection`] that can
//! prepare, bind, execute, fetch and bracket transactions. Failures are
//! reported as [`DriverError`] and classified by the core.

pub mod sqlite;

use crate::db::value::{Row, SqlValue};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::fmt;

pub use sqlite::{SqliteConnector, SqliteDriverConnection};

/// Broad category of a driver failure, reported by the driver alongside the
/// store's own code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Socket, file or worker failure
    Io,
    Timeout,
    /// The session was already closed
    Closed,
    Protocol,
    Authentication,
    /// Malformed connection string or options
    Configuration,
    Constraint,
    Syntax,
    /// Statement or connection limits
    Limit,
    /// Row value could not be converted
    Decode,
    /// Database-reported error without a more specific category
    Database,
    Other,
}

/// Raw failure reported by a driver, before classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverError {
    pub failure: FailureKind,
    /// SQLSTATE (Postgres/MySQL) or result code (SQLite)
    pub code: Option<String>,
    pub message: String,
}

impl DriverError {
    pub fn new(failure: FailureKind, message: impl Into<String>) -> Self {
        Self {
            failure,
            code: None,
            message: message.into(),
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn closed(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Closed, message)
    }
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{} (code: {})", self.message, code),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for DriverError {}

/// Result of a mutating statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExecOutcome {
    pub rows_affected: u64,
    /// Store-generated key of the last inserted row, when the driver reports one
    pub last_insert_id: Option<i64>,
}

/// Opens sessions to the external store.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Connection: DriverConnection;

    async fn connect(&self) -> Result<Self::Connection, DriverError>;
}

/// One live session with the external store.
///
/// Implementations keep every method on the same physical session.
#[async_trait]
pub trait DriverConnection: Send + Sized + 'static {
    /// Driver-level prepared statement handle.
    type Statement: Send + Sync + 'static;

    async fn prepare(&mut self, sql: &str) -> Result<Self::Statement, DriverError>;

    /// Number of positional placeholders, if the driver knows it.
    fn parameter_count(&self, statement: &Self::Statement) -> Option<usize>;

    async fn execute(
        &mut self,
        statement: &Self::Statement,
        params: &[SqlValue],
    ) -> Result<ExecOutcome, DriverError>;

    /// Submit every tuple in one round trip. The default runs them one by
    /// one; drivers with native batching override it.
    ///
    /// The outer error is for failures that prevented the batch from being
    /// submitted at all; per-tuple failures go in the returned vector.
    async fn execute_batch(
        &mut self,
        statement: &Self::Statement,
        batch: &[Vec<SqlValue>],
    ) -> Result<Vec<Result<ExecOutcome, DriverError>>, DriverError> {
        let mut results = Vec::with_capacity(batch.len());
        for params in batch {
            results.push(self.execute(statement, params).await);
        }
        Ok(results)
    }

    /// Open a forward-only cursor. The stream owns the statement and releases
    /// it, together with the cursor, when it is exhausted or dropped.
    fn fetch(
        &mut self,
        statement: Self::Statement,
        params: Vec<SqlValue>,
    ) -> BoxStream<'_, Result<Row, DriverError>>;

    /// Release a statement handle that will not be executed again.
    fn release(&mut self, statement: Self::Statement) {
        drop(statement);
    }

    /// Disable autocommit and start a transaction.
    async fn begin(&mut self) -> Result<(), DriverError>;

    /// Commit and re-enable autocommit.
    async fn commit(&mut self) -> Result<(), DriverError>;

    /// Roll back and re-enable autocommit.
    async fn rollback(&mut self) -> Result<(), DriverError>;

    async fn close(self) -> Result<(), DriverError>;
}
