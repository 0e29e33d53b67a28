//! SQLite driver built on sqlx.

use super::{Connector, DriverConnection, DriverError, ExecOutcome, FailureKind};
use crate::db::value::{Row, SqlValue};
use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use sqlx::sqlite::{SqliteArguments, SqliteConnectOptions, SqliteConnection, SqliteRow};
use sqlx::{Column, Connection, Executor, Row as _, Sqlite, Statement, TypeInfo, ValueRef};
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;

/// Opens SQLite sessions from a `sqlite:` connection string.
#[derive(Debug, Clone)]
pub struct SqliteConnector {
    options: SqliteConnectOptions,
}

impl SqliteConnector {
    /// Parse the connection string. Missing database files are created.
    pub fn new(connection_string: &str) -> Result<Self, DriverError> {
        let options = SqliteConnectOptions::from_str(connection_string)
            .map_err(|e| {
                DriverError::new(
                    FailureKind::Configuration,
                    format!("Invalid SQLite connection string: {}", e),
                )
            })?
            .create_if_missing(true);
        Ok(Self { options })
    }

    pub fn from_options(options: SqliteConnectOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl Connector for SqliteConnector {
    type Connection = SqliteDriverConnection;

    async fn connect(&self) -> Result<Self::Connection, DriverError> {
        let conn = SqliteConnection::connect_with(&self.options)
            .await
            .map_err(DriverError::from)?;
        Ok(SqliteDriverConnection { conn })
    }
}

/// Prepared statement handle. sqlx keeps the compiled statement in the
/// connection's statement cache keyed by SQL text.
#[derive(Debug, Clone)]
pub struct SqliteStatementHandle {
    sql: Arc<str>,
    parameters: Option<usize>,
}

impl SqliteStatementHandle {
    pub fn sql(&self) -> &str {
        &self.sql
    }
}

#[derive(Debug)]
pub struct SqliteDriverConnection {
    conn: SqliteConnection,
}

#[async_trait]
impl DriverConnection for SqliteDriverConnection {
    type Statement = SqliteStatementHandle;

    async fn prepare(&mut self, sql: &str) -> Result<Self::Statement, DriverError> {
        let statement = (&mut self.conn).prepare(sql).await?;
        let parameters = match statement.parameters() {
            Some(sqlx::Either::Left(types)) => Some(types.len()),
            Some(sqlx::Either::Right(count)) => Some(count),
            None => None,
        };
        Ok(SqliteStatementHandle {
            sql: Arc::from(sql),
            parameters,
        })
    }

    fn parameter_count(&self, statement: &Self::Statement) -> Option<usize> {
        statement.parameters
    }

    async fn execute(
        &mut self,
        statement: &Self::Statement,
        params: &[SqlValue],
    ) -> Result<ExecOutcome, DriverError> {
        let mut query = sqlx::query(&statement.sql);
        for param in params {
            query = bind_param(query, param.clone());
        }
        let result = query.execute(&mut self.conn).await?;
        Ok(ExecOutcome {
            rows_affected: result.rows_affected(),
            last_insert_id: Some(result.last_insert_rowid()),
        })
    }

    fn fetch(
        &mut self,
        statement: Self::Statement,
        params: Vec<SqlValue>,
    ) -> BoxStream<'_, Result<Row, DriverError>> {
        let conn = &mut self.conn;
        async_stream::try_stream! {
            let mut query = sqlx::query(&statement.sql);
            for param in params {
                query = bind_param(query, param);
            }
            let mut rows = query.fetch(&mut *conn);
            let mut columns: Option<Arc<[String]>> = None;
            while let Some(row) = rows.next().await {
                let row = row.map_err(DriverError::from)?;
                let names = columns.get_or_insert_with(|| column_names(&row)).clone();
                yield decode_row(&row, names)?;
            }
        }
        .boxed()
    }

    async fn begin(&mut self) -> Result<(), DriverError> {
        (&mut self.conn).execute("BEGIN").await?;
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), DriverError> {
        (&mut self.conn).execute("COMMIT").await?;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), DriverError> {
        (&mut self.conn).execute("ROLLBACK").await?;
        Ok(())
    }

    async fn close(self) -> Result<(), DriverError> {
        self.conn.close().await.map_err(DriverError::from)
    }
}

fn bind_param<'q>(
    query: sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>,
    param: SqlValue,
) -> sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>> {
    match param {
        SqlValue::Null => query.bind(None::<String>),
        SqlValue::Bool(v) => query.bind(v),
        SqlValue::Int(v) => query.bind(v),
        SqlValue::Float(v) => query.bind(v),
        SqlValue::Text(v) => query.bind(v),
        SqlValue::Bytes(v) => query.bind(v),
    }
}

fn column_names(row: &SqliteRow) -> Arc<[String]> {
    row.columns()
        .iter()
        .map(|col| col.name().to_string())
        .collect::<Vec<_>>()
        .into()
}

fn decode_row(row: &SqliteRow, columns: Arc<[String]>) -> Result<Row, DriverError> {
    let mut values = Vec::with_capacity(columns.len());
    for (idx, col) in row.columns().iter().enumerate() {
        let declared = col.type_info().name().to_ascii_uppercase();
        values.push(decode_column(row, idx, &declared)?);
    }
    Ok(Row::new(columns, values))
}

/// Decode by the value's storage class; the declared type only matters for
/// BOOLEAN columns, which SQLite stores as integers.
fn decode_column(row: &SqliteRow, idx: usize, declared: &str) -> Result<SqlValue, DriverError> {
    let raw = row.try_get_raw(idx)?;
    if raw.is_null() {
        return Ok(SqlValue::Null);
    }
    let storage = raw.type_info().name().to_ascii_uppercase();
    let value = match storage.as_str() {
        "INTEGER" | "BOOLEAN" | "INT" | "BIGINT" => {
            let v: i64 = row.try_get(idx)?;
            if declared == "BOOLEAN" || declared == "BOOL" {
                SqlValue::Bool(v != 0)
            } else {
                SqlValue::Int(v)
            }
        }
        "REAL" | "FLOAT" | "DOUBLE" | "NUMERIC" => SqlValue::Float(row.try_get(idx)?),
        "BLOB" => SqlValue::Bytes(row.try_get(idx)?),
        _ => SqlValue::Text(row.try_get(idx)?),
    };
    Ok(value)
}

impl From<sqlx::Error> for DriverError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db_err) => {
                let failure = match db_err.kind() {
                    sqlx::error::ErrorKind::UniqueViolation
                    | sqlx::error::ErrorKind::ForeignKeyViolation
                    | sqlx::error::ErrorKind::NotNullViolation
                    | sqlx::error::ErrorKind::CheckViolation => FailureKind::Constraint,
                    _ => FailureKind::Database,
                };
                let code = db_err.code().map(|c| c.to_string());
                debug!(code = ?code, message = %db_err.message(), "Database reported error");
                DriverError {
                    failure,
                    code,
                    message: db_err.message().to_string(),
                }
            }
            sqlx::Error::Configuration(msg) => {
                DriverError::new(FailureKind::Configuration, msg.to_string())
            }
            sqlx::Error::Io(io_err) => {
                DriverError::new(FailureKind::Io, format!("I/O error: {}", io_err))
            }
            sqlx::Error::Tls(tls_err) => {
                DriverError::new(FailureKind::Io, format!("TLS error: {}", tls_err))
            }
            sqlx::Error::Protocol(msg) => {
                DriverError::new(FailureKind::Protocol, format!("Protocol error: {}", msg))
            }
            sqlx::Error::PoolTimedOut => {
                DriverError::new(FailureKind::Timeout, "driver pool timed out")
            }
            sqlx::Error::PoolClosed => DriverError::closed("driver pool closed"),
            sqlx::Error::WorkerCrashed => {
                DriverError::new(FailureKind::Io, "Database worker crashed")
            }
            sqlx::Error::ColumnNotFound(col) => {
                DriverError::new(FailureKind::Decode, format!("Column not found: {}", col))
            }
            sqlx::Error::ColumnIndexOutOfBounds { index, len } => DriverError::new(
                FailureKind::Decode,
                format!("Column index {} out of bounds (len: {})", index, len),
            ),
            sqlx::Error::ColumnDecode { index, source } => DriverError::new(
                FailureKind::Decode,
                format!("Failed to decode column {}: {}", index, source),
            ),
            sqlx::Error::Decode(source) => {
                DriverError::new(FailureKind::Decode, format!("Decode error: {}", source))
            }
            sqlx::Error::TypeNotFound { type_name } => DriverError::new(
                FailureKind::Decode,
                format!("Type not found: {}", type_name),
            ),
            other => DriverError::new(
                FailureKind::Other,
                format!("Unknown database error: {}", other),
            ),
        }
    }
}
