//! Statement execution engine.
//!
//! Every statement goes through a driver-prepared statement with positional
//! parameters; values are never interpolated into SQL text. The prepared
//! handle is scoped to one call and released on every exit path, including
//! errors and timeouts. Queries return a lazy, forward-only row stream that
//! owns the statement until it is exhausted or dropped.

use crate::config::PoolOptions;
use crate::db::pool::{AsConnection, PooledConnection};
use crate::db::value::{Row, SqlValue};
use crate::driver::{Connector, DriverConnection, DriverError, ExecOutcome, FailureKind};
use crate::error::{DbError, DbResult};
use futures_util::stream::BoxStream;
use futures_util::{StreamExt, TryStreamExt};
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::debug;

/// Rows of one query, yielded one fetch at a time. Single pass; dropping it
/// closes the cursor.
pub type RowStream<'c> = BoxStream<'c, DbResult<Row>>;

/// Failure of one executor step.
pub(crate) enum StepError {
    /// Reported by the driver; needs classification
    Driver(DriverError),
    /// Rejected before reaching the store
    Rejected(DbError),
}

impl StepError {
    fn timed_out(limit: Duration) -> Self {
        Self::Driver(DriverError::new(
            FailureKind::Timeout,
            format!("statement exceeded {}ms deadline", limit.as_millis()),
        ))
    }

    /// Turn into the caller-facing error, updating the connection on the way.
    pub(crate) async fn surface<K: Connector>(self, conn: &mut PooledConnection<K>) -> DbError {
        match self {
            Self::Driver(e) => conn.fail(e).await,
            Self::Rejected(e) => conn.reject(e).await,
        }
    }
}

impl From<DriverError> for StepError {
    fn from(err: DriverError) -> Self {
        Self::Driver(err)
    }
}

/// A driver statement handle borrowed for one operation. Dropping the guard
/// releases the handle.
pub(crate) struct PreparedStatement<'c, C: DriverConnection> {
    conn: Option<&'c mut C>,
    statement: Option<C::Statement>,
}

impl<'c, C: DriverConnection> PreparedStatement<'c, C> {
    pub(crate) async fn prepare(conn: &'c mut C, sql: &str) -> Result<Self, DriverError> {
        let statement = conn.prepare(sql).await?;
        Ok(Self {
            conn: Some(conn),
            statement: Some(statement),
        })
    }

    /// Reject a parameter list whose length differs from the placeholder
    /// count the driver reported.
    pub(crate) fn check_arity(&self, supplied: usize) -> Result<(), StepError> {
        let (Some(conn), Some(statement)) = (self.conn.as_deref(), self.statement.as_ref()) else {
            return Ok(());
        };
        match conn.parameter_count(statement) {
            Some(expected) if expected != supplied => Err(StepError::Rejected(DbError::schema(
                format!(
                    "statement expects {} parameters, {} supplied",
                    expected, supplied
                ),
            ))),
            _ => Ok(()),
        }
    }

    pub(crate) async fn execute(&mut self, params: &[SqlValue]) -> Result<ExecOutcome, DriverError> {
        let (Some(conn), Some(statement)) = (self.conn.as_deref_mut(), self.statement.as_ref())
        else {
            return Err(DriverError::closed("statement already released"));
        };
        conn.execute(statement, params).await
    }

    pub(crate) async fn execute_batch(
        &mut self,
        batch: &[Vec<SqlValue>],
    ) -> Result<Vec<Result<ExecOutcome, DriverError>>, DriverError> {
        let (Some(conn), Some(statement)) = (self.conn.as_deref_mut(), self.statement.as_ref())
        else {
            return Err(DriverError::closed("statement already released"));
        };
        conn.execute_batch(statement, batch).await
    }

    /// Detach the handle so a cursor can own it.
    fn into_statement(mut self) -> Option<C::Statement> {
        self.statement.take()
    }
}

impl<C: DriverConnection> Drop for PreparedStatement<'_, C> {
    fn drop(&mut self) {
        if let (Some(conn), Some(statement)) = (self.conn.as_deref_mut(), self.statement.take()) {
            conn.release(statement);
        }
    }
}

/// Run `work`, failing with a timeout once `deadline` elapses. The work
/// future, and any statement guard inside it, is dropped on timeout.
pub(crate) async fn within<T>(
    deadline: Option<Duration>,
    work: impl Future<Output = Result<T, StepError>>,
) -> Result<T, StepError> {
    match deadline {
        Some(limit) => tokio::time::timeout(limit, work)
            .await
            .unwrap_or_else(|_| Err(StepError::timed_out(limit))),
        None => work.await,
    }
}

/// Executes parameterized statements on a borrowed connection.
#[derive(Debug, Clone, Default)]
pub struct StatementExecutor {
    statement_timeout: Option<Duration>,
}

impl StatementExecutor {
    /// Create an executor without a statement deadline.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_statement_timeout(timeout: Duration) -> Self {
        Self {
            statement_timeout: Some(timeout),
        }
    }

    pub fn from_options(options: &PoolOptions) -> Self {
        Self {
            statement_timeout: options.statement_timeout_or_default(),
        }
    }

    pub fn statement_timeout(&self) -> Option<Duration> {
        self.statement_timeout
    }

    /// Execute a statement and return the number of affected rows.
    pub async fn execute<K: Connector>(
        &self,
        scope: &mut impl AsConnection<K>,
        sql: &str,
        params: &[SqlValue],
    ) -> DbResult<u64> {
        Ok(self.execute_outcome(scope, sql, params).await?.rows_affected)
    }

    /// Execute a statement and return the driver's full outcome, including
    /// any generated key.
    pub async fn execute_outcome<K: Connector>(
        &self,
        scope: &mut impl AsConnection<K>,
        sql: &str,
        params: &[SqlValue],
    ) -> DbResult<ExecOutcome> {
        let conn = scope.usable_connection()?;
        conn.settle().await?;

        let start = Instant::now();
        debug!(
            connection_id = conn.id(),
            sql = %sql,
            params = params.len(),
            "Executing statement"
        );

        let deadline = self.statement_timeout;
        let result = {
            let (driver, status) = conn.split()?;
            status.in_flight = true;
            let result = within(deadline, async {
                let mut statement = PreparedStatement::prepare(driver, sql).await?;
                statement.check_arity(params.len())?;
                Ok::<_, StepError>(statement.execute(params).await?)
            })
            .await;
            status.in_flight = false;
            result
        };

        match result {
            Ok(outcome) => {
                debug!(
                    connection_id = conn.id(),
                    rows_affected = outcome.rows_affected,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Statement completed"
                );
                Ok(outcome)
            }
            Err(e) => Err(e.surface(conn).await),
        }
    }

    /// Open a cursor over the rows of a query.
    ///
    /// The statement is prepared and checked before this returns; rows are
    /// fetched as the stream is polled. With a statement timeout set, the
    /// deadline applies to each fetch.
    pub async fn query<'c, K, S>(
        &self,
        scope: &'c mut S,
        sql: &str,
        params: Vec<SqlValue>,
    ) -> DbResult<RowStream<'c>>
    where
        K: Connector,
        S: AsConnection<K>,
    {
        self.query_as(scope, sql, params, Ok).await
    }

    /// Like [`query`](Self::query), converting each row with `decode`.
    ///
    /// A conversion failure ends the stream and counts as an error on the
    /// connection, so an open transaction is rolled back before it is
    /// yielded.
    pub async fn query_as<'c, K, S, T, F>(
        &self,
        scope: &'c mut S,
        sql: &str,
        params: Vec<SqlValue>,
        decode: F,
    ) -> DbResult<BoxStream<'c, DbResult<T>>>
    where
        K: Connector,
        S: AsConnection<K>,
        T: Send + 'c,
        F: FnMut(Row) -> DbResult<T> + Send + 'c,
    {
        let conn = scope.usable_connection()?;
        conn.settle().await?;

        debug!(
            connection_id = conn.id(),
            sql = %sql,
            params = params.len(),
            "Opening cursor"
        );

        let deadline = self.statement_timeout;
        let prepared = {
            let (driver, status) = conn.split()?;
            status.in_flight = true;
            let supplied = params.len();
            let result = within(deadline, async {
                let statement = PreparedStatement::prepare(driver, sql).await?;
                statement.check_arity(supplied)?;
                Ok::<_, StepError>(statement.into_statement())
            })
            .await;
            status.in_flight = false;
            result
        };

        match prepared {
            Ok(Some(statement)) => Ok(cursor(conn, statement, params, deadline, decode)),
            Ok(None) => Err(conn.reject(DbError::schema("statement was not prepared")).await),
            Err(e) => Err(e.surface(conn).await),
        }
    }

    /// Run a query and return its first row, if any. The cursor is closed
    /// after the first row.
    pub async fn query_one<K, S>(
        &self,
        scope: &mut S,
        sql: &str,
        params: Vec<SqlValue>,
    ) -> DbResult<Option<Row>>
    where
        K: Connector,
        S: AsConnection<K>,
    {
        let mut rows = self.query(scope, sql, params).await?;
        rows.next().await.transpose()
    }

    /// Run a query and collect every row.
    pub async fn query_all<K, S>(
        &self,
        scope: &mut S,
        sql: &str,
        params: Vec<SqlValue>,
    ) -> DbResult<Vec<Row>>
    where
        K: Connector,
        S: AsConnection<K>,
    {
        self.query(scope, sql, params).await?.try_collect().await
    }
}

/// A prepared statement whose cursor has not been opened yet. If the row
/// stream is dropped before its first poll, the handle goes back to the
/// driver through `release`.
struct PendingCursor<'c, K: Connector> {
    conn: &'c mut PooledConnection<K>,
    statement: Option<<K::Connection as DriverConnection>::Statement>,
}

impl<K: Connector> Drop for PendingCursor<'_, K> {
    fn drop(&mut self) {
        let Some(statement) = self.statement.take() else {
            return;
        };
        match self.conn.driver_mut() {
            Some(driver) => driver.release(statement),
            None => drop(statement),
        }
    }
}

fn cursor<'c, K, T, F>(
    conn: &'c mut PooledConnection<K>,
    statement: <K::Connection as DriverConnection>::Statement,
    params: Vec<SqlValue>,
    deadline: Option<Duration>,
    mut decode: F,
) -> BoxStream<'c, DbResult<T>>
where
    K: Connector,
    T: Send + 'c,
    F: FnMut(Row) -> DbResult<T> + Send + 'c,
{
    let mut pending = PendingCursor {
        conn,
        statement: Some(statement),
    };

    async_stream::stream! {
        let conn = &mut *pending.conn;
        let mut failure = None;
        let mut fetched: u64 = 0;

        match conn.split() {
            Ok((driver, status)) => {
                let Some(statement) = pending.statement.take() else {
                    return;
                };
                let mut rows = driver.fetch(statement, params);
                loop {
                    status.in_flight = true;
                    let next = match deadline {
                        Some(limit) => match tokio::time::timeout(limit, rows.next()).await {
                            Ok(next) => next,
                            Err(_) => Some(Err(DriverError::new(
                                FailureKind::Timeout,
                                format!("fetch exceeded {}ms deadline", limit.as_millis()),
                            ))),
                        },
                        None => rows.next().await,
                    };
                    status.in_flight = false;

                    match next {
                        Some(Ok(row)) => match decode(row) {
                            Ok(value) => {
                                fetched += 1;
                                yield Ok(value);
                            }
                            Err(e) => {
                                failure = Some(StepError::Rejected(e));
                                break;
                            }
                        },
                        Some(Err(e)) => {
                            failure = Some(StepError::Driver(e));
                            break;
                        }
                        None => break,
                    }
                }
            }
            Err(e) => {
                yield Err(e);
                return;
            }
        }

        match failure {
            Some(e) => yield Err(e.surface(conn).await),
            None => debug!(connection_id = conn.id(), rows = fetched, "Cursor exhausted"),
        }
    }
    .boxed()
}
