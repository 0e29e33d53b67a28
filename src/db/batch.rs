//! Batched execution of one statement over many parameter tuples.
//!
//! A [`BatchJob`] collects tuples of a fixed shape and submits them to the
//! driver in one round trip. Outside a transaction each tuple succeeds or
//! fails on its own and the caller gets one result per tuple. Inside an
//! active transaction the batch is atomic: the first failure rolls the
//! transaction back and the whole batch fails.

use crate::db::executor::{PreparedStatement, StepError};
use crate::db::pool::AsConnection;
use crate::db::value::{SqlValue, ValueKind};
use crate::driver::Connector;
use crate::error::{DbError, DbResult};
use std::time::Instant;
use tracing::{debug, warn};

/// Parameter tuples for one statement template.
#[derive(Debug, Clone)]
pub struct BatchJob {
    sql: String,
    /// Fixed at creation, or taken from the first tuple
    shape: Option<Vec<ValueKind>>,
    inferred: bool,
    tuples: Vec<Vec<SqlValue>>,
}

impl BatchJob {
    /// Create a batch whose tuples must match `shape`. `ValueKind::Null`
    /// in the shape accepts any kind in that position.
    pub fn new(sql: impl Into<String>, shape: Vec<ValueKind>) -> Self {
        Self {
            sql: sql.into(),
            shape: Some(shape),
            inferred: false,
            tuples: Vec::new(),
        }
    }

    /// Create a batch whose shape is taken from the first tuple added.
    pub fn inferred(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            shape: None,
            inferred: true,
            tuples: Vec::new(),
        }
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn shape(&self) -> Option<&[ValueKind]> {
        self.shape.as_deref()
    }

    pub fn len(&self) -> usize {
        self.tuples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tuples.is_empty()
    }

    pub fn clear(&mut self) {
        self.tuples.clear();
    }

    /// Append one tuple. A tuple of the wrong arity or with a value of the
    /// wrong kind is rejected and the batch is left unchanged.
    pub fn add(&mut self, params: Vec<SqlValue>) -> DbResult<()> {
        let index = self.tuples.len();
        match self.shape.as_mut() {
            Some(shape) => {
                check_shape(shape, &params, index)?;
                // A null in an inferred shape narrows to the first concrete
                // kind seen in that position.
                if self.inferred {
                    for (expected, value) in shape.iter_mut().zip(&params) {
                        if *expected == ValueKind::Null {
                            *expected = value.kind();
                        }
                    }
                }
            }
            None => self.shape = Some(params.iter().map(SqlValue::kind).collect()),
        }
        self.tuples.push(params);
        Ok(())
    }

    /// Submit every tuple in one round trip.
    ///
    /// Returns exactly one result per tuple, in submission order: the
    /// affected-row count or the classified error. Nothing is retried. The
    /// outer error reports failures that stopped the batch as a whole,
    /// including any tuple failure inside an active transaction.
    pub async fn execute<K: Connector>(
        &self,
        scope: &mut impl AsConnection<K>,
    ) -> DbResult<Vec<DbResult<u64>>> {
        if self.tuples.is_empty() {
            debug!(sql = %self.sql, "Empty batch, nothing to submit");
            return Ok(Vec::new());
        }

        let conn = scope.usable_connection()?;
        conn.settle().await?;
        let atomic = conn.in_transaction();
        let arity = self.shape.as_ref().map_or(0, Vec::len);

        let start = Instant::now();
        debug!(
            connection_id = conn.id(),
            sql = %self.sql,
            tuples = self.tuples.len(),
            atomic,
            "Submitting batch"
        );

        let submitted = {
            let (driver, status) = conn.split()?;
            status.in_flight = true;
            let result = async {
                let mut statement = PreparedStatement::prepare(driver, &self.sql).await?;
                statement.check_arity(arity)?;
                Ok::<_, StepError>(statement.execute_batch(&self.tuples).await?)
            }
            .await;
            status.in_flight = false;
            result
        };

        let raw = match submitted {
            Ok(raw) => raw,
            Err(e) => return Err(e.surface(conn).await),
        };

        if raw.len() != self.tuples.len() {
            let error = DbError::schema(format!(
                "driver returned {} results for {} tuples",
                raw.len(),
                self.tuples.len()
            ));
            conn.mark_broken();
            return Err(conn.reject(error).await);
        }

        let mut results = Vec::with_capacity(raw.len());
        let mut first_failure = None;
        let mut breaks_connection = false;
        {
            let classifier = conn.classifier();
            for (index, outcome) in raw.into_iter().enumerate() {
                match outcome {
                    Ok(outcome) => results.push(Ok(outcome.rows_affected)),
                    Err(e) => {
                        let kind = classifier.classify(&e);
                        breaks_connection |= kind.breaks_connection();
                        debug!(index, kind = %kind, error = %e, "Batch tuple failed");
                        if first_failure.is_none() {
                            first_failure = Some(e.clone());
                        }
                        results.push(Err(DbError::store(kind, e.message, e.code)));
                    }
                }
            }
        }

        if let Some(failure) = first_failure {
            if atomic {
                warn!(
                    connection_id = conn.id(),
                    sql = %self.sql,
                    "Batch failed inside transaction, rolling back"
                );
                return Err(conn.fail(failure).await);
            }
            if breaks_connection {
                conn.mark_broken();
            }
        }

        debug!(
            connection_id = conn.id(),
            tuples = results.len(),
            failed = results.iter().filter(|r| r.is_err()).count(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Batch completed"
        );
        Ok(results)
    }
}

fn check_shape(shape: &[ValueKind], params: &[SqlValue], index: usize) -> DbResult<()> {
    if shape.len() != params.len() {
        return Err(DbError::batch_shape(
            index,
            format!("expected {} values, got {}", shape.len(), params.len()),
        ));
    }
    for (position, (expected, value)) in shape.iter().zip(params).enumerate() {
        if !expected.accepts(value.kind()) {
            return Err(DbError::batch_shape(
                index,
                format!(
                    "parameter {}: expected {}, got {}",
                    position,
                    expected,
                    value.kind()
                ),
            ));
        }
    }
    Ok(())
}
