//! Shared test fixtures: a scripted in-memory driver with fault injection
//! and temp-file SQLite databases.

#![allow(dead_code)]

use async_trait::async_trait;
use dbcore::config::PoolOptions;
use dbcore::db::{Pool, Row, SqlValue, StatementExecutor};
use dbcore::driver::{
    Connector, DriverConnection, DriverError, ExecOutcome, FailureKind, SqliteConnector,
};
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode};
use std::collections::{HashMap, VecDeque};
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

/// Install a test subscriber once; `RUST_LOG=dbcore=debug` shows pool and
/// statement logs.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Parameter value that makes the mock driver report a duplicate key.
pub const DUPLICATE: &str = "dup";

/// Driver call a scripted fault or delay applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Connect,
    Prepare,
    Execute,
    Fetch,
    Begin,
    Commit,
    Rollback,
}

/// Counters for every driver call the mock sees.
#[derive(Debug, Default)]
pub struct MockStats {
    pub opened: AtomicUsize,
    pub closed: AtomicUsize,
    pub prepared: AtomicUsize,
    pub released: AtomicUsize,
    /// Handles given back through `DriverConnection::release`
    pub release_calls: AtomicUsize,
    pub executed: AtomicUsize,
    pub begun: AtomicUsize,
    pub committed: AtomicUsize,
    pub rolled_back: AtomicUsize,
}

pub fn count(counter: &AtomicUsize) -> usize {
    counter.load(Ordering::SeqCst)
}

#[derive(Default)]
struct Script {
    faults: Mutex<HashMap<Stage, VecDeque<DriverError>>>,
    delays: Mutex<HashMap<Stage, Duration>>,
    rows: Mutex<Vec<Vec<SqlValue>>>,
    next_insert_id: AtomicI64,
}

impl Script {
    fn take_fault(&self, stage: Stage) -> Option<DriverError> {
        self.faults
            .lock()
            .unwrap()
            .get_mut(&stage)
            .and_then(VecDeque::pop_front)
    }

    fn delay(&self, stage: Stage) -> Option<Duration> {
        self.delays.lock().unwrap().get(&stage).copied()
    }

    async fn enter(&self, stage: Stage) -> Result<(), DriverError> {
        if let Some(delay) = self.delay(stage) {
            tokio::time::sleep(delay).await;
        }
        match self.take_fault(stage) {
            Some(fault) => Err(fault),
            None => Ok(()),
        }
    }
}

/// In-memory driver whose failures and latencies are scripted by the test.
#[derive(Clone, Default)]
pub struct MockConnector {
    pub stats: Arc<MockStats>,
    script: Arc<Script>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next call at `stage` with `error`.
    pub fn fail_next(&self, stage: Stage, error: DriverError) {
        self.script
            .faults
            .lock()
            .unwrap()
            .entry(stage)
            .or_default()
            .push_back(error);
    }

    /// Delay every call at `stage`.
    pub fn delay(&self, stage: Stage, delay: Duration) {
        self.script.delays.lock().unwrap().insert(stage, delay);
    }

    pub fn clear_delay(&self, stage: Stage) {
        self.script.delays.lock().unwrap().remove(&stage);
    }

    /// Rows returned by every query.
    pub fn set_rows(&self, rows: Vec<Vec<SqlValue>>) {
        *self.script.rows.lock().unwrap() = rows;
    }
}

#[async_trait]
impl Connector for MockConnector {
    type Connection = MockConnection;

    async fn connect(&self) -> Result<Self::Connection, DriverError> {
        self.script.enter(Stage::Connect).await?;
        self.stats.opened.fetch_add(1, Ordering::SeqCst);
        Ok(MockConnection {
            stats: Arc::clone(&self.stats),
            script: Arc::clone(&self.script),
        })
    }
}

pub struct MockConnection {
    stats: Arc<MockStats>,
    script: Arc<Script>,
}

/// Counts itself as released when dropped, whichever path drops it.
pub struct MockStatement {
    placeholders: usize,
    stats: Arc<MockStats>,
}

impl Drop for MockStatement {
    fn drop(&mut self) {
        self.stats.released.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl DriverConnection for MockConnection {
    type Statement = MockStatement;

    async fn prepare(&mut self, sql: &str) -> Result<Self::Statement, DriverError> {
        self.script.enter(Stage::Prepare).await?;
        self.stats.prepared.fetch_add(1, Ordering::SeqCst);
        Ok(MockStatement {
            placeholders: sql.matches('?').count(),
            stats: Arc::clone(&self.stats),
        })
    }

    fn parameter_count(&self, statement: &Self::Statement) -> Option<usize> {
        Some(statement.placeholders)
    }

    async fn execute(
        &mut self,
        _statement: &Self::Statement,
        params: &[SqlValue],
    ) -> Result<ExecOutcome, DriverError> {
        self.script.enter(Stage::Execute).await?;
        if params
            .iter()
            .any(|p| matches!(p, SqlValue::Text(v) if v == DUPLICATE))
        {
            return Err(DriverError::new(FailureKind::Constraint, "duplicate key value")
                .with_code("23505"));
        }
        self.stats.executed.fetch_add(1, Ordering::SeqCst);
        let id = self.script.next_insert_id.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(ExecOutcome {
            rows_affected: 1,
            last_insert_id: Some(id),
        })
    }

    fn fetch(
        &mut self,
        statement: Self::Statement,
        _params: Vec<SqlValue>,
    ) -> BoxStream<'_, Result<Row, DriverError>> {
        let rows = self.script.rows.lock().unwrap().clone();
        let width = rows.first().map_or(0, Vec::len);
        let columns: Arc<[String]> = (0..width)
            .map(|i| format!("c{}", i))
            .collect::<Vec<_>>()
            .into();
        let script = Arc::clone(&self.script);
        async_stream::stream! {
            let _statement = statement;
            for values in rows {
                if let Some(delay) = script.delay(Stage::Fetch) {
                    tokio::time::sleep(delay).await;
                }
                yield Ok(Row::new(Arc::clone(&columns), values));
            }
            if let Some(fault) = script.take_fault(Stage::Fetch) {
                yield Err(fault);
            }
        }
        .boxed()
    }

    fn release(&mut self, statement: Self::Statement) {
        self.stats.release_calls.fetch_add(1, Ordering::SeqCst);
        drop(statement);
    }

    async fn begin(&mut self) -> Result<(), DriverError> {
        self.script.enter(Stage::Begin).await?;
        self.stats.begun.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), DriverError> {
        self.script.enter(Stage::Commit).await?;
        self.stats.committed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), DriverError> {
        self.script.enter(Stage::Rollback).await?;
        self.stats.rolled_back.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(self) -> Result<(), DriverError> {
        self.stats.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub async fn mock_pool(options: PoolOptions) -> (MockConnector, Pool<MockConnector>) {
    let connector = MockConnector::new();
    let pool = Pool::connect(connector.clone(), options).await.unwrap();
    (connector, pool)
}

/// Let spawned cleanup tasks run.
pub async fn settle_background() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
}

/// A SQLite database in a temp directory. Keep the `TempDir` alive for the
/// duration of the test.
pub fn temp_sqlite_url() -> (TempDir, String) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("test.db");
    let url = format!("sqlite:{}", path.display());
    (dir, url)
}

pub async fn sqlite_pool(options: PoolOptions) -> (TempDir, Pool<SqliteConnector>) {
    init_tracing();
    let (dir, url) = temp_sqlite_url();
    // WAL so readers on other sessions never hold up a commit.
    let connect_options = SqliteConnectOptions::from_str(&url)
        .unwrap()
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal);
    let connector = SqliteConnector::from_options(connect_options);
    let pool = Pool::connect(connector, options).await.unwrap();
    (dir, pool)
}

/// Run DDL or setup statements on a fresh connection.
pub async fn run_sql(pool: &Pool<SqliteConnector>, statements: &[&str]) {
    let executor = StatementExecutor::new();
    let mut conn = pool.acquire_default().await.unwrap();
    for sql in statements {
        executor.execute(&mut conn, sql, &[]).await.unwrap();
    }
    conn.release().await;
}

pub async fn count_rows(pool: &Pool<SqliteConnector>, table: &str) -> i64 {
    let executor = StatementExecutor::new();
    let mut conn = pool.acquire_default().await.unwrap();
    let rows = executor
        .query_all(&mut conn, &format!("SELECT COUNT(*) AS n FROM {}", table), Vec::new())
        .await
        .unwrap();
    conn.release().await;
    rows[0].get("n").unwrap()
}
