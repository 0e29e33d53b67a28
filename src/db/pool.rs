//! Bounded connection pool.
//!
//! A [`Pool`] lends out [`PooledConnection`]s, each owned by exactly one
//! borrower. Checkouts are bounded by a semaphore with `max_connections`
//! permits, and the number of live connections (idle, lent out, opening or
//! waiting to be closed) is tracked separately against the same bound.
//!
//! Returning a connection is RAII: dropping a `PooledConnection` puts a
//! healthy connection back on the idle queue and hands a broken one, or one
//! still inside a transaction, to a background task that rolls it back or
//! closes it. [`PooledConnection::release`] does the same work inline.

use crate::config::PoolOptions;
use crate::db::classify::{DefaultClassifier, ErrorClassifier};
use crate::db::transaction::{self, Transaction};
use crate::driver::{Connector, DriverConnection, DriverError};
use crate::error::{DbError, DbResult};
use futures_util::future::BoxFuture;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

/// Lifecycle state of a pooled connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    InUse,
    /// A failure left the session unusable; it is closed on release
    Broken,
    Closed,
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Live connections, including ones being opened or closed
    pub size: usize,
    pub idle: usize,
    pub in_use: usize,
    pub max_size: usize,
}

struct IdleConnection<C> {
    id: u64,
    conn: C,
}

struct PoolInner<K: Connector> {
    connector: K,
    options: PoolOptions,
    max_size: usize,
    min_idle: usize,
    classifier: Arc<dyn ErrorClassifier>,
    /// One permit per checkout
    semaphore: Arc<Semaphore>,
    idle: Mutex<VecDeque<IdleConnection<K::Connection>>>,
    size: AtomicUsize,
    in_use: AtomicUsize,
    closed: AtomicBool,
    /// Signalled whenever a connection goes idle, a slot frees up or a
    /// borrower finishes returning a connection
    released: Notify,
    next_id: AtomicU64,
}

/// A claim on one of the `max_size` connection slots. Dropping it without
/// calling `keep` gives the slot back.
struct SlotReservation<'a, K: Connector> {
    pool: &'a PoolInner<K>,
    armed: bool,
}

impl<'a, K: Connector> SlotReservation<'a, K> {
    fn try_new(pool: &'a PoolInner<K>, limit: usize) -> Option<Self> {
        pool.size
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |size| {
                (size < limit).then_some(size + 1)
            })
            .ok()
            .map(|_| Self { pool, armed: true })
    }

    fn keep(mut self) {
        self.armed = false;
    }
}

impl<K: Connector> Drop for SlotReservation<'_, K> {
    fn drop(&mut self) {
        if self.armed {
            self.pool.free_slot();
        }
    }
}

impl<K: Connector> PoolInner<K> {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn idle_queue(&self) -> MutexGuard<'_, VecDeque<IdleConnection<K::Connection>>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn free_slot(&self) {
        self.size.fetch_sub(1, Ordering::AcqRel);
        self.released.notify_waiters();
    }

    fn push_idle(&self, id: u64, conn: K::Connection) {
        self.idle_queue().push_back(IdleConnection { id, conn });
        self.released.notify_waiters();
    }

    fn finish_checkout(&self) {
        self.in_use.fetch_sub(1, Ordering::AcqRel);
        self.released.notify_waiters();
    }

    async fn open(&self) -> DbResult<(u64, K::Connection)> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        match self.connector.connect().await {
            Ok(conn) => {
                debug!(connection_id = id, "Opened connection");
                Ok((id, conn))
            }
            Err(e) => {
                warn!(connection_id = id, error = %e, "Failed to open connection");
                Err(self.classifier.to_db_error(e))
            }
        }
    }

    async fn close_connection(&self, id: u64, conn: K::Connection) {
        match conn.close().await {
            Ok(()) => debug!(connection_id = id, "Closed connection"),
            Err(e) => warn!(connection_id = id, error = %e, "Error while closing connection"),
        }
        self.free_slot();
    }

    async fn close_idle(&self) {
        let drained: Vec<_> = self.idle_queue().drain(..).collect();
        for IdleConnection { id, conn } in drained {
            self.close_connection(id, conn).await;
        }
    }

    /// Open connections until `min_idle` live connections exist.
    async fn replenish(&self) {
        while !self.is_closed() {
            let Some(reservation) = SlotReservation::try_new(self, self.min_idle) else {
                break;
            };
            match self.open().await {
                Ok((id, conn)) => {
                    reservation.keep();
                    self.push_idle(id, conn);
                }
                Err(_) => break,
            }
        }
    }

    /// Return a connection that needs async work first: rollback of an open
    /// transaction, or close because it is broken or the pool shut down.
    async fn reclaim(&self, id: u64, mut conn: K::Connection, mut broken: bool, rollback: bool) {
        if rollback && !broken {
            match conn.rollback().await {
                Ok(()) => debug!(connection_id = id, "Rolled back uncommitted transaction on release"),
                Err(e) => {
                    warn!(
                        connection_id = id,
                        error = %e,
                        "Rollback on release failed, evicting connection"
                    );
                    broken = true;
                }
            }
        }

        if broken {
            warn!(connection_id = id, "Evicting broken connection");
            self.close_connection(id, conn).await;
        } else if self.is_closed() {
            self.close_connection(id, conn).await;
        } else {
            self.push_idle(id, conn);
        }
        self.finish_checkout();

        if broken {
            self.replenish().await;
        }
    }
}

/// Bounded pool of connections opened through a [`Connector`].
pub struct Pool<K: Connector> {
    inner: Arc<PoolInner<K>>,
}

impl<K: Connector> Clone for Pool<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K: Connector> fmt::Debug for Pool<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("stats", &self.stats())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl<K: Connector> Pool<K> {
    /// Create a pool and eagerly open `min_idle` connections.
    pub async fn connect(connector: K, options: PoolOptions) -> DbResult<Self> {
        Self::connect_with_classifier(connector, options, Arc::new(DefaultClassifier)).await
    }

    /// Create a pool that classifies driver failures with `classifier`.
    pub async fn connect_with_classifier(
        connector: K,
        options: PoolOptions,
        classifier: Arc<dyn ErrorClassifier>,
    ) -> DbResult<Self> {
        options
            .validate()
            .map_err(|e| DbError::schema(format!("Invalid pool options: {}", e)))?;

        let max_size = options.max_connections_or_default() as usize;
        let min_idle = options.min_idle_or_default() as usize;
        let pool = Self {
            inner: Arc::new(PoolInner {
                connector,
                options,
                max_size,
                min_idle,
                classifier,
                semaphore: Arc::new(Semaphore::new(max_size)),
                idle: Mutex::new(VecDeque::with_capacity(max_size)),
                size: AtomicUsize::new(0),
                in_use: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
                released: Notify::new(),
                next_id: AtomicU64::new(1),
            }),
        };

        for _ in 0..min_idle {
            let Some(reservation) = SlotReservation::try_new(&pool.inner, min_idle) else {
                break;
            };
            match pool.inner.open().await {
                Ok((id, conn)) => {
                    reservation.keep();
                    pool.inner.push_idle(id, conn);
                }
                Err(e) => {
                    drop(reservation);
                    pool.inner.close_idle().await;
                    return Err(e);
                }
            }
        }

        info!(max_size, min_idle, "Connection pool ready");
        Ok(pool)
    }

    pub fn options(&self) -> &PoolOptions {
        &self.inner.options
    }

    pub fn classifier(&self) -> &dyn ErrorClassifier {
        self.inner.classifier.as_ref()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            size: self.inner.size.load(Ordering::Acquire),
            idle: self.inner.idle_queue().len(),
            in_use: self.inner.in_use.load(Ordering::Acquire),
            max_size: self.inner.max_size,
        }
    }

    /// Borrow a connection, waiting up to `timeout` for one to become
    /// available.
    pub async fn acquire(&self, timeout: Duration) -> DbResult<PooledConnection<K>> {
        if self.inner.is_closed() {
            return Err(DbError::PoolClosed);
        }

        let start = Instant::now();
        match tokio::time::timeout(timeout, self.checkout()).await {
            Ok(result) => result,
            Err(_) => {
                let waited = start.elapsed();
                warn!(
                    waited_ms = waited.as_millis() as u64,
                    max_size = self.inner.max_size,
                    "Timed out waiting for a connection"
                );
                Err(DbError::pool_exhausted(waited))
            }
        }
    }

    /// Borrow a connection using the configured acquire timeout.
    pub async fn acquire_default(&self) -> DbResult<PooledConnection<K>> {
        self.acquire(self.inner.options.acquire_timeout_or_default())
            .await
    }

    async fn checkout(&self) -> DbResult<PooledConnection<K>> {
        let permit = Arc::clone(&self.inner.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| DbError::PoolClosed)?;

        loop {
            if self.inner.is_closed() {
                return Err(DbError::PoolClosed);
            }
            // Registered before the checks so a release in between still wakes us.
            let released = self.inner.released.notified();

            let idle = self.inner.idle_queue().pop_front();
            if let Some(IdleConnection { id, conn }) = idle {
                return self.lend(id, conn, permit).await;
            }

            if let Some(reservation) = SlotReservation::try_new(&self.inner, self.inner.max_size) {
                let (id, conn) = self.inner.open().await?;
                reservation.keep();
                return self.lend(id, conn, permit).await;
            }

            // Every slot is taken by a connection being returned or closed.
            released.await;
        }
    }

    async fn lend(
        &self,
        id: u64,
        conn: K::Connection,
        permit: OwnedSemaphorePermit,
    ) -> DbResult<PooledConnection<K>> {
        if self.inner.is_closed() {
            self.inner.close_connection(id, conn).await;
            return Err(DbError::PoolClosed);
        }
        self.inner.in_use.fetch_add(1, Ordering::AcqRel);
        debug!(connection_id = id, "Connection checked out");
        Ok(PooledConnection {
            conn: Some(conn),
            status: ConnectionStatus::new(id),
            permit: Some(permit),
            pool: Arc::clone(&self.inner),
        })
    }

    /// Return a connection to the pool, waiting for any rollback or close to
    /// finish. Equivalent to dropping it, minus the background task.
    pub async fn release(&self, conn: PooledConnection<K>) {
        conn.release().await;
    }

    /// Stop lending connections, wait for borrowers to return theirs (up to
    /// the shutdown timeout), then close every connection. Calling it again
    /// is a no-op.
    pub async fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            debug!("Connection pool already shut down");
            return;
        }

        info!(
            in_use = self.inner.in_use.load(Ordering::Acquire),
            "Shutting down connection pool"
        );
        self.inner.semaphore.close();
        self.inner.released.notify_waiters();

        let grace = self.inner.options.shutdown_timeout_or_default();
        let drain = async {
            loop {
                let released = self.inner.released.notified();
                if self.inner.in_use.load(Ordering::Acquire) == 0 {
                    break;
                }
                released.await;
            }
        };
        if tokio::time::timeout(grace, drain).await.is_err() {
            warn!(
                in_use = self.inner.in_use.load(Ordering::Acquire),
                grace_ms = grace.as_millis() as u64,
                "Borrowed connections not returned before shutdown deadline; they close on release"
            );
        }

        self.inner.close_idle().await;
        info!("Connection pool shut down");
    }

    /// Run `f` inside a transaction on a freshly acquired connection.
    /// Commits when `f` returns `Ok`, rolls back when it returns `Err`.
    pub async fn with_transaction<R, F>(&self, f: F) -> DbResult<R>
    where
        R: Send,
        F: for<'t> FnOnce(&'t mut Transaction<'_, K>) -> BoxFuture<'t, DbResult<R>> + Send,
    {
        let mut conn = self.acquire_default().await?;
        let result = transaction::with_transaction(&mut conn, f).await;
        conn.release().await;
        result
    }
}

/// Mutable bookkeeping carried by a lent-out connection.
#[derive(Debug)]
pub(crate) struct ConnectionStatus {
    pub(crate) id: u64,
    pub(crate) state: ConnectionState,
    /// Set while a driver call is pending. Still set when the next call
    /// starts means the previous one was abandoned mid-statement.
    pub(crate) in_flight: bool,
    /// Id of the transaction currently open on this connection
    pub(crate) transaction: Option<String>,
    /// A transaction was dropped without commit or rollback
    pub(crate) pending_rollback: bool,
}

impl ConnectionStatus {
    fn new(id: u64) -> Self {
        Self {
            id,
            state: ConnectionState::InUse,
            in_flight: false,
            transaction: None,
            pending_rollback: false,
        }
    }
}

/// A connection lent out by a [`Pool`]. Dropping it returns it to the pool.
pub struct PooledConnection<K: Connector> {
    conn: Option<K::Connection>,
    status: ConnectionStatus,
    permit: Option<OwnedSemaphorePermit>,
    pool: Arc<PoolInner<K>>,
}

impl<K: Connector> fmt::Debug for PooledConnection<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.status.id)
            .field("state", &self.state())
            .field("transaction", &self.status.transaction)
            .finish()
    }
}

impl<K: Connector> PooledConnection<K> {
    pub fn id(&self) -> u64 {
        self.status.id
    }

    pub fn state(&self) -> ConnectionState {
        if self.conn.is_none() {
            ConnectionState::Closed
        } else if self.status.in_flight {
            ConnectionState::Broken
        } else {
            self.status.state
        }
    }

    pub fn is_broken(&self) -> bool {
        self.state() == ConnectionState::Broken
    }

    /// Flag the connection so it is closed instead of recycled.
    pub fn mark_broken(&mut self) {
        if self.status.state != ConnectionState::Broken {
            debug!(connection_id = self.status.id, "Connection marked broken");
        }
        self.status.state = ConnectionState::Broken;
    }

    /// Id of the transaction currently open on this connection.
    pub fn transaction_id(&self) -> Option<&str> {
        self.status.transaction.as_deref()
    }

    pub fn in_transaction(&self) -> bool {
        self.status.transaction.is_some()
    }

    pub fn classifier(&self) -> &dyn ErrorClassifier {
        self.pool.classifier.as_ref()
    }

    /// Start a transaction on this connection.
    pub async fn begin(&mut self) -> DbResult<Transaction<'_, K>> {
        Transaction::begin(self).await
    }

    /// Borrow the driver session and the status separately.
    pub(crate) fn split(&mut self) -> DbResult<(&mut K::Connection, &mut ConnectionStatus)> {
        let id = self.status.id;
        if self.status.state != ConnectionState::InUse || self.status.in_flight {
            return Err(DbError::transient(format!("connection {} is broken", id)));
        }
        match self.conn.as_mut() {
            Some(conn) => Ok((conn, &mut self.status)),
            None => Err(DbError::transient(format!("connection {} is closed", id))),
        }
    }

    /// The driver session, whatever the connection's state.
    pub(crate) fn driver_mut(&mut self) -> Option<&mut K::Connection> {
        self.conn.as_mut()
    }

    /// Bring the connection to a usable state before a new operation:
    /// flag an abandoned statement and finish a pending rollback.
    pub(crate) async fn settle(&mut self) -> DbResult<()> {
        if self.status.in_flight {
            self.status.in_flight = false;
            warn!(
                connection_id = self.status.id,
                "Previous statement was abandoned mid-flight, marking connection broken"
            );
            self.mark_broken();
            self.status.transaction = None;
            self.status.pending_rollback = false;
        }

        if self.status.pending_rollback {
            self.status.pending_rollback = false;
            let result = {
                let (driver, status) = self.split()?;
                status.in_flight = true;
                let result = driver.rollback().await;
                status.in_flight = false;
                result
            };
            match result {
                Ok(()) => debug!(
                    connection_id = self.status.id,
                    "Rolled back dropped transaction"
                ),
                Err(e) => {
                    warn!(
                        connection_id = self.status.id,
                        error = %e,
                        "Rollback of dropped transaction failed"
                    );
                    self.mark_broken();
                    return Err(self.pool.classifier.to_db_error(e));
                }
            }
        }

        // Fails for broken connections.
        self.split().map(|_| ())
    }

    /// Run one driver call, tracking it as in flight.
    pub(crate) async fn call<T, F>(&mut self, f: F) -> DbResult<T>
    where
        F: for<'a> FnOnce(&'a mut K::Connection) -> BoxFuture<'a, Result<T, DriverError>>,
    {
        let result = {
            let (driver, status) = self.split()?;
            status.in_flight = true;
            let result = f(driver).await;
            status.in_flight = false;
            result
        };
        match result {
            Ok(value) => Ok(value),
            Err(e) => Err(self.fail(e).await),
        }
    }

    /// Classify a driver failure, evict the connection if the failure left
    /// it unusable, and roll back any open transaction.
    pub(crate) async fn fail(&mut self, err: DriverError) -> DbError {
        let kind = self.pool.classifier.classify(&err);
        if kind.breaks_connection() && self.status.state != ConnectionState::Broken {
            warn!(
                connection_id = self.status.id,
                kind = %kind,
                error = %err,
                "Driver failure left connection unusable"
            );
            self.mark_broken();
        }
        let error = DbError::store(kind, err.message, err.code);
        self.abort_transaction().await;
        error
    }

    /// Roll back any open transaction ahead of surfacing `error`.
    pub(crate) async fn reject(&mut self, error: DbError) -> DbError {
        self.abort_transaction().await;
        error
    }

    async fn abort_transaction(&mut self) {
        let Some(transaction_id) = self.status.transaction.take() else {
            return;
        };
        if self.status.state == ConnectionState::Broken {
            // Closing the session discards the transaction.
            warn!(
                connection_id = self.status.id,
                transaction_id = %transaction_id,
                "Transaction abandoned with broken connection"
            );
            return;
        }

        let result = match self.split() {
            Ok((driver, status)) => {
                status.in_flight = true;
                let result = driver.rollback().await;
                status.in_flight = false;
                result
            }
            Err(_) => return,
        };
        match result {
            Ok(()) => info!(
                connection_id = self.status.id,
                transaction_id = %transaction_id,
                "Rolled back transaction after error"
            ),
            Err(e) => {
                warn!(
                    connection_id = self.status.id,
                    transaction_id = %transaction_id,
                    error = %e,
                    "Rollback after error failed"
                );
                self.mark_broken();
            }
        }
    }

    pub(crate) fn open_transaction(&mut self, transaction_id: String) {
        self.status.transaction = Some(transaction_id);
    }

    /// Clear the transaction slot if it still holds `transaction_id`.
    pub(crate) fn close_transaction(&mut self, transaction_id: &str) -> bool {
        if self.status.transaction.as_deref() == Some(transaction_id) {
            self.status.transaction = None;
            true
        } else {
            false
        }
    }

    /// A transaction went out of scope while active: roll it back before
    /// the connection is used again or recycled.
    pub(crate) fn abandon_transaction(&mut self, transaction_id: &str) {
        if self.close_transaction(transaction_id) {
            self.status.pending_rollback = true;
        }
    }

    /// (broken, needs rollback)
    fn disposition(&self) -> (bool, bool) {
        let broken = self.status.in_flight || self.status.state != ConnectionState::InUse;
        let rollback = self.status.transaction.is_some() || self.status.pending_rollback;
        (broken, rollback)
    }

    /// Return the connection, waiting for rollback or close to finish.
    pub async fn release(mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        let permit = self.permit.take();
        let id = self.status.id;
        let (broken, rollback) = self.disposition();
        if !broken && !rollback && !self.pool.is_closed() {
            self.pool.push_idle(id, conn);
            self.pool.finish_checkout();
        } else {
            self.pool.reclaim(id, conn, broken, rollback).await;
        }
        drop(permit);
    }
}

impl<K: Connector> Drop for PooledConnection<K> {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        let id = self.status.id;
        let (broken, rollback) = self.disposition();

        if !broken && !rollback && !self.pool.is_closed() {
            self.pool.push_idle(id, conn);
            self.pool.finish_checkout();
            return;
        }

        // Rollback and close are async; the permit moves into the task so
        // the slot stays taken until the work is done.
        let pool = Arc::clone(&self.pool);
        let permit = self.permit.take();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    pool.reclaim(id, conn, broken, rollback).await;
                    drop(permit);
                });
            }
            Err(_) => {
                warn!(
                    connection_id = id,
                    "No async runtime to clean up connection, dropping it"
                );
                drop(conn);
                pool.free_slot();
                pool.finish_checkout();
            }
        }
    }
}

/// Anything that can lend its connection for one statement: a pooled
/// connection or an open transaction.
pub trait AsConnection<K: Connector>: Send {
    fn as_connection(&mut self) -> &mut PooledConnection<K>;

    /// The connection, if this scope may still issue statements. A
    /// transaction that has ended refuses with `TransactionAlreadyClosed`.
    fn usable_connection(&mut self) -> DbResult<&mut PooledConnection<K>> {
        Ok(self.as_connection())
    }
}

impl<K: Connector> AsConnection<K> for PooledConnection<K> {
    fn as_connection(&mut self) -> &mut PooledConnection<K> {
        self
    }
}
