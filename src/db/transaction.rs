//! Transaction management.
//!
//! A [`Transaction`] borrows one pooled connection for its whole lifetime,
//! so every statement issued through it runs on the same session in order.
//! The transaction object holds the state machine; the connection only
//! carries the id of the transaction currently open on it, which is how the
//! two stay in sync when an error on the connection forces a rollback.
//!
//! A transaction that goes out of scope while still active is rolled back
//! before its connection is used again or returned to the pool. Once a
//! transaction has ended, for whatever reason, statements issued through it
//! fail with `TransactionAlreadyClosed`.

use crate::db::pool::{AsConnection, PooledConnection};
use crate::driver::{Connector, DriverConnection};
use crate::error::{DbError, DbResult};
use futures_util::future::BoxFuture;
use std::fmt;
use tracing::{debug, info, warn};

/// Generate a unique transaction ID.
pub fn generate_transaction_id() -> String {
    format!("tx_{}", uuid::Uuid::new_v4().simple())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    Committed,
    RolledBack,
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => f.write_str("active"),
            Self::Committed => f.write_str("committed"),
            Self::RolledBack => f.write_str("rolled back"),
        }
    }
}

/// An open transaction bound to one connection.
pub struct Transaction<'c, K: Connector> {
    conn: &'c mut PooledConnection<K>,
    id: String,
    state: TransactionState,
}

impl<K: Connector> fmt::Debug for Transaction<'_, K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("connection_id", &self.conn.id())
            .field("state", &self.state())
            .finish()
    }
}

impl<'c, K: Connector> Transaction<'c, K> {
    /// Start a transaction on `conn`, disabling autocommit until it ends.
    pub async fn begin(conn: &'c mut PooledConnection<K>) -> DbResult<Self> {
        if conn.in_transaction() {
            return Err(DbError::TransactionAlreadyActive {
                connection_id: conn.id(),
            });
        }
        conn.settle().await?;

        conn.call(|driver| driver.begin()).await?;
        let id = generate_transaction_id();
        conn.open_transaction(id.clone());
        info!(
            transaction_id = %id,
            connection_id = conn.id(),
            "Transaction started"
        );

        Ok(Self {
            conn,
            id,
            state: TransactionState::Active,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current state. A transaction rolled back because of an error on its
    /// connection reports `RolledBack`.
    pub fn state(&self) -> TransactionState {
        match self.state {
            TransactionState::Active if self.conn.transaction_id() != Some(self.id.as_str()) => {
                TransactionState::RolledBack
            }
            state => state,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state() == TransactionState::Active
    }

    /// The connection this transaction runs on. Statements issued on it
    /// directly skip the check that the transaction is still open.
    pub fn connection(&mut self) -> &mut PooledConnection<K> {
        &mut *self.conn
    }

    fn ensure_active(&mut self) -> DbResult<()> {
        if self.is_active() {
            return Ok(());
        }
        if self.state == TransactionState::Active {
            self.state = TransactionState::RolledBack;
        }
        Err(DbError::transaction_closed(self.id.clone()))
    }

    /// Commit and re-enable autocommit. If the commit fails the transaction
    /// is rolled back and the error returned.
    pub async fn commit(&mut self) -> DbResult<()> {
        self.ensure_active()?;

        match self.conn.call(|driver| driver.commit()).await {
            Ok(()) => {
                self.conn.close_transaction(&self.id);
                self.state = TransactionState::Committed;
                info!(transaction_id = %self.id, "Transaction committed");
                Ok(())
            }
            Err(e) => {
                // The failed call already rolled back and cleared the slot.
                self.conn.close_transaction(&self.id);
                self.state = TransactionState::RolledBack;
                warn!(transaction_id = %self.id, error = %e, "Commit failed");
                Err(e)
            }
        }
    }

    /// Roll back and re-enable autocommit.
    pub async fn rollback(&mut self) -> DbResult<()> {
        self.ensure_active()?;

        self.conn.close_transaction(&self.id);
        self.state = TransactionState::RolledBack;
        match self.conn.call(|driver| driver.rollback()).await {
            Ok(()) => {
                info!(transaction_id = %self.id, "Transaction rolled back");
                Ok(())
            }
            Err(e) => {
                // The session is in an unknown state.
                self.conn.mark_broken();
                warn!(transaction_id = %self.id, error = %e, "Rollback failed");
                Err(e)
            }
        }
    }
}

impl<K: Connector> Drop for Transaction<'_, K> {
    fn drop(&mut self) {
        if self.state == TransactionState::Active && self.conn.transaction_id() == Some(self.id.as_str()) {
            debug!(
                transaction_id = %self.id,
                connection_id = self.conn.id(),
                "Transaction dropped while active, rollback scheduled"
            );
            self.conn.abandon_transaction(&self.id);
        }
    }
}

impl<K: Connector> AsConnection<K> for Transaction<'_, K> {
    fn as_connection(&mut self) -> &mut PooledConnection<K> {
        &mut *self.conn
    }

    /// Statements after the transaction ended would run in autocommit mode,
    /// outside the transaction, so they are refused.
    fn usable_connection(&mut self) -> DbResult<&mut PooledConnection<K>> {
        self.ensure_active()?;
        Ok(&mut *self.conn)
    }
}

/// Run `f` inside a transaction on `conn`.
///
/// Commits when `f` returns `Ok`; rolls back and returns the error when it
/// returns `Err`. If the rollback itself fails, the original error is still
/// the one returned. A body that returns `Ok` after its transaction was
/// rolled back (for example by a failed statement whose error it ignored)
/// fails with `TransactionAlreadyClosed`; nothing it did was committed.
pub async fn with_transaction<K, R, F>(conn: &mut PooledConnection<K>, f: F) -> DbResult<R>
where
    K: Connector,
    R: Send,
    F: for<'t> FnOnce(&'t mut Transaction<'_, K>) -> BoxFuture<'t, DbResult<R>> + Send,
{
    let mut tx = Transaction::begin(conn).await?;
    match f(&mut tx).await {
        Ok(value) => match tx.state() {
            TransactionState::Active => {
                tx.commit().await?;
                Ok(value)
            }
            // The body committed explicitly.
            TransactionState::Committed => Ok(value),
            TransactionState::RolledBack => {
                warn!(
                    transaction_id = %tx.id(),
                    "Transaction body succeeded after its transaction was rolled back"
                );
                Err(DbError::transaction_closed(tx.id().to_string()))
            }
        },
        Err(err) => {
            if tx.is_active() {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(
                        transaction_id = %tx.id(),
                        error = %rollback_err,
                        "Rollback after failed transaction body also failed"
                    );
                }
            } else {
                debug!(transaction_id = %tx.id(), "Transaction already closed by failure");
            }
            Err(err)
        }
    }
}
