//! Data-access core.
//!
//! This module provides:
//! - Connection pool management
//! - Prepared statement execution and row streaming
//! - Batched execution
//! - Transaction management
//! - Driver failure classification
//! - Caller-controlled retry

pub mod batch;
pub mod classify;
pub mod executor;
pub mod pool;
pub mod retry;
pub mod transaction;
pub mod value;

pub use batch::BatchJob;
pub use classify::{DefaultClassifier, ErrorClassifier};
pub use executor::{RowStream, StatementExecutor};
pub use pool::{AsConnection, ConnectionState, Pool, PoolStats, PooledConnection};
pub use retry::{RetryPolicy, with_retry};
pub use transaction::{Transaction, TransactionState, with_transaction};
pub use value::{ColumnIndex, FromSqlValue, Row, SqlValue, ValueKind};
