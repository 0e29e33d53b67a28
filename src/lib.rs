//! Generic relational data-access core.
//!
//! This library provides a bounded connection pool, a prepared-statement
//! executor with lazy row streams, batched and transactional execution, a
//! closed error taxonomy with retry eligibility, and a generic repository
//! over injected entity mappings. Database products plug in through the
//! [`driver`] traits; a SQLite driver built on sqlx is included.

pub mod config;
pub mod db;
pub mod driver;
pub mod error;
pub mod repository;

pub use config::PoolOptions;
pub use db::{
    AsConnection, BatchJob, FromSqlValue, Pool, PooledConnection, Row, SqlValue,
    StatementExecutor, Transaction,
};
pub use error::{DbError, DbResult, ErrorKind};
pub use repository::{EntityMapping, KeyStrategy, Repository, Statements};
