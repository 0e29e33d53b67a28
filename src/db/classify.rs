//! Driver failure classification.
//!
//! Every [`DriverError`] is mapped onto exactly one store-level
//! [`ErrorKind`] before it reaches a caller. The driver's own failure
//! category wins when it is specific; otherwise the SQLSTATE class
//! (Postgres/MySQL) or the SQLite primary result code decides. Anything
//! unrecognized is treated as a fatal `SyntaxOrSchema` error so that it is
//! never retried.

use crate::driver::{DriverError, FailureKind};
use crate::error::{DbError, ErrorKind};

/// Maps driver failures onto the closed error taxonomy.
pub trait ErrorClassifier: Send + Sync + 'static {
    fn classify(&self, error: &DriverError) -> ErrorKind;

    /// Classify and convert into the error surfaced to callers.
    fn to_db_error(&self, error: DriverError) -> DbError {
        let kind = self.classify(&error);
        DbError::store(kind, error.message, error.code)
    }
}

/// SQLSTATE and SQLite result-code based classifier.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultClassifier;

impl ErrorClassifier for DefaultClassifier {
    fn classify(&self, error: &DriverError) -> ErrorKind {
        match error.failure {
            FailureKind::Io | FailureKind::Timeout | FailureKind::Closed | FailureKind::Protocol => {
                ErrorKind::Transient
            }
            FailureKind::Authentication | FailureKind::Configuration => ErrorKind::AuthFailure,
            FailureKind::Constraint => ErrorKind::ConstraintViolation,
            FailureKind::Syntax | FailureKind::Decode => ErrorKind::SyntaxOrSchema,
            FailureKind::Limit => ErrorKind::ResourceExhausted,
            FailureKind::Database | FailureKind::Other => error
                .code
                .as_deref()
                .and_then(classify_code)
                .unwrap_or(ErrorKind::SyntaxOrSchema),
        }
    }
}

/// Classify a store code. Numeric codes are SQLite result codes, five
/// character codes are SQLSTATEs.
pub fn classify_code(code: &str) -> Option<ErrorKind> {
    if let Ok(numeric) = code.parse::<i64>() {
        if code.len() != 5 {
            return Some(classify_sqlite_code(numeric));
        }
    }
    classify_sqlstate(code)
}

/// Classify a SQLSTATE by its two character class.
pub fn classify_sqlstate(state: &str) -> Option<ErrorKind> {
    if state.len() != 5 {
        return None;
    }
    let class = state.get(..2)?;
    let kind = match class {
        // connection exception, transaction rollback (serialization, deadlock),
        // operator intervention (admin shutdown, cannot connect now)
        "08" | "40" | "57" => ErrorKind::Transient,
        "HY" if state == "HYT00" || state == "HYT01" => ErrorKind::Transient,
        "23" => ErrorKind::ConstraintViolation,
        "28" => ErrorKind::AuthFailure,
        // syntax/access rule, invalid catalog, feature not supported
        "42" | "3D" | "3F" | "0A" => ErrorKind::SyntaxOrSchema,
        // insufficient resources, program limit exceeded
        "53" | "54" => ErrorKind::ResourceExhausted,
        _ => return None,
    };
    Some(kind)
}

/// Classify a SQLite (possibly extended) result code by its primary code.
pub fn classify_sqlite_code(code: i64) -> ErrorKind {
    match code & 0xff {
        // BUSY, LOCKED, IOERR, CANTOPEN, PROTOCOL
        5 | 6 | 10 | 14 | 15 => ErrorKind::Transient,
        19 => ErrorKind::ConstraintViolation,
        // PERM, READONLY, AUTH
        3 | 8 | 23 => ErrorKind::AuthFailure,
        // NOMEM, FULL, TOOBIG
        7 | 13 | 18 => ErrorKind::ResourceExhausted,
        _ => ErrorKind::SyntaxOrSchema,
    }
}
