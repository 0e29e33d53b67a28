//! Positional parameter values and row projections.
//!
//! Drivers convert between their native types and [`SqlValue`]; everything
//! above the driver boundary only sees these types.

use crate::error::{DbError, DbResult};
use std::fmt;
use std::sync::Arc;

/// A value bound to a positional placeholder or read from a result column.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    /// Stored as i64 for maximum range
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
}

/// Type tag of a [`SqlValue`], used to describe statement shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Null,
    Bool,
    Int,
    Float,
    Text,
    Bytes,
}

impl ValueKind {
    /// Whether a value of kind `other` may be bound where `self` is expected.
    pub fn accepts(self, other: ValueKind) -> bool {
        self == other || other == ValueKind::Null || self == ValueKind::Null
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Null => "null",
            Self::Bool => "bool",
            Self::Int => "int",
            Self::Float => "float",
            Self::Text => "text",
            Self::Bytes => "bytes",
        };
        f.write_str(name)
    }
}

impl SqlValue {
    /// Check if this value is null.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn kind(&self) -> ValueKind {
        match self {
            Self::Null => ValueKind::Null,
            Self::Bool(_) => ValueKind::Bool,
            Self::Int(_) => ValueKind::Int,
            Self::Float(_) => ValueKind::Float,
            Self::Text(_) => ValueKind::Text,
            Self::Bytes(_) => ValueKind::Bytes,
        }
    }
}

impl fmt::Display for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("NULL"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Text(v) => write!(f, "{v:?}"),
            Self::Bytes(v) => write!(f, "<{} bytes>", v.len()),
        }
    }
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for SqlValue {
    fn from(v: i32) -> Self {
        Self::Int(v.into())
    }
}

impl From<u32> for SqlValue {
    fn from(v: u32) -> Self {
        Self::Int(v.into())
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<&String> for SqlValue {
    fn from(v: &String) -> Self {
        Self::Text(v.clone())
    }
}

impl From<Vec<u8>> for SqlValue {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Self::Null)
    }
}

/// Build a parameter list from heterogeneous values.
///
/// ```
/// use dbcore::params;
/// let p = params!["alice", 42_i64, None::<String>];
/// assert_eq!(p.len(), 3);
/// ```
#[macro_export]
macro_rules! params {
    () => { ::std::vec::Vec::<$crate::db::SqlValue>::new() };
    ($($value:expr),+ $(,)?) => {
        vec![$($crate::db::SqlValue::from($value)),+]
    };
}

/// Conversion from a column value into a Rust type.
pub trait FromSqlValue: Sized {
    fn from_sql_value(value: &SqlValue) -> DbResult<Self>;
}

fn mismatch(expected: &str, value: &SqlValue) -> DbError {
    DbError::schema(format!(
        "cannot decode {} value as {}",
        value.kind(),
        expected
    ))
}

impl FromSqlValue for SqlValue {
    fn from_sql_value(value: &SqlValue) -> DbResult<Self> {
        Ok(value.clone())
    }
}

impl FromSqlValue for i64 {
    fn from_sql_value(value: &SqlValue) -> DbResult<Self> {
        match value {
            SqlValue::Int(v) => Ok(*v),
            SqlValue::Bool(v) => Ok(i64::from(*v)),
            other => Err(mismatch("i64", other)),
        }
    }
}

impl FromSqlValue for i32 {
    fn from_sql_value(value: &SqlValue) -> DbResult<Self> {
        let wide = i64::from_sql_value(value)?;
        i32::try_from(wide).map_err(|_| DbError::schema(format!("{wide} does not fit in i32")))
    }
}

impl FromSqlValue for u32 {
    fn from_sql_value(value: &SqlValue) -> DbResult<Self> {
        let wide = i64::from_sql_value(value)?;
        u32::try_from(wide).map_err(|_| DbError::schema(format!("{wide} does not fit in u32")))
    }
}

impl FromSqlValue for f64 {
    fn from_sql_value(value: &SqlValue) -> DbResult<Self> {
        match value {
            SqlValue::Float(v) => Ok(*v),
            SqlValue::Int(v) => Ok(*v as f64),
            other => Err(mismatch("f64", other)),
        }
    }
}

impl FromSqlValue for bool {
    fn from_sql_value(value: &SqlValue) -> DbResult<Self> {
        match value {
            SqlValue::Bool(v) => Ok(*v),
            // SQLite and MySQL store booleans as integers
            SqlValue::Int(v) => Ok(*v != 0),
            other => Err(mismatch("bool", other)),
        }
    }
}

impl FromSqlValue for String {
    fn from_sql_value(value: &SqlValue) -> DbResult<Self> {
        match value {
            SqlValue::Text(v) => Ok(v.clone()),
            other => Err(mismatch("String", other)),
        }
    }
}

impl FromSqlValue for Vec<u8> {
    fn from_sql_value(value: &SqlValue) -> DbResult<Self> {
        match value {
            SqlValue::Bytes(v) => Ok(v.clone()),
            SqlValue::Text(v) => Ok(v.clone().into_bytes()),
            other => Err(mismatch("Vec<u8>", other)),
        }
    }
}

impl<T: FromSqlValue> FromSqlValue for Option<T> {
    fn from_sql_value(value: &SqlValue) -> DbResult<Self> {
        match value {
            SqlValue::Null => Ok(None),
            other => T::from_sql_value(other).map(Some),
        }
    }
}

/// Column lookup for [`Row::get`].
pub trait ColumnIndex {
    fn index(&self, row: &Row) -> DbResult<usize>;
}

impl ColumnIndex for usize {
    fn index(&self, row: &Row) -> DbResult<usize> {
        if *self < row.len() {
            Ok(*self)
        } else {
            Err(DbError::schema(format!(
                "column index {} out of bounds (len: {})",
                self,
                row.len()
            )))
        }
    }
}

impl ColumnIndex for &str {
    fn index(&self, row: &Row) -> DbResult<usize> {
        row.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(self))
            .ok_or_else(|| DbError::schema(format!("column not found: {}", self)))
    }
}

/// One result row: column names shared across the result set plus values.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Arc<[String]>,
    values: Vec<SqlValue>,
}

impl Row {
    pub fn new(columns: Arc<[String]>, values: Vec<SqlValue>) -> Self {
        debug_assert_eq!(columns.len(), values.len());
        Self { columns, values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn values(&self) -> &[SqlValue] {
        &self.values
    }

    pub fn into_values(self) -> Vec<SqlValue> {
        self.values
    }

    /// Get the raw value of a column.
    pub fn value<I: ColumnIndex>(&self, column: I) -> DbResult<&SqlValue> {
        let idx = column.index(self)?;
        Ok(&self.values[idx])
    }

    /// Decode a column into `T`.
    pub fn get<T: FromSqlValue, I: ColumnIndex>(&self, column: I) -> DbResult<T> {
        let idx = column.index(self)?;
        T::from_sql_value(&self.values[idx]).map_err(|e| match e {
            DbError::SyntaxOrSchema { message, code } => DbError::SyntaxOrSchema {
                message: format!("column '{}': {}", self.columns[idx], message),
                code,
            },
            other => other,
        })
    }
}
