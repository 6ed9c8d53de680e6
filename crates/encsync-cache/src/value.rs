//! Dynamically typed SQLite values
//!
//! Requests cross a thread boundary to reach the executor, so parameters and
//! results travel as owned [`SqlValue`]s rather than borrowed sqlx types.

use sqlx::query::Query;
use sqlx::sqlite::{Sqlite, SqliteArguments, SqliteRow};
use sqlx::{Row as _, TypeInfo, ValueRef};

use crate::CacheError;

/// One SQLite value
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Integer(v)
    }
}

impl From<u64> for SqlValue {
    fn from(v: u64) -> Self {
        SqlValue::Integer(i64::try_from(v).unwrap_or(i64::MAX))
    }
}

impl From<usize> for SqlValue {
    fn from(v: usize) -> Self {
        SqlValue::from(v as u64)
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        SqlValue::Real(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl From<&String> for SqlValue {
    fn from(v: &String) -> Self {
        SqlValue::Text(v.clone())
    }
}

impl From<Vec<u8>> for SqlValue {
    fn from(v: Vec<u8>) -> Self {
        SqlValue::Blob(v)
    }
}

impl From<&[u8]> for SqlValue {
    fn from(v: &[u8]) -> Self {
        SqlValue::Blob(v.to_vec())
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(SqlValue::Null)
    }
}

/// A fetched row
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Row(pub Vec<SqlValue>);

impl Row {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<&SqlValue> {
        self.0.get(idx)
    }

    fn value(&self, idx: usize) -> Result<&SqlValue, CacheError> {
        self.0
            .get(idx)
            .ok_or_else(|| CacheError::Decode(format!("column {idx} out of range")))
    }

    pub fn integer(&self, idx: usize) -> Result<i64, CacheError> {
        match self.value(idx)? {
            SqlValue::Integer(v) => Ok(*v),
            SqlValue::Null => Ok(0),
            other => Err(CacheError::Decode(format!(
                "column {idx}: expected integer, got {other:?}"
            ))),
        }
    }

    pub fn text(&self, idx: usize) -> Result<String, CacheError> {
        match self.value(idx)? {
            SqlValue::Text(v) => Ok(v.clone()),
            SqlValue::Blob(v) => String::from_utf8(v.clone())
                .map_err(|e| CacheError::Decode(format!("column {idx}: {e}"))),
            other => Err(CacheError::Decode(format!(
                "column {idx}: expected text, got {other:?}"
            ))),
        }
    }

    pub fn blob(&self, idx: usize) -> Result<Vec<u8>, CacheError> {
        match self.value(idx)? {
            SqlValue::Blob(v) => Ok(v.clone()),
            SqlValue::Text(v) => Ok(v.clone().into_bytes()),
            SqlValue::Null => Ok(Vec::new()),
            other => Err(CacheError::Decode(format!(
                "column {idx}: expected blob, got {other:?}"
            ))),
        }
    }
}

/// Builds a query with every parameter bound in order.
pub(crate) fn bind_all<'q>(
    sql: &'q str,
    params: &'q [SqlValue],
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    let mut query = sqlx::query(sql);
    for param in params {
        query = match param {
            SqlValue::Null => query.bind(None::<i64>),
            SqlValue::Integer(v) => query.bind(*v),
            SqlValue::Real(v) => query.bind(*v),
            SqlValue::Text(v) => query.bind(v.as_str()),
            SqlValue::Blob(v) => query.bind(v.as_slice()),
        };
    }
    query
}

/// Converts a sqlx row using the storage class of each value.
pub(crate) fn decode_row(row: &SqliteRow) -> Result<Row, CacheError> {
    let mut values = Vec::with_capacity(row.len());
    for idx in 0..row.len() {
        let raw = row.try_get_raw(idx)?;
        if raw.is_null() {
            values.push(SqlValue::Null);
            continue;
        }
        let type_name = raw.type_info().name().to_ascii_uppercase();
        let value = match type_name.as_str() {
            "INTEGER" | "INT" | "INT8" | "BIGINT" | "BOOLEAN" => {
                SqlValue::Integer(row.try_get_unchecked::<i64, _>(idx)?)
            }
            "REAL" | "FLOAT" | "DOUBLE" => SqlValue::Real(row.try_get_unchecked::<f64, _>(idx)?),
            "BLOB" => SqlValue::Blob(row.try_get_unchecked::<Vec<u8>, _>(idx)?),
            _ => SqlValue::Text(row.try_get_unchecked::<String, _>(idx)?),
        };
        values.push(value);
    }
    Ok(Row(values))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversions() {
        assert_eq!(SqlValue::from(3i64), SqlValue::Integer(3));
        assert_eq!(SqlValue::from(u64::MAX), SqlValue::Integer(i64::MAX));
        assert_eq!(SqlValue::from("a"), SqlValue::Text("a".into()));
        assert_eq!(SqlValue::from(None::<String>), SqlValue::Null);
        assert_eq!(SqlValue::from(vec![1u8]), SqlValue::Blob(vec![1]));
    }

    #[test]
    fn row_accessors() {
        let row = Row(vec![
            SqlValue::Integer(7),
            SqlValue::Text("p".into()),
            SqlValue::Null,
        ]);
        assert_eq!(row.integer(0).unwrap(), 7);
        assert_eq!(row.text(1).unwrap(), "p");
        assert_eq!(row.blob(2).unwrap(), Vec::<u8>::new());
        assert!(row.text(0).is_err());
        assert!(row.integer(5).is_err());
    }
}
