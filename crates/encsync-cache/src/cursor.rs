//! Keyset-paginated streams over a CDB connection
//!
//! The executor owns the only SQLite handle, so a long-lived statement
//! cannot be kept open on behalf of a reader. A [`Cursor`] instead re-issues
//! its query in batches, continuing after the last key it returned. The key
//! column must be unique and the query ordered on it.

use std::collections::VecDeque;

use crate::cdb::Connection;
use crate::value::{Row, SqlValue};
use crate::CacheError;

/// Default number of rows fetched per round trip
pub const DEFAULT_BATCH_SIZE: usize = 500;

/// Turns a row into its key and the decoded item.
pub type Decoder<T> = fn(&Row) -> Result<(SqlValue, T), CacheError>;

/// A lazy, ordered stream of decoded rows
///
/// The query binds the last seen key as `?1` and any extra parameters as
/// `?2..`; the cursor appends the `LIMIT` clause itself.
pub struct Cursor<T> {
    conn: Connection,
    sql: String,
    params: Vec<SqlValue>,
    last_key: SqlValue,
    batch_size: usize,
    buffer: VecDeque<T>,
    exhausted: bool,
    decode: Decoder<T>,
}

impl<T> Cursor<T> {
    pub(crate) fn new(
        conn: Connection,
        sql: impl Into<String>,
        start: SqlValue,
        params: Vec<SqlValue>,
        decode: Decoder<T>,
    ) -> Self {
        Self {
            conn,
            sql: sql.into(),
            params,
            last_key: start,
            batch_size: DEFAULT_BATCH_SIZE,
            buffer: VecDeque::new(),
            exhausted: false,
            decode,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Returns the next item, or `None` once the query is exhausted.
    pub async fn next(&mut self) -> Result<Option<T>, CacheError> {
        if self.buffer.is_empty() && !self.exhausted {
            self.fill().await?;
        }
        Ok(self.buffer.pop_front())
    }

    /// Drains the cursor into a vector.
    pub async fn collect_all(mut self) -> Result<Vec<T>, CacheError> {
        let mut items = Vec::new();
        while let Some(item) = self.next().await? {
            items.push(item);
        }
        Ok(items)
    }

    async fn fill(&mut self) -> Result<(), CacheError> {
        let mut params = Vec::with_capacity(self.params.len() + 1);
        params.push(self.last_key.clone());
        params.extend(self.params.iter().cloned());

        let sql = format!("{} LIMIT {}", self.sql, self.batch_size);
        let rows = self.conn.fetch_all(sql, params).await?;
        if rows.len() < self.batch_size {
            self.exhausted = true;
        }
        for row in &rows {
            let (key, item) = (self.decode)(row)?;
            self.last_key = key;
            self.buffer.push_back(item);
        }
        Ok(())
    }
}
