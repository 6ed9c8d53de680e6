//! Duplist inventory: extra ciphertexts found on one storage
//!
//! An encrypted storage may hold several ciphertext names that decrypt to
//! the same plaintext path. The scanner keeps the newest one in the
//! filelist and records every other one here, with the IVs needed to
//! rebuild its exact storage name.

use std::path::Path;

use encsync_core::domain::{path, Duplicate, NodeType};
use tracing::{debug, info};

use crate::cdb::{CdbRegistry, Connection};
use crate::cursor::Cursor;
use crate::filelist::escape_glob;
use crate::layout::DataDir;
use crate::value::{Row, SqlValue};
use crate::CacheError;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS duplist (
    type TEXT NOT NULL,
    IVs BLOB,
    path TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS duplist_path_index ON duplist(path ASC);
";

fn decode_duplicate(row: &Row) -> Result<(SqlValue, Duplicate), CacheError> {
    let rowid = row.integer(0)?;
    let duplicate = Duplicate {
        node_type: row.text(1)?.parse::<NodeType>()?,
        ivs: row.blob(2)?,
        path: row.text(3)?,
    };
    Ok((SqlValue::Integer(rowid), duplicate))
}

/// Duplicates of one storage
#[derive(Debug, Clone)]
pub struct Duplist {
    conn: Connection,
}

impl Duplist {
    pub async fn open(
        registry: &CdbRegistry,
        layout: &DataDir,
        storage_name: &str,
    ) -> Result<Self, CacheError> {
        let conn = registry.connect(&layout.duplist_path(storage_name)).await?;
        Self::with_connection(conn).await
    }

    /// Opens a duplist stored at an arbitrary path, such as a snapshot.
    pub async fn open_at(registry: &CdbRegistry, path: &Path) -> Result<Self, CacheError> {
        Self::with_connection(registry.connect(path).await?).await
    }

    pub async fn with_connection(conn: Connection) -> Result<Self, CacheError> {
        conn.execute_script(SCHEMA)
            .await
            .map_err(|e| CacheError::Migration(e.to_string()))?;
        Ok(Self { conn })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub async fn insert(&self, duplicate: &Duplicate) -> Result<(), CacheError> {
        let path = if duplicate.node_type.is_dir() {
            path::normalize_dir(&duplicate.path)
        } else {
            duplicate.path.clone()
        };
        self.conn
            .execute(
                "INSERT INTO duplist (type, IVs, path) VALUES (?1, ?2, ?3)",
                vec![
                    duplicate.node_type.as_str().into(),
                    duplicate.ivs.clone().into(),
                    path.into(),
                ],
            )
            .await?;
        Ok(())
    }

    /// Removes the entry for one exact ciphertext.
    pub async fn remove(&self, path: &str, ivs: &[u8]) -> Result<u64, CacheError> {
        let result = self
            .conn
            .execute(
                "DELETE FROM duplist WHERE (path = ?1 OR path = ?2) AND IVs = ?3",
                vec![path.into(), path::normalize_dir(path).into(), ivs.into()],
            )
            .await?;
        Ok(result.rows_affected)
    }

    /// Removes every entry at or below `prefix`.
    pub async fn remove_children(&self, prefix: &str) -> Result<u64, CacheError> {
        let dir = path::normalize_dir(prefix);
        let result = self
            .conn
            .execute(
                "DELETE FROM duplist WHERE path = ?1 OR path GLOB ?2",
                vec![
                    dir.clone().into(),
                    format!("{}?*", escape_glob(&dir)).into(),
                ],
            )
            .await?;
        debug!(prefix, removed = result.rows_affected, "Cleared duplicates");
        Ok(result.rows_affected)
    }

    /// Streams the entries below `prefix` in insertion order.
    pub fn select_children(&self, prefix: &str) -> Cursor<Duplicate> {
        let dir = path::normalize_dir(prefix);
        Cursor::new(
            self.conn.clone(),
            "SELECT rowid, type, IVs, path FROM duplist WHERE rowid > ?1 AND path GLOB ?2 \
             ORDER BY rowid ASC",
            SqlValue::Integer(0),
            vec![format!("{}?*", escape_glob(&dir)).into()],
            decode_duplicate,
        )
    }

    pub fn select_all(&self) -> Cursor<Duplicate> {
        Cursor::new(
            self.conn.clone(),
            "SELECT rowid, type, IVs, path FROM duplist WHERE rowid > ?1 ORDER BY rowid ASC",
            SqlValue::Integer(0),
            Vec::new(),
            decode_duplicate,
        )
    }

    pub async fn count(&self) -> Result<u64, CacheError> {
        let row = self
            .conn
            .fetch_one("SELECT COUNT(*) FROM duplist", Vec::new())
            .await?;
        Ok(row.map(|r| r.integer(0)).transpose()?.unwrap_or(0).max(0) as u64)
    }

    pub async fn clear(&self) -> Result<(), CacheError> {
        self.conn.execute("DELETE FROM duplist", Vec::new()).await?;
        Ok(())
    }

    /// Writes a consistent copy of the duplist to `dest`.
    ///
    /// The copy lets a long removal pass iterate without holding a read
    /// transaction on the live file. `dest` must not exist.
    pub async fn snapshot(&self, dest: &Path) -> Result<(), CacheError> {
        let target = dest.to_string_lossy().replace('\'', "''");
        self.conn
            .execute(format!("VACUUM INTO '{target}'"), Vec::new())
            .await?;
        info!(dest = %dest.display(), "Duplist snapshot written");
        Ok(())
    }

    pub async fn begin(&self) -> Result<(), CacheError> {
        self.conn.begin().await
    }

    pub async fn commit(&self) -> Result<(), CacheError> {
        self.conn.commit().await
    }

    pub async fn rollback(&self) -> Result<(), CacheError> {
        self.conn.rollback().await
    }

    pub async fn seamless_commit(&self) -> Result<bool, CacheError> {
        self.conn.seamless_commit().await
    }
}
