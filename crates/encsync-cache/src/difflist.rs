//! Difflist inventory: planned mutations of every target
//!
//! A single file holds the differences of all targets, keyed by the
//! `(src_folder_name, dst_folder_name)` pair. Rows are emitted in merge
//! order, so reading by `rowid` replays them in path order.

use encsync_core::domain::{DiffType, Difference, NodeType};
use serde::Serialize;

use crate::cdb::{CdbRegistry, Connection};
use crate::cursor::Cursor;
use crate::layout::DataDir;
use crate::value::{Row, SqlValue};
use crate::CacheError;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS difflist (
    diff_type TEXT NOT NULL,
    node_type TEXT NOT NULL,
    path TEXT NOT NULL,
    src_folder_name TEXT NOT NULL,
    dst_folder_name TEXT NOT NULL,
    IVs BLOB
);
CREATE INDEX IF NOT EXISTS difflist_path_index ON difflist(path ASC);
CREATE INDEX IF NOT EXISTS difflist_target_index ON difflist(src_folder_name, dst_folder_name);
";

const COLUMNS: &str = "rowid, diff_type, node_type, path, src_folder_name, dst_folder_name, IVs";

fn decode_difference(row: &Row) -> Result<(SqlValue, Difference), CacheError> {
    let rowid = row.integer(0)?;
    let difference = Difference {
        id: Some(rowid),
        diff_type: row.text(1)?.parse::<DiffType>()?,
        node_type: row.text(2)?.parse::<NodeType>()?,
        path: row.text(3)?,
        src_folder_name: row.text(4)?,
        dst_folder_name: row.text(5)?,
        ivs: row.blob(6)?,
    };
    Ok((SqlValue::Integer(rowid), difference))
}

/// Number of pending differences per type
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DiffSummary {
    pub new: u64,
    pub update: u64,
    pub rm: u64,
    pub rmdup: u64,
}

impl DiffSummary {
    pub fn total(&self) -> u64 {
        self.new + self.update + self.rm + self.rmdup
    }

    pub fn get(&self, diff_type: DiffType) -> u64 {
        match diff_type {
            DiffType::New => self.new,
            DiffType::Update => self.update,
            DiffType::Rm => self.rm,
            DiffType::Rmdup => self.rmdup,
        }
    }

    fn add(&mut self, diff_type: DiffType, n: u64) {
        match diff_type {
            DiffType::New => self.new += n,
            DiffType::Update => self.update += n,
            DiffType::Rm => self.rm += n,
            DiffType::Rmdup => self.rmdup += n,
        }
    }
}

/// Differences of all targets
#[derive(Debug, Clone)]
pub struct Difflist {
    conn: Connection,
}

impl Difflist {
    pub async fn open(registry: &CdbRegistry, layout: &DataDir) -> Result<Self, CacheError> {
        let conn = registry.connect(&layout.difflist_path()).await?;
        Self::with_connection(conn).await
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

    /// Appends a difference and returns its row id.
    pub async fn insert(&self, difference: &Difference) -> Result<i64, CacheError> {
        let result = self
            .conn
            .execute(
                "INSERT INTO difflist (diff_type, node_type, path, src_folder_name, \
                 dst_folder_name, IVs) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                vec![
                    difference.diff_type.as_str().into(),
                    difference.node_type.as_str().into(),
                    (&difference.path).into(),
                    (&difference.src_folder_name).into(),
                    (&difference.dst_folder_name).into(),
                    difference.ivs.clone().into(),
                ],
            )
            .await?;
        Ok(result.last_insert_id)
    }

    pub async fn remove(&self, id: i64) -> Result<(), CacheError> {
        self.conn
            .execute("DELETE FROM difflist WHERE rowid = ?1", vec![id.into()])
            .await?;
        Ok(())
    }

    /// Drops every difference of the `(src, dst)` target.
    pub async fn clear_target(&self, src: &str, dst: &str) -> Result<u64, CacheError> {
        let result = self
            .conn
            .execute(
                "DELETE FROM difflist WHERE src_folder_name = ?1 AND dst_folder_name = ?2",
                vec![src.into(), dst.into()],
            )
            .await?;
        Ok(result.rows_affected)
    }

    pub async fn count_target(&self, src: &str, dst: &str) -> Result<u64, CacheError> {
        Ok(self.summary(src, dst).await?.total())
    }

    pub async fn summary(&self, src: &str, dst: &str) -> Result<DiffSummary, CacheError> {
        let rows = self
            .conn
            .fetch_all(
                "SELECT diff_type, COUNT(*) FROM difflist \
                 WHERE src_folder_name = ?1 AND dst_folder_name = ?2 GROUP BY diff_type",
                vec![src.into(), dst.into()],
            )
            .await?;
        let mut summary = DiffSummary::default();
        for row in rows {
            let diff_type: DiffType = row.text(0)?.parse()?;
            summary.add(diff_type, row.integer(1)?.max(0) as u64);
        }
        Ok(summary)
    }

    /// Streams the differences of a target in emission order.
    ///
    /// `types` restricts the difference types (all when empty) and
    /// `node_type` the node kind.
    pub fn select(
        &self,
        src: &str,
        dst: &str,
        types: &[DiffType],
        node_type: Option<NodeType>,
    ) -> Cursor<Difference> {
        let mut sql = format!(
            "SELECT {COLUMNS} FROM difflist WHERE rowid > ?1 \
             AND src_folder_name = ?2 AND dst_folder_name = ?3"
        );
        if !types.is_empty() {
            let list: Vec<String> = types.iter().map(|t| format!("'{}'", t.as_str())).collect();
            sql.push_str(&format!(" AND diff_type IN ({})", list.join(", ")));
        }
        if let Some(node_type) = node_type {
            sql.push_str(&format!(" AND node_type = '{}'", node_type.as_str()));
        }
        sql.push_str(" ORDER BY rowid ASC");

        Cursor::new(
            self.conn.clone(),
            sql,
            SqlValue::Integer(0),
            vec![src.into(), dst.into()],
            decode_difference,
        )
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
