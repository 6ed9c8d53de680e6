//! Filelist inventory: the observed nodes of one folder
//!
//! Rows keep absolute `/` paths (the folder prefix included) so that the
//! lexicographically smallest row is the folder root. Reading in `path`
//! order yields the sorted stream the diff engine merges on.
//!
//! ## Schema
//!
//! | Column        | SQL Type | Notes                                  |
//! |---------------|----------|----------------------------------------|
//! | `type`        | TEXT     | `f` or `d`                             |
//! | `modified`    | INTEGER  | Unix seconds                           |
//! | `padded_size` | INTEGER  | Size rounded up to 16 bytes, 0 for dirs |
//! | `path`        | TEXT     | `UNIQUE ON CONFLICT REPLACE`           |
//! | `IVs`         | BLOB     | 16 bytes per segment below the prefix   |

use encsync_core::domain::node::timestamp_to_datetime;
use encsync_core::domain::{path, Node, NodeType};
use tracing::debug;

use crate::cdb::{CdbRegistry, Connection, ScopeGuard};
use crate::cursor::Cursor;
use crate::layout::DataDir;
use crate::value::{Row, SqlValue};
use crate::CacheError;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS filelist (
    type TEXT NOT NULL,
    modified INTEGER NOT NULL,
    padded_size INTEGER NOT NULL,
    path TEXT UNIQUE ON CONFLICT REPLACE,
    IVs BLOB
);
CREATE INDEX IF NOT EXISTS filelist_path_index ON filelist(path ASC);
";

const COLUMNS: &str = "type, modified, padded_size, path, IVs";

/// Ordered stream of filelist nodes
pub type NodeCursor = Cursor<Node>;

/// Escapes the GLOB metacharacters of a literal path.
pub fn escape_glob(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '*' => out.push_str("[*]"),
            '?' => out.push_str("[?]"),
            '[' => out.push_str("[[]"),
            ']' => out.push_str("[]]"),
            other => out.push(other),
        }
    }
    out
}

/// GLOB pattern matching every strict descendant of `path`.
fn children_pattern(path: &str) -> String {
    format!("{}?*", escape_glob(&path::normalize_dir(path)))
}

fn decode_node(row: &Row) -> Result<(SqlValue, Node), CacheError> {
    let node_type: NodeType = row.text(0)?.parse()?;
    let path = row.text(3)?;
    let padded_size = u64::try_from(row.integer(2)?)
        .map_err(|_| CacheError::Decode(format!("negative size for {path}")))?;
    let node = Node {
        node_type,
        modified: timestamp_to_datetime(row.integer(1)?),
        padded_size,
        path: path.clone(),
        ivs: row.blob(4)?,
    };
    Ok((SqlValue::Text(path), node))
}

/// Inventory of one `(folder, storage)` pair
#[derive(Debug, Clone)]
pub struct Filelist {
    conn: Connection,
}

impl Filelist {
    /// Opens the filelist of `folder_name` on `storage_name`.
    pub async fn open(
        registry: &CdbRegistry,
        layout: &DataDir,
        folder_name: &str,
        storage_name: &str,
    ) -> Result<Self, CacheError> {
        let conn = registry
            .connect(&layout.filelist_path(folder_name, storage_name))
            .await?;
        Self::with_connection(conn).await
    }

    /// Wraps a connection, creating the schema if needed.
    pub async fn with_connection(conn: Connection) -> Result<Self, CacheError> {
        conn.execute_script(SCHEMA)
            .await
            .map_err(|e| CacheError::Migration(e.to_string()))?;
        Ok(Self { conn })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Upserts a node. Directory paths are normalized first.
    pub async fn insert_node(&self, node: &Node) -> Result<(), CacheError> {
        let node = node.clone().normalized();
        node.validate()?;
        self.conn
            .execute(
                format!("INSERT INTO filelist ({COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5)"),
                vec![
                    node.node_type.as_str().into(),
                    node.modified_timestamp().into(),
                    node.padded_size.into(),
                    node.path.into(),
                    node.ivs.into(),
                ],
            )
            .await?;
        Ok(())
    }

    /// Upserts several nodes as one contiguous run of statements.
    pub async fn insert_nodes(&self, nodes: &[Node]) -> Result<(), CacheError> {
        let _scope = self.conn.scope().await;
        for node in nodes {
            self.insert_node(node).await?;
        }
        Ok(())
    }

    /// Removes the node at `path` (file or directory form).
    pub async fn remove_node(&self, path: &str) -> Result<u64, CacheError> {
        let result = self
            .conn
            .execute(
                "DELETE FROM filelist WHERE path = ?1 OR path = ?2",
                vec![path.into(), path::normalize_dir(path).into()],
            )
            .await?;
        Ok(result.rows_affected)
    }

    /// Removes every strict descendant of `path`.
    pub async fn remove_node_children(&self, path: &str) -> Result<u64, CacheError> {
        let result = self
            .conn
            .execute(
                "DELETE FROM filelist WHERE path GLOB ?1",
                vec![children_pattern(path).into()],
            )
            .await?;
        debug!(path, removed = result.rows_affected, "Removed node children");
        Ok(result.rows_affected)
    }

    /// Returns the node at `path`, or at `path` as a directory.
    pub async fn find_node(&self, path: &str) -> Result<Option<Node>, CacheError> {
        let row = self
            .conn
            .fetch_one(
                format!(
                    "SELECT {COLUMNS} FROM filelist WHERE path = ?1 OR path = ?2 \
                     ORDER BY path ASC"
                ),
                vec![path.into(), path::normalize_dir(path).into()],
            )
            .await?;
        row.map(|row| decode_node(&row).map(|(_, node)| node))
            .transpose()
    }

    /// Returns the deepest directory node that is a strict ancestor of `path`.
    pub async fn find_closest_ancestor(&self, path: &str) -> Result<Option<Node>, CacheError> {
        let mut ancestors = Vec::new();
        let mut current = path::denormalize_dir(path).to_string();
        while current.len() > 1 {
            let parent = path::dirname(&current).to_string();
            if parent.is_empty() || parent == current {
                break;
            }
            ancestors.push(path::normalize_dir(&parent));
            current = parent;
        }
        if ancestors.is_empty() {
            return Ok(None);
        }

        let placeholders: Vec<String> = (1..=ancestors.len()).map(|i| format!("?{i}")).collect();
        let sql = format!(
            "SELECT {COLUMNS} FROM filelist WHERE path IN ({}) \
             ORDER BY length(path) DESC",
            placeholders.join(", ")
        );
        let params = ancestors.into_iter().map(SqlValue::from).collect();
        let row = self.conn.fetch_one(sql, params).await?;
        row.map(|row| decode_node(&row).map(|(_, node)| node))
            .transpose()
    }

    /// Streams the strict descendants of `path` in path order.
    pub fn find_node_children(&self, path: &str) -> NodeCursor {
        Cursor::new(
            self.conn.clone(),
            format!(
                "SELECT {COLUMNS} FROM filelist WHERE path > ?1 AND path GLOB ?2 \
                 ORDER BY path ASC"
            ),
            SqlValue::Text(String::new()),
            vec![children_pattern(path).into()],
            decode_node,
        )
    }

    /// Streams every node in path order.
    pub fn select_all_nodes(&self) -> NodeCursor {
        Cursor::new(
            self.conn.clone(),
            format!("SELECT {COLUMNS} FROM filelist WHERE path > ?1 ORDER BY path ASC"),
            SqlValue::Text(String::new()),
            Vec::new(),
            decode_node,
        )
    }

    /// The lexicographically smallest node, normally the folder root.
    pub async fn get_root(&self) -> Result<Option<Node>, CacheError> {
        let row = self
            .conn
            .fetch_one(
                format!("SELECT {COLUMNS} FROM filelist ORDER BY path ASC"),
                Vec::new(),
            )
            .await?;
        row.map(|row| decode_node(&row).map(|(_, node)| node))
            .transpose()
    }

    pub async fn count(&self) -> Result<u64, CacheError> {
        let row = self
            .conn
            .fetch_one("SELECT COUNT(*) FROM filelist", Vec::new())
            .await?;
        Ok(row.map(|r| r.integer(0)).transpose()?.unwrap_or(0).max(0) as u64)
    }

    pub async fn is_empty(&self) -> Result<bool, CacheError> {
        let row = self
            .conn
            .fetch_one("SELECT 1 FROM filelist", Vec::new())
            .await?;
        Ok(row.is_none())
    }

    /// Whether any node lies at or below `prefix`.
    pub async fn has_nodes_under(&self, prefix: &str) -> Result<bool, CacheError> {
        let dir = path::normalize_dir(prefix);
        let row = self
            .conn
            .fetch_one(
                "SELECT 1 FROM filelist WHERE path = ?1 OR path GLOB ?2",
                vec![dir.into(), children_pattern(prefix).into()],
            )
            .await?;
        Ok(row.is_some())
    }

    pub async fn clear(&self) -> Result<(), CacheError> {
        self.conn
            .execute("DELETE FROM filelist", Vec::new())
            .await?;
        Ok(())
    }

    /// Purges deleted entries after a removal stage. Removals delete rows
    /// directly, so there is nothing to purge.
    pub async fn clear_deleted(&self) -> Result<(), CacheError> {
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

    pub fn in_transaction(&self) -> bool {
        self.conn.in_transaction()
    }

    pub async fn scope(&self) -> ScopeGuard {
        self.conn.scope().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_metacharacters_are_escaped() {
        assert_eq!(escape_glob("/a*b?[c]"), "/a[*]b[?][[]c[]]");
        assert_eq!(children_pattern("/x"), "/x/?*");
        assert_eq!(children_pattern("/x[1]/"), "/x[[]1[]]/?*");
    }
}
