//! Inventory entities: nodes, duplicates and differences
//!
//! These are the rows of the three inventories:
//! - [`Node`] - a filelist entry, one observed path under one folder
//! - [`Duplicate`] - a duplist entry, an extra ciphertext resolving to an owned path
//! - [`Difference`] - a difflist entry, one planned mutation for a target

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use super::errors::DomainError;
use super::path;

/// Size of one initialization vector, and of one cipher block.
pub const IV_SIZE: usize = 16;

// ============================================================================
// NodeType
// ============================================================================

/// Kind of an inventory entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeType {
    /// Regular file (`f`)
    #[serde(rename = "f")]
    File,
    /// Directory (`d`)
    #[serde(rename = "d")]
    Dir,
}

impl NodeType {
    /// One-letter code used in the inventories
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::File => "f",
            NodeType::Dir => "d",
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self, NodeType::Dir)
    }
}

impl Display for NodeType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "f" => Ok(NodeType::File),
            "d" => Ok(NodeType::Dir),
            other => Err(DomainError::InvalidNodeType(other.to_string())),
        }
    }
}

// ============================================================================
// Node
// ============================================================================

/// An observed filelist entry
///
/// `path` is absolute and uses `/`; directory paths always end with `/`.
/// `ivs` holds one 16-byte IV per segment below the folder prefix and is
/// empty for plaintext folders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub node_type: NodeType,
    pub modified: DateTime<Utc>,
    pub padded_size: u64,
    pub path: String,
    pub ivs: Vec<u8>,
}

impl Node {
    /// Creates a file node. The modification time is truncated to seconds.
    pub fn file(
        path: impl Into<String>,
        modified: DateTime<Utc>,
        padded_size: u64,
        ivs: Vec<u8>,
    ) -> Self {
        Self {
            node_type: NodeType::File,
            modified: truncate_to_seconds(modified),
            padded_size,
            path: path.into(),
            ivs,
        }
    }

    /// Creates a directory node with a normalized path and no size.
    pub fn dir(path: impl AsRef<str>, modified: DateTime<Utc>, ivs: Vec<u8>) -> Self {
        Self {
            node_type: NodeType::Dir,
            modified: truncate_to_seconds(modified),
            padded_size: 0,
            path: path::normalize_dir(path.as_ref()),
            ivs,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.node_type.is_dir()
    }

    /// Returns the node with a directory path normalized to end in `/`.
    pub fn normalized(mut self) -> Self {
        if self.is_dir() {
            self.path = path::normalize_dir(&self.path);
        }
        self
    }

    /// Checks the structural invariants of a node.
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.ivs.len() % IV_SIZE != 0 {
            return Err(DomainError::InvalidIvs {
                path: self.path.clone(),
                len: self.ivs.len(),
            });
        }
        match self.node_type {
            NodeType::File if self.padded_size % IV_SIZE as u64 != 0 => {
                Err(DomainError::ValidationFailed(format!(
                    "file {} has unpadded size {}",
                    self.path, self.padded_size
                )))
            }
            NodeType::Dir if !self.path.ends_with(path::SEP) => Err(
                DomainError::InvalidPath(format!("directory path must end in '/': {}", self.path)),
            ),
            _ => Ok(()),
        }
    }

    /// Modification time as Unix seconds, the stored representation.
    pub fn modified_timestamp(&self) -> i64 {
        self.modified.timestamp()
    }
}

/// Drops sub-second precision; inventories store whole seconds.
pub fn truncate_to_seconds(ts: DateTime<Utc>) -> DateTime<Utc> {
    timestamp_to_datetime(ts.timestamp())
}

/// Converts stored Unix seconds back to a UTC timestamp.
pub fn timestamp_to_datetime(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

// ============================================================================
// Duplicate
// ============================================================================

/// An extra ciphertext entry on an encrypted storage
///
/// `path` is the plaintext path it decrypts to and `ivs` are the IVs of the
/// ciphertext, so that re-encrypting `path` with `ivs` yields the exact
/// storage name to remove.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Duplicate {
    pub node_type: NodeType,
    pub ivs: Vec<u8>,
    pub path: String,
}

// ============================================================================
// Difference
// ============================================================================

/// Kind of a planned mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffType {
    New,
    Update,
    Rm,
    Rmdup,
}

impl DiffType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiffType::New => "new",
            DiffType::Update => "update",
            DiffType::Rm => "rm",
            DiffType::Rmdup => "rmdup",
        }
    }
}

impl Display for DiffType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DiffType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(DiffType::New),
            "update" => Ok(DiffType::Update),
            "rm" => Ok(DiffType::Rm),
            "rmdup" => Ok(DiffType::Rmdup),
            other => Err(DomainError::InvalidDiffType(other.to_string())),
        }
    }
}

/// A planned mutation of a target's destination
///
/// `path` is relative to the folder prefixes. `id` is the storage row id
/// once the difference has been persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Difference {
    #[serde(skip)]
    pub id: Option<i64>,
    pub diff_type: DiffType,
    pub node_type: NodeType,
    pub path: String,
    pub src_folder_name: String,
    pub dst_folder_name: String,
    pub ivs: Vec<u8>,
}

impl Difference {
    pub fn new(
        diff_type: DiffType,
        node_type: NodeType,
        path: impl Into<String>,
        ivs: Vec<u8>,
    ) -> Self {
        Self {
            id: None,
            diff_type,
            node_type,
            path: path.into(),
            src_folder_name: String::new(),
            dst_folder_name: String::new(),
            ivs,
        }
    }

    /// Attaches the folder pair the difference belongs to.
    pub fn for_target(mut self, src: &str, dst: &str) -> Self {
        self.src_folder_name = src.to_string();
        self.dst_folder_name = dst.to_string();
        self
    }
}

impl Display for Difference {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.diff_type, self.node_type, self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_type_round_trips_through_codes() {
        assert_eq!("f".parse::<NodeType>().unwrap(), NodeType::File);
        assert_eq!("d".parse::<NodeType>().unwrap(), NodeType::Dir);
        assert!("x".parse::<NodeType>().is_err());
    }

    #[test]
    fn dir_node_is_normalized() {
        let node = Node::dir("/a/b", Utc::now(), vec![]);
        assert_eq!(node.path, "/a/b/");
        assert_eq!(node.padded_size, 0);
        assert!(node.validate().is_ok());
    }

    #[test]
    fn file_node_rejects_unpadded_size() {
        let node = Node::file("/a.txt", Utc::now(), 5, vec![]);
        assert!(node.validate().is_err());
        let node = Node::file("/a.txt", Utc::now(), 16, vec![0; 17]);
        assert!(matches!(node.validate(), Err(DomainError::InvalidIvs { .. })));
    }

    #[test]
    fn modified_is_truncated_to_seconds() {
        let ts = Utc.timestamp_opt(1000, 999_000_000).unwrap();
        let node = Node::file("/a", ts, 16, vec![]);
        assert_eq!(node.modified_timestamp(), 1000);
        assert_eq!(node.modified, timestamp_to_datetime(1000));
    }

    #[test]
    fn diff_type_parses() {
        for t in [DiffType::New, DiffType::Update, DiffType::Rm, DiffType::Rmdup] {
            assert_eq!(t.as_str().parse::<DiffType>().unwrap(), t);
        }
    }
}
