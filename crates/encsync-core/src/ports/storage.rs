//! Storage port (driven/secondary port)
//!
//! A storage is a tree of files and directories addressed by absolute `/`
//! paths. Adapters exist for the local filesystem, an in-process object
//! store and SFTP hosts; the synchronization core only sees this trait.
//!
//! ## Design Notes
//!
//! - `get_meta` never fails for a missing path: it reports `kind: None`.
//!   Unsupported entries (symlinks, sockets, reparse points) are reported
//!   the same way.
//! - Transfers are returned as [`TransferController`]s and only move data
//!   when the caller awaits [`TransferController::work`], so the caller can
//!   set a speed limit or keep a stop handle first.

use std::io;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncRead;

use super::transfer::{ChunkSink, TransferController};
use crate::crypto::CryptoError;
use crate::domain::folder::StorageKind;
use crate::domain::node::NodeType;

/// Minimum transfer chunk for local storages (4 MiB).
pub const LOCAL_CHUNK_SIZE: usize = 4 * 1024 * 1024;

/// Minimum transfer chunk for remote storages (512 KiB).
pub const REMOTE_CHUNK_SIZE: usize = 512 * 1024;

/// Source of an upload
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

// ============================================================================
// Errors
// ============================================================================

/// Errors raised by storages and transfers
#[derive(Debug, Error)]
pub enum StorageError {
    /// Path absent
    #[error("Not found: {0}")]
    NotFound(String),

    /// Path already present (`mkdir` on an existing entry)
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Timeout, server-side failure or dropped connection; worth retrying
    #[error("Temporary storage error: {0}")]
    Temporary(String),

    /// Credentials rejected
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// A path segment exceeds what the backend accepts
    #[error("Name too long ({len} bytes): {name}")]
    NameTooLong { name: String, len: usize },

    /// Any other non-retryable failure
    #[error("Storage error: {0}")]
    Permanent(String),

    /// The transfer was stopped cooperatively
    #[error("Transfer interrupted")]
    Interrupted,

    /// Malformed ciphertext or name
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl StorageError {
    /// Whether the retry loop should try again
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Temporary(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(self, StorageError::Interrupted)
    }

    /// Classifies an I/O error raised while handling `path`.
    pub fn from_io(err: io::Error, path: &str) -> Self {
        use io::ErrorKind::*;
        match err.kind() {
            NotFound => StorageError::NotFound(path.to_string()),
            AlreadyExists => StorageError::AlreadyExists(path.to_string()),
            PermissionDenied => StorageError::Permanent(format!("{path}: {err}")),
            TimedOut | ConnectionReset | ConnectionAborted | ConnectionRefused | BrokenPipe
            | UnexpectedEof | Interrupted | WouldBlock => {
                StorageError::Temporary(format!("{path}: {err}"))
            }
            _ => StorageError::Io(err),
        }
    }
}

// ============================================================================
// Meta
// ============================================================================

/// Metadata of one storage entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Meta {
    /// `None` when the entry is absent or of an unsupported kind
    pub kind: Option<NodeType>,
    pub name: String,
    pub modified: DateTime<Utc>,
    pub size: u64,
    /// Link target, when the backend exposes one
    pub link: Option<String>,
}

impl Meta {
    pub fn file(name: impl Into<String>, modified: DateTime<Utc>, size: u64) -> Self {
        Self {
            kind: Some(NodeType::File),
            name: name.into(),
            modified,
            size,
            link: None,
        }
    }

    pub fn dir(name: impl Into<String>, modified: DateTime<Utc>) -> Self {
        Self {
            kind: Some(NodeType::Dir),
            name: name.into(),
            modified,
            size: 0,
            link: None,
        }
    }

    /// Metadata of an absent entry.
    pub fn missing(name: impl Into<String>) -> Self {
        Self {
            kind: None,
            name: name.into(),
            modified: DateTime::<Utc>::UNIX_EPOCH,
            size: 0,
            link: None,
        }
    }

    pub fn exists(&self) -> bool {
        self.kind.is_some()
    }

    pub fn is_file(&self) -> bool {
        self.kind == Some(NodeType::File)
    }

    pub fn is_dir(&self) -> bool {
        self.kind == Some(NodeType::Dir)
    }
}

// ============================================================================
// Storage
// ============================================================================

/// Uniform contract over storage backends
#[async_trait]
pub trait Storage: Send + Sync {
    /// Configured storage name
    fn name(&self) -> &str;

    fn kind(&self) -> StorageKind;

    /// Whether names differing only by case are distinct entries
    fn case_sensitive(&self) -> bool;

    /// Whether independent calls may run concurrently
    fn parallelizable(&self) -> bool;

    /// Transfer chunk size for controllers issued by this storage
    fn chunk_size(&self) -> usize {
        match self.kind() {
            StorageKind::Local => LOCAL_CHUNK_SIZE,
            StorageKind::Remote => REMOTE_CHUNK_SIZE,
        }
    }

    /// Metadata of `path`; `kind` is `None` when the entry does not exist.
    async fn get_meta(&self, path: &str) -> Result<Meta, StorageError>;

    /// Children of a directory. Unsupported entries are skipped.
    async fn listdir(&self, path: &str) -> Result<Vec<Meta>, StorageError>;

    /// Creates one directory. Fails with `AlreadyExists` if `path` exists and
    /// with `NotFound` if its parent does not.
    async fn mkdir(&self, path: &str) -> Result<(), StorageError>;

    /// Removes a file, or a directory with all its contents.
    async fn remove(&self, path: &str) -> Result<(), StorageError>;

    /// Prepares an upload of `size` bytes from `reader` to `path`.
    async fn upload(
        &self,
        reader: BoxedReader,
        size: u64,
        path: &str,
    ) -> Result<TransferController, StorageError>;

    /// Prepares a download of `path` into `sink`.
    async fn download(
        &self,
        path: &str,
        sink: Box<dyn ChunkSink>,
    ) -> Result<TransferController, StorageError>;

    async fn is_file(&self, path: &str) -> Result<bool, StorageError> {
        Ok(self.get_meta(path).await?.is_file())
    }

    async fn is_dir(&self, path: &str) -> Result<bool, StorageError> {
        Ok(self.get_meta(path).await?.is_dir())
    }

    async fn exists(&self, path: &str) -> Result<bool, StorageError> {
        Ok(self.get_meta(path).await?.exists())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_are_classified() {
        let nf = io::Error::new(io::ErrorKind::NotFound, "gone");
        assert!(StorageError::from_io(nf, "/a").is_not_found());

        let timeout = io::Error::new(io::ErrorKind::TimedOut, "slow");
        assert!(StorageError::from_io(timeout, "/a").is_transient());

        let other = io::Error::new(io::ErrorKind::Other, "odd");
        assert!(!StorageError::from_io(other, "/a").is_transient());
    }

    #[test]
    fn missing_meta_does_not_exist() {
        let meta = Meta::missing("x");
        assert!(!meta.exists());
        assert!(!meta.is_file());
        assert!(Meta::dir("d", Utc::now()).is_dir());
    }
}
