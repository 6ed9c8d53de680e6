//! encsync Sync - Scanning, diffing and staged synchronization
//!
//! Provides:
//! - Worker lifecycle and bounded task pools with cooperative cancellation
//! - Folder scanning into the filelist inventory with duplicate detection
//! - The merge that turns two inventories into a plan of differences
//! - Removal of duplicate ciphertexts
//! - The staged synchronizer that applies a plan to a destination folder
//!
//! ## Modules
//!
//! - [`worker`] - Worker and staged worker lifecycle, task pools
//! - [`registry`] - Target arena, per-stage counters and status events
//! - [`filter`] - Include/exclude glob rules
//! - [`scanner`] - Directory walker filling filelists and duplists
//! - [`diff`] - Sorted merge of two inventories
//! - [`rmdup`] - Duplicate remover working from a duplist snapshot
//! - [`synchronizer`] - The scan, rmdup, rm, dirs, files, check pipeline
//! - [`environment`] - Wiring of storages, folders and inventories from a config

pub mod diff;
pub mod environment;
pub mod filter;
pub mod registry;
pub mod rmdup;
pub mod scanner;
pub mod synchronizer;
pub mod worker;

pub use diff::{DiffBuilder, DiffEntry, DiffSink, NodeSource};
pub use environment::Environment;
pub use filter::PathFilter;
pub use registry::{StageReporter, TargetId, TargetRegistry, TargetSnapshot};
pub use rmdup::DuplicateRemover;
pub use scanner::{ScanReport, ScanTarget, Scanner};
pub use synchronizer::{
    Stage, StageReport, SyncContext, SyncOptions, SyncSide, Synchronizer, TargetReport,
};
pub use worker::{run_worker, Worker};

use encsync_cache::CacheError;
use encsync_core::domain::DomainError;
use encsync_core::ports::StorageError;
use thiserror::Error;

/// Errors raised while scanning or synchronizing
#[derive(Debug, Error)]
pub enum SyncError {
    /// A storage operation failed
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// An inventory read or write failed
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    /// A domain-level invariant was violated
    #[error("Domain error: {0}")]
    Domain(#[from] DomainError),

    /// An include/exclude pattern did not compile
    #[error("Invalid pattern {pattern}: {message}")]
    Pattern { pattern: String, message: String },

    /// Work was stopped before it completed
    #[error("Stopped")]
    Stopped,

    /// The destination still differs from the source after the files stage
    #[error("Integrity check failed: {0} differences remain")]
    Integrity(u64),

    /// A spawned scan or transfer task panicked or was aborted
    #[error("Task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    /// Whether the error comes from a cooperative stop.
    pub fn is_stop(&self) -> bool {
        match self {
            SyncError::Stopped => true,
            SyncError::Storage(e) => e.is_interrupted(),
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, SyncError::Storage(e) if e.is_not_found())
    }
}
