//! encsync Cache - Inventories behind a centralized SQLite writer
//!
//! SQLite allows a single writer per file while encsync has many logical
//! writers (scan workers, sync workers, the diff builder). This crate puts
//! one executor thread in front of every database file and hands out
//! logical connections that queue their statements to it.
//!
//! ## Key Components
//!
//! - [`CdbRegistry`] / [`Cdb`] - One executor per database file
//! - [`Connection`] - Logical connection with transactional isolation
//! - [`Filelist`] - Observed nodes of one folder
//! - [`Duplist`] - Extra ciphertexts of one storage
//! - [`Difflist`] - Planned mutations of all targets
//! - [`DataDir`] - Naming of the database files inside the data directory
//!
//! ## Usage
//!
//! ```no_run
//! use std::path::Path;
//! use encsync_cache::{CdbRegistry, DataDir, Filelist};
//!
//! # async fn example() -> Result<(), encsync_cache::CacheError> {
//! let registry = CdbRegistry::default();
//! let layout = DataDir::new("/home/user/.local/share/encsync");
//! let filelist = Filelist::open(&registry, &layout, "photos", "local").await?;
//! let root = filelist.get_root().await?;
//! # Ok(())
//! # }
//! ```

pub mod cdb;
pub mod cursor;
pub mod difflist;
pub mod duplist;
pub mod filelist;
pub mod layout;
pub mod value;

pub use cdb::{Cdb, CdbOptions, CdbRegistry, Connection, ExecResult, ScopeGuard};
pub use cursor::Cursor;
pub use difflist::{DiffSummary, Difflist};
pub use duplist::Duplist;
pub use filelist::{Filelist, NodeCursor};
pub use layout::DataDir;
pub use value::{Row, SqlValue};

/// Errors that can occur during cache operations
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// Backpressure did not clear before the deadline
    #[error("Database busy: request queue did not drain in time")]
    Busy,

    /// The executor has shut down
    #[error("Database closed")]
    Closed,

    /// Failed to establish a database connection
    #[error("Connection failed: {0}")]
    Connection(String),

    /// A database query failed
    #[error("Query failed: {0}")]
    Query(String),

    /// Schema creation failed
    #[error("Migration failed: {0}")]
    Migration(String),

    /// A stored value could not be converted to a domain type
    #[error("Decode error: {0}")]
    Decode(String),

    /// Misuse of the transaction protocol
    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<sqlx::Error> for CacheError {
    fn from(e: sqlx::Error) -> Self {
        CacheError::Query(e.to_string())
    }
}

impl From<encsync_core::domain::DomainError> for CacheError {
    fn from(e: encsync_core::domain::DomainError) -> Self {
        CacheError::Decode(e.to_string())
    }
}
