//! encsync Storage - Storage adapters and folder views
//!
//! Provides:
//! - Backends implementing the `Storage` port (local filesystem, in-process
//!   object store, SFTP behind the `sftp` feature)
//! - A retrying wrapper applying the remote retry and timeout policy
//! - [`FolderStorage`], the plaintext, folder-relative view of a possibly
//!   encrypted folder
//! - Spill buffers and cipher sinks used by transfers
//!
//! ## Modules
//!
//! - [`local`] - Local filesystem adapter (atomic writes, name length limit)
//! - [`memory`] - Shared in-memory adapter used by tests and dry runs
//! - [`retry`] - Retry loop and per-call timeouts for remote backends
//! - [`folder`] - Prefix binding, path encryption and IV lookup
//! - [`factory`] - Builds a storage from its configuration
//! - [`sftp`] - SFTP address parsing and adapter

pub mod buffer;
pub mod factory;
pub mod folder;
pub mod local;
pub mod memory;
pub mod retry;
pub mod sftp;

pub use buffer::{SpillBuffer, SPILL_THRESHOLD};
pub use factory::build_storage;
pub use folder::{FolderStorage, ListedEntry, PendingTransfer};
pub use local::LocalStorage;
pub use memory::MemoryStorage;
pub use retry::{RetryPolicy, RetryingStorage};
pub use sftp::SftpAddress;
