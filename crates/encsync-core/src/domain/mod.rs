//! Domain entities and business logic
//!
//! This module contains the core domain types for encsync:
//! - Path algebra over `/`-separated strings
//! - Inventory entities (nodes, duplicates, differences)
//! - Folder and target configuration records
//! - Task status and its aggregation rules
//! - Domain-specific error types

pub mod errors;
pub mod folder;
pub mod node;
pub mod path;
pub mod status;
pub mod target;

// Re-export commonly used types
pub use errors::DomainError;
pub use folder::{validate_storage_name, FilenameEncoding, Folder, StorageKind};
pub use node::{DiffType, Difference, Duplicate, Node, NodeType, IV_SIZE};
pub use status::{StatusCounts, TaskStatus};
pub use target::{TargetFlags, TargetSpec};
