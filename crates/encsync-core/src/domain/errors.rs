//! Domain error types
//!
//! This module defines error types specific to domain operations,
//! including validation failures, malformed inventory values and path errors.

use thiserror::Error;

/// Errors that can occur in domain operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Invalid path format or content
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// Storage name does not match `^[A-Za-z0-9_][A-Za-z0-9_.-]{0,63}$`
    #[error("Invalid storage name: {0}")]
    InvalidStorageName(String),

    /// Unknown node type code
    #[error("Invalid node type: {0}")]
    InvalidNodeType(String),

    /// Unknown difference type
    #[error("Invalid difference type: {0}")]
    InvalidDiffType(String),

    /// IV blob whose length is not a multiple of 16
    #[error("Invalid IVs for {path}: {len} bytes")]
    InvalidIvs {
        /// Path the IVs belong to
        path: String,
        /// Offending length
        len: usize,
    },

    /// Invalid state transition attempt
    #[error("Invalid state transition from {from} to {to}")]
    InvalidState {
        /// The current state
        from: String,
        /// The attempted target state
        to: String,
    },

    /// Generic validation failure
    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    /// Path is not within the folder prefix
    #[error("Path not within folder prefix: {0}")]
    PathNotInFolder(String),
}
