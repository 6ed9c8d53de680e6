//! Port definitions (hexagonal architecture interfaces)
//!
//! This module defines the port traits that form the boundaries of the
//! hexagonal architecture. Ports are interfaces that the synchronization
//! core depends on, but whose implementations live in adapter crates.
//!
//! ## Ports Overview
//!
//! - [`Storage`] - Uniform contract over local filesystems and remote stores
//! - [`ChunkSink`] - Destination of a transfer, fed chunk by chunk
//! - [`TransferController`] - Cooperative, rate-limited, cancellable transfer

pub mod storage;
pub mod transfer;

pub use storage::{BoxedReader, Meta, Storage, StorageError, LOCAL_CHUNK_SIZE, REMOTE_CHUNK_SIZE};
pub use transfer::{
    ChunkSink, DownloadController, SpeedLimiter, TransferController, UploadController,
};
