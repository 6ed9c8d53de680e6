//! encsync Core - Domain logic and shared contracts
//!
//! This crate contains the hexagonal architecture core with:
//! - **Domain entities** - `Node`, `Duplicate`, `Difference`, `Folder`, `TargetSpec`
//! - **Path algebra** - `/`-separated path manipulation independent of the host OS
//! - **Cryptography** - per-segment filename encryption and the file ciphertext format
//! - **Port definitions** - the `Storage` trait and cooperative transfer controllers
//! - **Events** - emitter/receiver model used for progress and error reporting
//!
//! # Architecture
//!
//! The domain module contains pure logic with no I/O. Ports define the trait
//! interfaces that adapter crates (`encsync-storage`, `encsync-cache`)
//! implement, and the orchestration crate (`encsync-sync`) drives them.

pub mod config;
pub mod crypto;
pub mod domain;
pub mod events;
pub mod ports;
