//! # Asset Vault Core
//!
//! Runtime-free logic shared by the Asset Vault service: the task model and
//! its status machine, typed task payloads, the error taxonomy, repository
//! addressing and path sanitization, the `Upload-Metadata` codec, and the
//! [`store::TaskStore`] abstraction with its in-memory implementation.
//!
//! This crate contains no tokio, process spawning, or filesystem I/O.

pub mod error;
pub mod manifest;
pub mod metadata;
pub mod naming;
pub mod payload;
pub mod store;
pub mod task;

pub use error::{VaultError, VaultResult};
