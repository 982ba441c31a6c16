//! Error taxonomy shared by every stage of ingestion and provisioning.
//!
//! Each variant maps to a stable machine-readable [`code`](VaultError::code)
//! that is recorded on failed tasks and returned in HTTP error bodies.

use std::io;

/// Errors raised by upload, provisioning, and ingestion operations.
#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    /// Bad shape, oversized, or disallowed input. No state was mutated.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Permission or quota denied. No state was mutated.
    #[error("not authorized: {0}")]
    Authorization(String),

    /// Broken or inconsistent transfer (vanished or truncated bytes).
    #[error("transfer failed: {0}")]
    Transfer(String),

    /// A version-control invocation failed.
    #[error("repository operation failed: {0}")]
    Repository(String),

    /// Filesystem failure.
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    /// Unknown upload session, task, or project.
    #[error("not found: {0}")]
    NotFound(String),

    /// A chunk claimed an offset that disagrees with the recorded one.
    #[error("offset conflict: server holds {expected}, client claimed {claimed}")]
    OffsetConflict { expected: u64, claimed: u64 },

    /// The task outlived its time limit and rolled back what it had done.
    #[error("timed out: {0}")]
    TimedOut(String),
}

impl VaultError {
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        VaultError::Io {
            context: context.into(),
            source,
        }
    }

    /// Stable machine-readable code for this error category.
    pub fn code(&self) -> &'static str {
        match self {
            VaultError::Validation(_) => "validation",
            VaultError::Authorization(_) => "authorization",
            VaultError::Transfer(_) => "transfer",
            VaultError::Repository(_) => "repository",
            VaultError::Io { .. } => "io",
            VaultError::NotFound(_) => "not_found",
            VaultError::OffsetConflict { .. } => "conflict",
            VaultError::TimedOut(_) => "timeout",
        }
    }
}

pub type VaultResult<T> = Result<T, VaultError>;

/// Attach a context message to an [`io::Error`], producing [`VaultError::Io`].
pub trait IoContext<T> {
    fn io_context<F, S>(self, f: F) -> VaultResult<T>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T> IoContext<T> for Result<T, io::Error> {
    fn io_context<F, S>(self, f: F) -> VaultResult<T>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|source| VaultError::io(f(), source))
    }
}
