//! Staging area and ephemeral directory helpers.
//!
//! Completed uploads wait in a date/owner partitioned tree
//! (`completed/<YYYY-MM-DD>/<owner>/<uuid>.tmp`) until an ingestion task
//! consumes them. Ephemeral work directories hold scratch repositories while
//! commits are built. All removals here are idempotent: removing something
//! that is already gone is not an error.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

use asset_vault_core::error::IoContext;
use asset_vault_core::naming::sanitize_segment;
use asset_vault_core::VaultResult;

/// Allocator for staged upload files.
#[derive(Debug, Clone)]
pub struct StagingArea {
    completed_dir: PathBuf,
}

impl StagingArea {
    pub fn new(completed_dir: impl Into<PathBuf>) -> Self {
        Self {
            completed_dir: completed_dir.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.completed_dir
    }

    /// Reserve a fresh, not-yet-created file path for `owner_id`'s upload and
    /// make sure its partition directory exists.
    pub async fn allocate(&self, owner_id: &str, now: DateTime<Utc>) -> VaultResult<PathBuf> {
        let owner = match sanitize_segment(owner_id) {
            s if s.is_empty() => "anonymous".to_string(),
            s => s,
        };
        let dir = self
            .completed_dir
            .join(now.format("%Y-%m-%d").to_string())
            .join(owner);
        tokio::fs::create_dir_all(&dir)
            .await
            .io_context(|| format!("creating staging directory {}", dir.display()))?;
        Ok(dir.join(format!("{}.tmp", Uuid::new_v4())))
    }
}

/// A scratch directory that is removed by [`WorkDir::cleanup`].
#[derive(Debug)]
pub struct WorkDir {
    path: PathBuf,
}

impl WorkDir {
    /// Create `<root>/<prefix>-<uuid>`.
    pub async fn create(root: &Path, prefix: &str) -> VaultResult<Self> {
        tokio::fs::create_dir_all(root)
            .await
            .io_context(|| format!("creating work root {}", root.display()))?;
        let path = root.join(format!("{}-{}", prefix, Uuid::new_v4().simple()));
        tokio::fs::create_dir(&path)
            .await
            .io_context(|| format!("creating work directory {}", path.display()))?;
        debug!(path = %path.display(), "work directory created");
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the directory tree. Safe to call repeatedly.
    pub async fn cleanup(&self) -> VaultResult<()> {
        remove_dir_if_exists(&self.path).await?;
        Ok(())
    }
}

/// Recursively remove `path`. Returns whether anything was removed.
pub async fn remove_dir_if_exists(path: &Path) -> VaultResult<bool> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e).io_context(|| format!("removing directory {}", path.display())),
    }
}

/// Remove a single file. Returns whether anything was removed.
pub async fn remove_file_if_exists(path: &Path) -> VaultResult<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e).io_context(|| format!("removing file {}", path.display())),
    }
}

/// Best-effort removal used on rollback paths; failures are logged, not raised.
pub async fn discard_file(path: &Path) {
    match remove_file_if_exists(path).await {
        Ok(true) => debug!(path = %path.display(), "discarded file"),
        Ok(false) => {}
        Err(e) => warn!(path = %path.display(), error = %e, "failed to discard file"),
    }
}

/// Best-effort recursive removal used on rollback paths.
pub async fn discard_dir(path: &Path) {
    match remove_dir_if_exists(path).await {
        Ok(true) => debug!(path = %path.display(), "discarded directory"),
        Ok(false) => {}
        Err(e) => warn!(path = %path.display(), error = %e, "failed to discard directory"),
    }
}

/// Move `src` to `dst`: an atomic rename when both sit on one volume, a copy
/// followed by removal of `src` otherwise.
pub async fn move_file(src: &Path, dst: &Path) -> VaultResult<()> {
    match tokio::fs::rename(src, dst).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            Err(e).io_context(|| format!("moving {} (source missing)", src.display()))
        }
        Err(rename_err) => {
            debug!(
                src = %src.display(),
                dst = %dst.display(),
                error = %rename_err,
                "rename failed, falling back to copy"
            );
            if let Err(copy_err) = tokio::fs::copy(src, dst).await {
                discard_file(dst).await;
                return Err(copy_err)
                    .io_context(|| format!("copying {} to {}", src.display(), dst.display()));
            }
            remove_file_if_exists(src).await?;
            Ok(())
        }
    }
}
