//! Authorization and quota checks for asset ingestion.
//!
//! The ingestion handler consults an [`AccessPolicy`] before it touches any
//! repository. Identity verification happens upstream; a policy only decides
//! whether an already-verified owner may write, and whether the write fits.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use walkdir::WalkDir;

use asset_vault_core::{VaultError, VaultResult};

/// Decides whether a write may proceed.
///
/// Both checks must pass before any filesystem mutation. Return
/// [`VaultError::Authorization`] to deny.
#[async_trait]
pub trait AccessPolicy: Send + Sync {
    /// May `owner_id` write into `project_id`?
    async fn can_write(&self, owner_id: &str, project_id: &str) -> VaultResult<()>;

    /// Does adding `incoming_bytes` keep the repository at `repo_path` within quota?
    async fn within_quota(&self, repo_path: &Path, incoming_bytes: u64) -> VaultResult<()>;
}

/// Policy that allows every write and optionally caps repository size.
#[derive(Debug, Clone, Default)]
pub struct StaticPolicy {
    max_repo_bytes: Option<u64>,
}

impl StaticPolicy {
    pub fn new(max_repo_bytes: Option<u64>) -> Self {
        Self { max_repo_bytes }
    }
}

#[async_trait]
impl AccessPolicy for StaticPolicy {
    async fn can_write(&self, _owner_id: &str, _project_id: &str) -> VaultResult<()> {
        Ok(())
    }

    async fn within_quota(&self, repo_path: &Path, incoming_bytes: u64) -> VaultResult<()> {
        let Some(limit) = self.max_repo_bytes else {
            return Ok(());
        };
        let current = repo_size_bytes(repo_path.to_path_buf()).await?;
        if current.saturating_add(incoming_bytes) > limit {
            return Err(VaultError::Authorization(format!(
                "repository quota exceeded: {} + {} bytes > {} bytes",
                current, incoming_bytes, limit
            )));
        }
        Ok(())
    }
}

/// Total size of regular files under `path`, measured off the async runtime.
pub async fn repo_size_bytes(path: PathBuf) -> VaultResult<u64> {
    tokio::task::spawn_blocking(move || {
        let walk_err = |e: walkdir::Error| {
            VaultError::io(
                format!("measuring {}", path.display()),
                e.into_io_error()
                    .unwrap_or_else(|| std::io::Error::other("filesystem loop")),
            )
        };
        let mut total = 0u64;
        for entry in WalkDir::new(&path).follow_links(false) {
            let entry = entry.map_err(walk_err)?;
            if entry.file_type().is_file() {
                total += entry.metadata().map_err(walk_err)?.len();
            }
        }
        Ok(total)
    })
    .await
    .map_err(|e| VaultError::Repository(format!("size scan aborted: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unlimited_policy_allows_everything() {
        let policy = StaticPolicy::default();
        policy.can_write("u", "p").await.unwrap();
        policy
            .within_quota(Path::new("/nonexistent"), u64::MAX)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn quota_counts_existing_bytes() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir(tmp.path().join("objects")).unwrap();
        std::fs::write(tmp.path().join("objects").join("a"), vec![0u8; 600]).unwrap();

        assert_eq!(repo_size_bytes(tmp.path().to_path_buf()).await.unwrap(), 600);

        let policy = StaticPolicy::new(Some(1000));
        policy.within_quota(tmp.path(), 400).await.unwrap();
        let err = policy.within_quota(tmp.path(), 401).await.unwrap_err();
        assert_eq!(err.code(), "authorization");
    }
}
