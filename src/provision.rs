//! Project creation and `CREATE_REPO` task execution.
//!
//! [`Provisioner::create_project`] answers immediately with the ids the
//! client needs to poll; the repository itself is built later by
//! [`CreateRepoHandler`] on the task queue:
//!
//! ```text
//! work dir ─ git init ─ manifest.json ─ commit ─┐
//!                                               ▼
//!            bare repo ─ hook symlink ─ push ─ set HEAD
//! ```
//!
//! The work directory is always removed. Once the bare repository has been
//! created by this run, any later failure removes it again, so a caller never
//! observes a half-initialized repository. A cancelled task counts as a
//! failure even when the push already went through.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use asset_vault_core::error::IoContext;
use asset_vault_core::manifest::{ProjectManifest, MANIFEST_FILENAME};
use asset_vault_core::naming::{repo_hash, repo_relative_path, validate_owner_id, validate_project_name};
use asset_vault_core::payload::{CreateRepoPayload, RepositoryInfo, TaskPayload};
use asset_vault_core::task::TaskKind;
use asset_vault_core::{VaultError, VaultResult};

use crate::git::{self, CommitIdentity};
use crate::locks::RepoLocks;
use crate::queue::{encode_result, TaskContext, TaskHandler, TaskQueue};
use crate::staging::{discard_dir, WorkDir};

const REMOTE_NAME: &str = "origin";

/// Absolute location of the bare repository for `repo_hash`.
pub fn repository_path(repos_root: &Path, repo_hash: &str) -> PathBuf {
    repos_root.join(repo_relative_path(repo_hash))
}

/// What the caller gets back when a project is accepted.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectTicket {
    pub task_id: String,
    pub project_id: String,
    pub project_name: String,
    pub repo_hash: String,
}

/// Front door for project creation.
#[derive(Clone)]
pub struct Provisioner {
    queue: TaskQueue,
    repos_root: PathBuf,
}

impl Provisioner {
    pub fn new(queue: TaskQueue, repos_root: impl Into<PathBuf>) -> Self {
        Self {
            queue,
            repos_root: repos_root.into(),
        }
    }

    /// Accept a new project under a freshly generated id.
    pub async fn create_project(&self, owner_id: &str, project_name: &str) -> VaultResult<ProjectTicket> {
        let project_id = Uuid::new_v4().to_string();
        self.create_project_with_id(owner_id, &project_id, project_name)
            .await
    }

    /// Accept a project whose id the caller already chose.
    pub async fn create_project_with_id(
        &self,
        owner_id: &str,
        project_id: &str,
        project_name: &str,
    ) -> VaultResult<ProjectTicket> {
        let owner_id = validate_owner_id(owner_id)?;
        let project_name = validate_project_name(project_name)?;
        if project_id.trim().is_empty() {
            return Err(VaultError::Validation("project id is required".into()));
        }

        let hash = repo_hash(owner_id, project_id);
        let payload = CreateRepoPayload {
            owner_id: owner_id.to_string(),
            project_id: project_id.to_string(),
            project_name: project_name.clone(),
            repo_hash: hash.clone(),
            repo_path: repository_path(&self.repos_root, &hash),
            manifest: ProjectManifest::new(owner_id, project_id, &project_name, Utc::now()),
        };
        let task_id = self.queue.add_task(TaskPayload::CreateRepo(payload)).await;
        info!(%task_id, owner_id, project_id, repo_hash = %hash, "project creation queued");

        Ok(ProjectTicket {
            task_id,
            project_id: project_id.to_string(),
            project_name,
            repo_hash: hash,
        })
    }
}

/// Executes `CREATE_REPO` tasks.
pub struct CreateRepoHandler {
    repos_root: PathBuf,
    work_root: PathBuf,
    pre_receive_hook: Option<PathBuf>,
    locks: RepoLocks,
}

impl CreateRepoHandler {
    pub fn new(
        repos_root: impl Into<PathBuf>,
        work_root: impl Into<PathBuf>,
        pre_receive_hook: Option<PathBuf>,
        locks: RepoLocks,
    ) -> Self {
        Self {
            repos_root: repos_root.into(),
            work_root: work_root.into(),
            pre_receive_hook,
            locks,
        }
    }

    /// Build the repository for `payload`. The caller holds the repository lock.
    #[instrument(skip_all, fields(repo_hash = %payload.repo_hash))]
    pub async fn provision(
        &self,
        ctx: &TaskContext,
        payload: &CreateRepoPayload,
    ) -> VaultResult<RepositoryInfo> {
        let expected = repo_hash(&payload.owner_id, &payload.project_id);
        if payload.repo_hash != expected {
            return Err(VaultError::Validation(format!(
                "repo hash {} does not match owner/project",
                payload.repo_hash
            )));
        }
        let bare = repository_path(&self.repos_root, &expected);
        if payload.repo_path != bare {
            return Err(VaultError::Validation(format!(
                "repository path {} is outside the repositories root",
                payload.repo_path.display()
            )));
        }
        if tokio::fs::symlink_metadata(&bare).await.is_ok() {
            return Err(VaultError::Repository(format!(
                "repository {} already exists",
                payload.repo_hash
            )));
        }

        let work = WorkDir::create(&self.work_root, "create").await?;
        let mut bare_created = false;
        let result = self
            .build(ctx, work.path(), payload, &bare, &mut bare_created)
            .await;

        if let Err(e) = work.cleanup().await {
            warn!(path = %work.path().display(), error = %e, "work directory cleanup failed");
        }
        if result.is_err() && bare_created {
            warn!(path = %bare.display(), "rolling back partially created repository");
            discard_dir(&bare).await;
        }
        result
    }

    async fn build(
        &self,
        ctx: &TaskContext,
        work: &Path,
        payload: &CreateRepoPayload,
        bare: &Path,
        bare_created: &mut bool,
    ) -> VaultResult<RepositoryInfo> {
        git::init_repo(work).await?;

        let manifest = payload
            .manifest
            .to_file_contents()
            .map_err(|e| VaultError::io("encoding manifest", e.into()))?;
        let manifest_path = work.join(MANIFEST_FILENAME);
        tokio::fs::write(&manifest_path, manifest)
            .await
            .io_context(|| format!("writing {}", manifest_path.display()))?;

        git::add_path(work, MANIFEST_FILENAME).await?;
        let message = format!("Initialize project {}", payload.project_name);
        git::commit(work, &CommitIdentity::automation(), &message).await?;
        let branch = git::current_branch(work).await?;
        ctx.checkpoint()?;

        if let Some(shard) = bare.parent() {
            tokio::fs::create_dir_all(shard)
                .await
                .io_context(|| format!("creating {}", shard.display()))?;
        }
        *bare_created = true;
        git::init_bare_repo(bare).await?;

        let hooks_installed = match &self.pre_receive_hook {
            Some(hook) => {
                install_hook(bare, hook).await?;
                true
            }
            None => false,
        };

        git::add_remote(work, REMOTE_NAME, bare).await?;
        git::push(work, REMOTE_NAME, &branch).await?;
        git::set_bare_head(bare, &branch).await?;
        ctx.checkpoint()?;

        info!(%branch, hooks_installed, "repository provisioned");
        Ok(RepositoryInfo {
            repo_hash: payload.repo_hash.clone(),
            path: bare.to_path_buf(),
            hooks_installed,
            default_branch: branch,
        })
    }
}

#[async_trait]
impl TaskHandler for CreateRepoHandler {
    fn kind(&self) -> TaskKind {
        TaskKind::CreateRepo
    }

    async fn handle(&self, ctx: &TaskContext, payload: TaskPayload) -> VaultResult<Value> {
        let TaskPayload::CreateRepo(payload) = payload else {
            return Err(VaultError::Validation("expected a CREATE_REPO payload".into()));
        };
        let _guard = self.locks.acquire(&payload.repo_hash).await;
        let info = self.provision(ctx, &payload).await?;
        encode_result(&info)
    }
}

/// Link `hooks/pre-receive` to the shared hook script.
///
/// A symlink, never a copy: editing the shared script updates every repository.
async fn install_hook(bare: &Path, hook: &Path) -> VaultResult<()> {
    tokio::fs::metadata(hook)
        .await
        .io_context(|| format!("pre-receive hook {}", hook.display()))?;

    let hooks_dir = bare.join("hooks");
    tokio::fs::create_dir_all(&hooks_dir)
        .await
        .io_context(|| format!("creating {}", hooks_dir.display()))?;
    let link = hooks_dir.join("pre-receive");
    symlink(hook, &link)
        .await
        .io_context(|| format!("linking {} -> {}", link.display(), hook.display()))
}

#[cfg(unix)]
async fn symlink(target: &Path, link: &Path) -> std::io::Result<()> {
    tokio::fs::symlink(target, link).await
}

#[cfg(not(unix))]
async fn symlink(_target: &Path, _link: &Path) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "symlinked hooks require a unix host",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(repos_root: &Path, owner: &str, project: &str) -> CreateRepoPayload {
        let hash = repo_hash(owner, project);
        CreateRepoPayload {
            owner_id: owner.into(),
            project_id: project.into(),
            project_name: "Thesis".into(),
            repo_hash: hash.clone(),
            repo_path: repository_path(repos_root, &hash),
            manifest: ProjectManifest::new(owner, project, "Thesis", Utc::now()),
        }
    }

    fn ctx() -> TaskContext {
        TaskContext::new("task_test")
    }

    fn handler(root: &Path, hook: Option<PathBuf>) -> CreateRepoHandler {
        CreateRepoHandler::new(root.join("repos"), root.join("work"), hook, RepoLocks::new())
    }

    fn work_is_empty(root: &Path) -> bool {
        std::fs::read_dir(root.join("work"))
            .map(|mut d| d.next().is_none())
            .unwrap_or(true)
    }

    #[tokio::test]
    async fn provisions_bare_repo_with_manifest() {
        let tmp = tempfile::tempdir().unwrap();
        let h = handler(tmp.path(), None);
        let p = payload(&tmp.path().join("repos"), "user-1", "proj-1");

        let info = h.provision(&ctx(), &p).await.unwrap();
        assert_eq!(info.path, p.repo_path);
        assert!(!info.hooks_installed);
        assert!(git::is_bare_repo(&info.path).await);
        assert!(work_is_empty(tmp.path()));

        let clone = tmp.path().join("clone");
        git::clone_repo(&info.path, &clone).await.unwrap();
        let manifest: ProjectManifest =
            serde_json::from_str(&std::fs::read_to_string(clone.join(MANIFEST_FILENAME)).unwrap())
                .unwrap();
        assert_eq!(manifest.project_id, "proj-1");
        assert_eq!(manifest.owner_id, "user-1");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn hook_is_a_symlink() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().unwrap();
        let hook = tmp.path().join("central-pre-receive");
        std::fs::write(&hook, "#!/bin/sh\nexit 0\n").unwrap();
        std::fs::set_permissions(&hook, std::fs::Permissions::from_mode(0o755)).unwrap();

        let h = handler(tmp.path(), Some(hook.clone()));
        let p = payload(&tmp.path().join("repos"), "user-1", "proj-1");
        let info = h.provision(&ctx(), &p).await.unwrap();
        assert!(info.hooks_installed);

        let link = info.path.join("hooks").join("pre-receive");
        let meta = std::fs::symlink_metadata(&link).unwrap();
        assert!(meta.file_type().is_symlink());
        assert_eq!(std::fs::read_link(&link).unwrap(), hook);
    }

    #[tokio::test]
    async fn existing_repository_is_left_alone() {
        let tmp = tempfile::tempdir().unwrap();
        let h = handler(tmp.path(), None);
        let p = payload(&tmp.path().join("repos"), "user-1", "proj-1");
        h.provision(&ctx(), &p).await.unwrap();

        let err = h.provision(&ctx(), &p).await.unwrap_err();
        assert_eq!(err.code(), "repository");
        assert!(git::is_bare_repo(&p.repo_path).await);
    }

    #[tokio::test]
    async fn missing_hook_script_rolls_back() {
        let tmp = tempfile::tempdir().unwrap();
        let h = handler(tmp.path(), Some(tmp.path().join("no-such-hook")));
        let p = payload(&tmp.path().join("repos"), "user-1", "proj-1");

        let err = h.provision(&ctx(), &p).await.unwrap_err();
        assert_eq!(err.code(), "io");
        assert!(!p.repo_path.exists());
        assert!(work_is_empty(tmp.path()));
    }

    #[tokio::test]
    async fn cancelled_task_leaves_no_repository() {
        let tmp = tempfile::tempdir().unwrap();
        let h = handler(tmp.path(), None);
        let p = payload(&tmp.path().join("repos"), "user-1", "proj-1");
        let cancelled = ctx();
        cancelled.cancel();

        let err = h.provision(&cancelled, &p).await.unwrap_err();
        assert_eq!(err.code(), "timeout");
        assert!(!p.repo_path.exists());
        assert!(work_is_empty(tmp.path()));
    }

    #[tokio::test]
    async fn tampered_path_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let h = handler(tmp.path(), None);
        let mut p = payload(&tmp.path().join("repos"), "user-1", "proj-1");
        p.repo_path = tmp.path().join("elsewhere.git");

        let err = h.provision(&ctx(), &p).await.unwrap_err();
        assert_eq!(err.code(), "validation");
        assert!(!p.repo_path.exists());
    }
}
