//! `PROCESS_ASSET` task execution.
//!
//! Takes a staged upload through `STAGED → VALIDATED → MOVED → COMMITTED`:
//!
//! 1. **Stage check**: the temp file must still exist with the declared size.
//! 2. **Validate**: size ceiling and MIME allow-list.
//! 3. **Authorize**: [`AccessPolicy`] write permission and quota.
//! 4. **Place**: sanitized filename and folder inside a fresh clone of the
//!    project's bare repository; the temp file is moved into place.
//! 5. **Commit**: exactly that path, authored by the uploading user, then
//!    pushed back to the bare repository.
//!
//! The quota check and steps 4–5 run under the repository lock. The bare
//! repository only changes when the final push succeeds, so a failure
//! anywhere leaves it untouched. A task cancelled after its push rewinds the
//! branch to where it was. The work directory and the temp file are removed
//! on every path.
//!
//! `manifest.json` at the repository root belongs to provisioning and is
//! never overwritten by an upload.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use asset_vault_core::manifest::MANIFEST_FILENAME;
use asset_vault_core::naming::{repo_hash, sanitize_filename, sanitize_folder_path, validate_owner_id};
use asset_vault_core::payload::{CommitOutcome, ProcessAssetPayload, TaskPayload};
use asset_vault_core::task::TaskKind;
use asset_vault_core::{VaultError, VaultResult};
use asset_vault_core::error::IoContext;

use crate::access::AccessPolicy;
use crate::config::AssetsConfig;
use crate::git::{self, CommitIdentity};
use crate::locks::RepoLocks;
use crate::provision::repository_path;
use crate::queue::{encode_result, TaskContext, TaskHandler};
use crate::staging::{discard_file, move_file, WorkDir};

const REMOTE_NAME: &str = "origin";

/// Executes `PROCESS_ASSET` tasks.
pub struct AssetIngestionHandler {
    repos_root: PathBuf,
    work_root: PathBuf,
    rules: AssetsConfig,
    policy: Arc<dyn AccessPolicy>,
    locks: RepoLocks,
}

impl AssetIngestionHandler {
    pub fn new(
        repos_root: impl Into<PathBuf>,
        work_root: impl Into<PathBuf>,
        rules: AssetsConfig,
        policy: Arc<dyn AccessPolicy>,
        locks: RepoLocks,
    ) -> Self {
        Self {
            repos_root: repos_root.into(),
            work_root: work_root.into(),
            rules,
            policy,
            locks,
        }
    }

    /// Ingest one staged file. The temp file is gone afterwards, whatever the outcome.
    #[instrument(skip_all, fields(project_id = %payload.project_id, file = %payload.original_filename))]
    pub async fn ingest(&self, ctx: &TaskContext, payload: &ProcessAssetPayload) -> VaultResult<CommitOutcome> {
        let result = self.run(ctx, payload).await;
        discard_file(&payload.temp_file_path).await;
        result
    }

    async fn run(&self, ctx: &TaskContext, payload: &ProcessAssetPayload) -> VaultResult<CommitOutcome> {
        // STAGED
        let size = staged_size(&payload.temp_file_path, payload.size).await?;

        // VALIDATED
        self.validate(size, payload.mime_type.as_deref())?;
        let owner_id = validate_owner_id(&payload.owner_id)?;
        let filename = sanitize_filename(&payload.original_filename);
        let folder = sanitize_folder_path(&payload.target_folder_path)?;
        let relative = if folder.is_empty() {
            filename
        } else {
            format!("{}/{}", folder, filename)
        };
        if relative.eq_ignore_ascii_case(MANIFEST_FILENAME) {
            return Err(VaultError::Validation(format!(
                "{} at the repository root is reserved",
                MANIFEST_FILENAME
            )));
        }

        self.policy.can_write(owner_id, &payload.project_id).await?;
        let hash = repo_hash(owner_id, &payload.project_id);
        let bare = repository_path(&self.repos_root, &hash);
        if !git::is_bare_repo(&bare).await {
            return Err(VaultError::NotFound(format!(
                "project {} has no repository",
                payload.project_id
            )));
        }

        let _guard = self.locks.acquire(&hash).await;
        self.policy.within_quota(&bare, size).await?;
        ctx.checkpoint()?;
        let work = WorkDir::create(&self.work_root, "ingest").await?;
        let result = self
            .commit_into(ctx, work.path(), &bare, payload, owner_id, &relative)
            .await;
        if let Err(e) = work.cleanup().await {
            warn!(path = %work.path().display(), error = %e, "work directory cleanup failed");
        }

        let commit_hash = result?;
        info!(%commit_hash, path = %relative, repo_hash = %hash, "asset committed");
        Ok(CommitOutcome {
            commit_hash,
            relative_path: relative,
        })
    }

    fn validate(&self, size: u64, mime_type: Option<&str>) -> VaultResult<()> {
        if size > self.rules.max_file_size {
            return Err(VaultError::Validation(format!(
                "file is {} bytes, limit is {}",
                size, self.rules.max_file_size
            )));
        }
        let mime = mime_type
            .map(essence)
            .filter(|m| !m.is_empty())
            .ok_or_else(|| VaultError::Validation("file type is required".into()))?;
        if !self
            .rules
            .allowed_mime_types
            .iter()
            .any(|allowed| essence(allowed) == mime)
        {
            return Err(VaultError::Validation(format!(
                "file type {} is not allowed",
                mime
            )));
        }
        Ok(())
    }

    async fn commit_into(
        &self,
        ctx: &TaskContext,
        work: &Path,
        bare: &Path,
        payload: &ProcessAssetPayload,
        owner_id: &str,
        relative: &str,
    ) -> VaultResult<String> {
        let tree = work.join("tree");
        git::clone_repo(bare, &tree).await?;

        // MOVED
        let dest = tree.join(relative);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .io_context(|| format!("creating {}", parent.display()))?;
        }
        move_file(&payload.temp_file_path, &dest).await?;
        debug!(dest = %dest.display(), "asset placed");

        // COMMITTED
        let committed = self.commit_placed(ctx, &tree, bare, owner_id, relative).await;
        if committed.is_err() {
            discard_file(&dest).await;
        }
        committed
    }

    async fn commit_placed(
        &self,
        ctx: &TaskContext,
        tree: &Path,
        bare: &Path,
        owner_id: &str,
        relative: &str,
    ) -> VaultResult<String> {
        let previous = git::head_commit(tree).await?;
        git::add_path(tree, relative).await?;
        if !git::has_staged_changes(tree).await? {
            return Err(VaultError::Validation(format!(
                "{} is identical to the committed version",
                relative
            )));
        }
        let identity = user_identity(owner_id, &self.rules.commit_email_domain);
        git::commit(tree, &identity, &format!("Add {}", relative)).await?;
        let commit_hash = git::head_commit(tree).await?;
        let branch = git::current_branch(tree).await?;
        git::push(tree, REMOTE_NAME, &branch).await?;

        if let Err(cancelled) = ctx.checkpoint() {
            git::rewind_branch(bare, &branch, &previous, &commit_hash).await?;
            warn!(%commit_hash, "cancelled after push; branch rewound");
            return Err(cancelled);
        }
        Ok(commit_hash)
    }
}

#[async_trait]
impl TaskHandler for AssetIngestionHandler {
    fn kind(&self) -> TaskKind {
        TaskKind::ProcessAsset
    }

    async fn handle(&self, ctx: &TaskContext, payload: TaskPayload) -> VaultResult<Value> {
        let TaskPayload::ProcessAsset(payload) = payload else {
            return Err(VaultError::Validation("expected a PROCESS_ASSET payload".into()));
        };
        let outcome = self.ingest(ctx, &payload).await?;
        encode_result(&outcome)
    }
}

/// Actual size of the staged file, which must match what the upload declared.
async fn staged_size(path: &Path, declared: u64) -> VaultResult<u64> {
    let meta = match tokio::fs::metadata(path).await {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(VaultError::Transfer(format!(
                "staged file {} vanished",
                path.display()
            )))
        }
        Err(e) => return Err(e).io_context(|| format!("inspecting {}", path.display())),
    };
    if !meta.is_file() {
        return Err(VaultError::Transfer(format!(
            "staged path {} is not a file",
            path.display()
        )));
    }
    if meta.len() != declared {
        return Err(VaultError::Transfer(format!(
            "staged file holds {} bytes, upload declared {}",
            meta.len(),
            declared
        )));
    }
    Ok(meta.len())
}

/// `type/subtype` without parameters, lowercased.
fn essence(mime: &str) -> String {
    mime.split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

/// Commit identity for an uploading user: the owner id as the name, and a
/// no-reply address built from it.
fn user_identity(owner_id: &str, domain: &str) -> CommitIdentity {
    let local: String = owner_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '-'
            }
        })
        .collect();
    let local = local.trim_matches(|c| c == '.' || c == '-');
    let local = if local.is_empty() { "user" } else { local };
    CommitIdentity {
        name: owner_id.to_string(),
        email: format!("{}@{}", local, domain),
    }
}
