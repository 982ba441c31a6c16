//! Typed task payloads and the results their handlers produce.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::manifest::ProjectManifest;
use crate::task::TaskKind;

/// Body of a `CREATE_REPO` task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRepoPayload {
    pub owner_id: String,
    pub project_id: String,
    pub project_name: String,
    pub repo_hash: String,
    pub repo_path: PathBuf,
    pub manifest: ProjectManifest,
}

/// Body of a `PROCESS_ASSET` task: a fully staged upload awaiting commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessAssetPayload {
    pub temp_file_path: PathBuf,
    pub original_filename: String,
    pub project_id: String,
    pub owner_id: String,
    pub target_folder_path: String,
    pub size: u64,
    pub mime_type: Option<String>,
    pub uploaded_at: DateTime<Utc>,
}

/// Unit of work accepted by the task queue, tagged by kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskPayload {
    CreateRepo(CreateRepoPayload),
    ProcessAsset(ProcessAssetPayload),
}

impl TaskPayload {
    pub fn kind(&self) -> TaskKind {
        match self {
            TaskPayload::CreateRepo(_) => TaskKind::CreateRepo,
            TaskPayload::ProcessAsset(_) => TaskKind::ProcessAsset,
        }
    }
}

/// Result of a successful `CREATE_REPO` task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryInfo {
    pub repo_hash: String,
    pub path: PathBuf,
    pub hooks_installed: bool,
    pub default_branch: String,
}

/// Result of a successful `PROCESS_ASSET` task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitOutcome {
    pub commit_hash: String,
    pub relative_path: String,
}
