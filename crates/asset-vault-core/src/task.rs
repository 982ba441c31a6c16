//! Task model and its one-way status machine.
//!
//! ```text
//! pending ──▶ running ──▶ success
//!                    └──▶ failed
//! ```
//!
//! A `success` task always carries a result; a `failed` task always carries
//! an error. Transitions never move backward.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::VaultError;
use crate::payload::TaskPayload;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskKind {
    CreateRepo,
    ProcessAsset,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::CreateRepo => "CREATE_REPO",
            TaskKind::ProcessAsset => "PROCESS_ASSET",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Success,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Success | TaskStatus::Failed)
    }

    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (TaskStatus::Pending, TaskStatus::Running)
                | (TaskStatus::Running, TaskStatus::Success)
                | (TaskStatus::Running, TaskStatus::Failed)
        )
    }
}

/// Error recorded on a failed task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    /// Error category code (`validation`, `repository`, `io`, ...).
    pub kind: String,
    pub message: String,
}

impl TaskFailure {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

impl From<&VaultError> for TaskFailure {
    fn from(err: &VaultError) -> Self {
        TaskFailure::new(err.code(), err.to_string())
    }
}

/// A requested status change, applied atomically by a task store.
#[derive(Debug, Clone)]
pub enum Transition {
    Start,
    Succeed(serde_json::Value),
    Fail(TaskFailure),
}

#[derive(Debug, thiserror::Error)]
#[error("task {task_id}: illegal transition {from:?} -> {to:?}")]
pub struct InvalidTransition {
    pub task_id: String,
    pub from: TaskStatus,
    pub to: TaskStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: TaskKind,
    pub status: TaskStatus,
    pub payload: TaskPayload,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskFailure>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Task {
    /// A fresh `pending` task with a random id.
    pub fn new(payload: TaskPayload) -> Self {
        let now = Utc::now();
        Self {
            id: format!("task_{}", Uuid::new_v4().simple()),
            kind: payload.kind(),
            status: TaskStatus::Pending,
            payload,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    /// Apply a transition, refusing anything that is not strictly forward.
    pub fn apply(&mut self, transition: Transition, now: DateTime<Utc>) -> Result<(), InvalidTransition> {
        let next = match &transition {
            Transition::Start => TaskStatus::Running,
            Transition::Succeed(_) => TaskStatus::Success,
            Transition::Fail(_) => TaskStatus::Failed,
        };
        if !self.status.can_transition_to(next) {
            return Err(InvalidTransition {
                task_id: self.id.clone(),
                from: self.status,
                to: next,
            });
        }

        match transition {
            Transition::Start => {}
            Transition::Succeed(result) => self.result = Some(result),
            Transition::Fail(failure) => self.error = Some(failure),
        }
        self.status = next;
        self.updated_at = now;
        if next.is_terminal() {
            self.finished_at = Some(now);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::CreateRepoPayload;
    use crate::manifest::ProjectManifest;
    use std::path::PathBuf;

    fn sample() -> Task {
        Task::new(TaskPayload::CreateRepo(CreateRepoPayload {
            owner_id: "u".into(),
            project_id: "p".into(),
            project_name: "P".into(),
            repo_hash: "ab".into(),
            repo_path: PathBuf::from("/repos/ab.git"),
            manifest: ProjectManifest::new("u", "p", "P", Utc::now()),
        }))
    }

    #[test]
    fn forward_path_to_success() {
        let mut t = sample();
        assert_eq!(t.status, TaskStatus::Pending);
        t.apply(Transition::Start, Utc::now()).unwrap();
        t.apply(Transition::Succeed(serde_json::json!({"ok": true})), Utc::now())
            .unwrap();
        assert_eq!(t.status, TaskStatus::Success);
        assert!(t.result.is_some());
        assert!(t.error.is_none());
        assert!(t.finished_at.is_some());
    }

    #[test]
    fn failure_carries_error() {
        let mut t = sample();
        t.apply(Transition::Start, Utc::now()).unwrap();
        t.apply(Transition::Fail(TaskFailure::new("io", "disk full")), Utc::now())
            .unwrap();
        assert_eq!(t.status, TaskStatus::Failed);
        assert_eq!(t.error.as_ref().unwrap().kind, "io");
    }

    #[test]
    fn never_moves_backward() {
        let mut t = sample();
        t.apply(Transition::Start, Utc::now()).unwrap();
        assert!(t.apply(Transition::Start, Utc::now()).is_err());
        t.apply(Transition::Succeed(serde_json::Value::Null), Utc::now())
            .unwrap();
        assert!(t.apply(Transition::Fail(TaskFailure::new("x", "y")), Utc::now()).is_err());
        assert_eq!(t.status, TaskStatus::Success);
    }

    #[test]
    fn cannot_fail_without_running() {
        let mut t = sample();
        assert!(t.apply(Transition::Fail(TaskFailure::new("x", "y")), Utc::now()).is_err());
        assert!(t.error.is_none());
    }

    #[test]
    fn cannot_succeed_without_running() {
        let mut t = sample();
        let err = t
            .apply(Transition::Succeed(serde_json::Value::Null), Utc::now())
            .unwrap_err();
        assert_eq!(err.from, TaskStatus::Pending);
        assert_eq!(t.status, TaskStatus::Pending);
    }

    #[test]
    fn serializes_kind_as_type() {
        let json = serde_json::to_value(sample()).unwrap();
        assert_eq!(json["type"], "CREATE_REPO");
        assert_eq!(json["status"], "pending");
        assert!(json.get("error").is_none());
    }
}
