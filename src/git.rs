//! Git command wrappers using [`tokio::process::Command`].
//!
//! Every function shells out to the system `git` binary. Spawning and waiting
//! happen on the Tokio process driver, so request-serving tasks are never
//! blocked by version-control work. Any non-zero exit is surfaced as
//! [`VaultError::Repository`] carrying git's stderr.

use std::ffi::OsStr;
use std::path::Path;
use std::process::{Output, Stdio};

use tokio::process::Command;
use tracing::{debug, instrument};

use asset_vault_core::{VaultError, VaultResult};

/// Author and committer recorded on a commit.
#[derive(Debug, Clone)]
pub struct CommitIdentity {
    pub name: String,
    pub email: String,
}

impl CommitIdentity {
    /// Fixed identity used for automation commits such as the initial manifest.
    pub fn automation() -> Self {
        Self {
            name: "Asset Vault".to_string(),
            email: "automation@asset-vault.local".to_string(),
        }
    }
}

fn git_command<I, S>(cwd: Option<&Path>, args: I) -> Command
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut cmd = Command::new("git");
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }
    cmd.args(args);
    cmd.env("GIT_TERMINAL_PROMPT", "0");
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);
    cmd
}

async fn output_of(mut cmd: Command, label: &str) -> VaultResult<Output> {
    cmd.output()
        .await
        .map_err(|e| VaultError::Repository(format!("failed to spawn git {}: {}", label, e)))
}

/// Run git and return trimmed stdout, failing on a non-zero exit.
async fn run<I, S>(cwd: Option<&Path>, label: &str, args: I) -> VaultResult<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = output_of(git_command(cwd, args), label).await?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(VaultError::Repository(format!(
            "git {} failed ({}): {}",
            label,
            output.status,
            stderr.trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// `git init` a normal repository with a working tree at `dir`.
#[instrument(fields(dir = %dir.display()))]
pub async fn init_repo(dir: &Path) -> VaultResult<()> {
    run(None, "init", [OsStr::new("init"), OsStr::new("--quiet"), dir.as_os_str()]).await?;
    debug!("work repository initialised");
    Ok(())
}

/// `git init --bare` at `path`.
#[instrument(fields(path = %path.display()))]
pub async fn init_bare_repo(path: &Path) -> VaultResult<()> {
    run(
        None,
        "init --bare",
        [
            OsStr::new("init"),
            OsStr::new("--bare"),
            OsStr::new("--quiet"),
            path.as_os_str(),
        ],
    )
    .await?;
    debug!("bare repository initialised");
    Ok(())
}

/// Clone `source` (typically a bare repository path) into `dest`.
///
/// Local clones hardlink the object store where the filesystem allows it,
/// so the cost does not grow with the repository's history.
#[instrument(fields(source = %source.display(), dest = %dest.display()))]
pub async fn clone_repo(source: &Path, dest: &Path) -> VaultResult<()> {
    run(
        None,
        "clone",
        [
            OsStr::new("clone"),
            OsStr::new("--quiet"),
            OsStr::new("--local"),
            source.as_os_str(),
            dest.as_os_str(),
        ],
    )
    .await?;
    Ok(())
}

/// Stage exactly one path (relative to the work tree).
#[instrument(fields(work = %work.display()))]
pub async fn add_path(work: &Path, relative: &str) -> VaultResult<()> {
    run(Some(work), "add", ["add", "--", relative]).await?;
    Ok(())
}

/// Whether the index differs from `HEAD` (or holds anything, before the first commit).
pub async fn has_staged_changes(work: &Path) -> VaultResult<bool> {
    let output = output_of(
        git_command(Some(work), ["diff", "--cached", "--quiet"]),
        "diff --cached",
    )
    .await?;
    match output.status.code() {
        Some(0) => Ok(false),
        Some(1) => Ok(true),
        _ => Err(VaultError::Repository(format!(
            "git diff --cached failed ({}): {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        ))),
    }
}

/// Commit the index with `identity` as both author and committer.
#[instrument(skip(identity, message), fields(work = %work.display(), author = %identity.name))]
pub async fn commit(work: &Path, identity: &CommitIdentity, message: &str) -> VaultResult<()> {
    let mut cmd = git_command(
        Some(work),
        [
            "-c",
            "commit.gpgsign=false",
            "commit",
            "--quiet",
            "--no-verify",
            "-m",
            message,
        ],
    );
    cmd.env("GIT_AUTHOR_NAME", &identity.name)
        .env("GIT_AUTHOR_EMAIL", &identity.email)
        .env("GIT_COMMITTER_NAME", &identity.name)
        .env("GIT_COMMITTER_EMAIL", &identity.email);

    let output = output_of(cmd, "commit").await?;
    if !output.status.success() {
        return Err(VaultError::Repository(format!(
            "git commit failed ({}): {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    debug!("commit created");
    Ok(())
}

/// Full hash of `HEAD`.
pub async fn head_commit(work: &Path) -> VaultResult<String> {
    run(Some(work), "rev-parse", ["rev-parse", "HEAD"]).await
}

/// Name of the branch `HEAD` points at (works before the first commit too).
pub async fn current_branch(work: &Path) -> VaultResult<String> {
    run(Some(work), "symbolic-ref", ["symbolic-ref", "--short", "HEAD"]).await
}

#[instrument(fields(work = %work.display(), %name))]
pub async fn add_remote(work: &Path, name: &str, url: &Path) -> VaultResult<()> {
    run(
        Some(work),
        "remote add",
        [
            OsStr::new("remote"),
            OsStr::new("add"),
            OsStr::new(name),
            url.as_os_str(),
        ],
    )
    .await?;
    Ok(())
}

/// Push `branch` to `remote`. Server-side hooks run as part of this.
#[instrument(fields(work = %work.display(), %remote, %branch))]
pub async fn push(work: &Path, remote: &str, branch: &str) -> VaultResult<()> {
    let refspec = format!("refs/heads/{0}:refs/heads/{0}", branch);
    run(Some(work), "push", ["push", "--quiet", remote, refspec.as_str()]).await?;
    debug!("push complete");
    Ok(())
}

/// Point a bare repository's `HEAD` at `branch`.
#[instrument(fields(bare = %bare.display(), %branch))]
pub async fn set_bare_head(bare: &Path, branch: &str) -> VaultResult<()> {
    let target = format!("refs/heads/{}", branch);
    run(
        None,
        "symbolic-ref",
        [
            OsStr::new("--git-dir"),
            bare.as_os_str(),
            OsStr::new("symbolic-ref"),
            OsStr::new("HEAD"),
            OsStr::new(&target),
        ],
    )
    .await?;
    Ok(())
}

/// Move `branch` in a bare repository back from `from` to `to`.
///
/// Fails without touching anything if the branch no longer points at `from`.
#[instrument(fields(bare = %bare.display(), %branch, %to, %from))]
pub async fn rewind_branch(bare: &Path, branch: &str, to: &str, from: &str) -> VaultResult<()> {
    let refname = format!("refs/heads/{}", branch);
    run(
        None,
        "update-ref",
        [
            OsStr::new("--git-dir"),
            bare.as_os_str(),
            OsStr::new("update-ref"),
            OsStr::new(&refname),
            OsStr::new(to),
            OsStr::new(from),
        ],
    )
    .await?;
    debug!("branch rewound");
    Ok(())
}

/// Check whether `path` looks like a bare repository.
///
/// A directory holding a `HEAD` file plus `objects/` and `refs/`. This is a
/// lightweight heuristic, not an integrity check.
pub async fn is_bare_repo(path: &Path) -> bool {
    let is_dir = |p: std::path::PathBuf| async move {
        tokio::fs::metadata(p).await.map(|m| m.is_dir()).unwrap_or(false)
    };
    let head = tokio::fs::metadata(path.join("HEAD"))
        .await
        .map(|m| m.is_file())
        .unwrap_or(false);
    head && is_dir(path.join("objects")).await && is_dir(path.join("refs")).await
}
