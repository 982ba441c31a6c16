use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub hooks: HooksConfig,
    #[serde(default)]
    pub uploads: UploadsConfig,
    #[serde(default)]
    pub assets: AssetsConfig,
    #[serde(default)]
    pub queue: QueueConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Root under which every project's bare repository lives.
    pub repos_root: PathBuf,
    /// Upload staging root (protocol bookkeeping and completed files).
    pub staging_dir: PathBuf,
    /// Root for ephemeral work directories used while building commits.
    pub work_dir: PathBuf,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct HooksConfig {
    /// Central pre-receive hook script; each repository symlinks to it.
    #[serde(default)]
    pub pre_receive: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct UploadsConfig {
    #[serde(default = "default_base_path")]
    pub base_path: String,
    #[serde(default = "default_upload_max_size")]
    pub max_size: u64,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_gc_interval_secs")]
    pub gc_interval_secs: u64,
}

impl Default for UploadsConfig {
    fn default() -> Self {
        Self {
            base_path: default_base_path(),
            max_size: default_upload_max_size(),
            idle_timeout_secs: default_idle_timeout_secs(),
            gc_interval_secs: default_gc_interval_secs(),
        }
    }
}

fn default_base_path() -> String {
    "/files".to_string()
}
fn default_upload_max_size() -> u64 {
    1024 * 1024 * 1024
}
fn default_idle_timeout_secs() -> u64 {
    3600
}
fn default_gc_interval_secs() -> u64 {
    300
}

#[derive(Debug, Deserialize, Clone)]
pub struct AssetsConfig {
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
    #[serde(default = "default_allowed_mime_types")]
    pub allowed_mime_types: Vec<String>,
    #[serde(default = "default_commit_email_domain")]
    pub commit_email_domain: String,
    /// Optional ceiling on a project's bare repository size on disk.
    #[serde(default)]
    pub max_repo_bytes: Option<u64>,
}

impl Default for AssetsConfig {
    fn default() -> Self {
        Self {
            max_file_size: default_max_file_size(),
            allowed_mime_types: default_allowed_mime_types(),
            commit_email_domain: default_commit_email_domain(),
            max_repo_bytes: None,
        }
    }
}

fn default_max_file_size() -> u64 {
    100 * 1024 * 1024
}
fn default_allowed_mime_types() -> Vec<String> {
    [
        "image/jpeg",
        "image/png",
        "application/pdf",
        "text/plain",
        "text/markdown",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
fn default_commit_email_domain() -> String {
    "users.noreply.local".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueueConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_task_ttl_secs")]
    pub task_ttl_secs: u64,
    #[serde(default = "default_max_retained_tasks")]
    pub max_retained_tasks: usize,
    /// Watchdog: tasks running longer than this are failed.
    #[serde(default)]
    pub task_timeout_secs: Option<u64>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            task_ttl_secs: default_task_ttl_secs(),
            max_retained_tasks: default_max_retained_tasks(),
            task_timeout_secs: None,
        }
    }
}

fn default_workers() -> usize {
    4
}
fn default_task_ttl_secs() -> u64 {
    86_400
}
fn default_max_retained_tasks() -> usize {
    10_000
}

impl Config {
    /// A config with every directory placed under `root` and defaults
    /// elsewhere. Used by `vault init` templates and tests.
    pub fn rooted_at(root: &Path) -> Self {
        Self {
            server: ServerConfig {
                bind: "127.0.0.1:7340".to_string(),
            },
            storage: StorageConfig {
                repos_root: root.join("repos"),
                staging_dir: root.join("staging"),
                work_dir: root.join("work"),
            },
            hooks: HooksConfig::default(),
            uploads: UploadsConfig::default(),
            assets: AssetsConfig::default(),
            queue: QueueConfig::default(),
        }
    }

    /// Directory holding in-flight resumable uploads (`<id>` + `<id>.info`).
    pub fn upload_store_dir(&self) -> PathBuf {
        self.storage.staging_dir.join("tus")
    }

    /// Directory holding fully assembled files awaiting ingestion.
    pub fn completed_dir(&self) -> PathBuf {
        self.storage.staging_dir.join("completed")
    }

    /// How long finished tasks are retained, as a signed duration.
    pub fn task_ttl(&self) -> Result<chrono::TimeDelta> {
        i64::try_from(self.queue.task_ttl_secs)
            .ok()
            .and_then(chrono::TimeDelta::try_seconds)
            .with_context(|| {
                format!(
                    "queue.task_ttl_secs is out of range: {}",
                    self.queue.task_ttl_secs
                )
            })
    }

    pub fn validate(&self) -> Result<()> {
        if !self.uploads.base_path.starts_with('/') || self.uploads.base_path.ends_with('/') {
            anyhow::bail!("uploads.base_path must start with '/' and not end with '/'");
        }
        if self.uploads.max_size == 0 {
            anyhow::bail!("uploads.max_size must be > 0");
        }
        if self.uploads.idle_timeout_secs == 0 || self.uploads.gc_interval_secs == 0 {
            anyhow::bail!("uploads.idle_timeout_secs and uploads.gc_interval_secs must be > 0");
        }
        if self.assets.max_file_size == 0 {
            anyhow::bail!("assets.max_file_size must be > 0");
        }
        if self.assets.allowed_mime_types.is_empty() {
            anyhow::bail!("assets.allowed_mime_types must not be empty");
        }
        if self.queue.workers == 0 {
            anyhow::bail!("queue.workers must be >= 1");
        }
        if self.queue.max_retained_tasks == 0 {
            anyhow::bail!("queue.max_retained_tasks must be >= 1");
        }
        self.task_ttl()?;
        if self.queue.task_timeout_secs == Some(0) {
            anyhow::bail!("queue.task_timeout_secs must be > 0 when set");
        }
        if let Some(hook) = &self.hooks.pre_receive {
            if !hook.is_absolute() {
                anyhow::bail!(
                    "hooks.pre_receive must be an absolute path: {}",
                    hook.display()
                );
            }
        }
        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.validate()?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[server]
bind = "127.0.0.1:7340"

[storage]
repos_root = "/srv/vault/repos"
staging_dir = "/srv/vault/staging"
work_dir = "/srv/vault/work"
"#;

    #[test]
    fn minimal_config_gets_defaults() {
        let config: Config = toml::from_str(MINIMAL).unwrap();
        config.validate().unwrap();
        assert_eq!(config.uploads.base_path, "/files");
        assert_eq!(config.assets.max_file_size, 100 * 1024 * 1024);
        assert!(config
            .assets
            .allowed_mime_types
            .contains(&"application/pdf".to_string()));
        assert_eq!(config.queue.workers, 4);
        assert!(config.hooks.pre_receive.is_none());
    }

    #[test]
    fn rejects_relative_hook_path() {
        let toml_str = format!("{}\n[hooks]\npre_receive = \"hooks/pre-receive\"\n", MINIMAL);
        let config: Config = toml::from_str(&toml_str).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_workers() {
        let toml_str = format!("{}\n[queue]\nworkers = 0\n", MINIMAL);
        let config: Config = toml::from_str(&toml_str).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_unrepresentable_task_ttl() {
        let mut config = Config::rooted_at(Path::new("/tmp/x"));
        for secs in [u64::MAX, 100_000_000_000_000_000] {
            config.queue.task_ttl_secs = secs;
            assert!(config.validate().is_err(), "ttl {} accepted", secs);
            assert!(config.task_ttl().is_err());
        }

        config.queue.task_ttl_secs = 3600;
        config.validate().unwrap();
        assert_eq!(config.task_ttl().unwrap(), chrono::TimeDelta::hours(1));
    }

    #[test]
    fn rejects_bad_base_path() {
        let mut config = Config::rooted_at(Path::new("/tmp/x"));
        config.uploads.base_path = "files/".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_config_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vault.toml");
        std::fs::write(&path, MINIMAL).unwrap();
        let config = load_config(&path).unwrap();
        assert_eq!(config.server.bind, "127.0.0.1:7340");
        assert_eq!(config.completed_dir(), PathBuf::from("/srv/vault/staging/completed"));
    }
}
