//! Service wiring: one place that turns a [`Config`] into running parts.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;

use asset_vault_core::store::memory::InMemoryTaskStore;
use asset_vault_core::store::RetentionPolicy;

use crate::access::{AccessPolicy, StaticPolicy};
use crate::config::Config;
use crate::ingest::AssetIngestionHandler;
use crate::locks::RepoLocks;
use crate::provision::{CreateRepoHandler, Provisioner};
use crate::queue::{HandlerRegistry, QueueOptions, TaskQueue};
use crate::staging::StagingArea;
use crate::upload::{UploadOptions, UploadReceiver};

/// Every long-lived component, cheap to clone into request handlers.
#[derive(Clone)]
pub struct Vault {
    pub config: Arc<Config>,
    pub queue: TaskQueue,
    pub uploads: Arc<UploadReceiver>,
    pub provisioner: Provisioner,
}

/// Create the storage directories named in `config`.
pub async fn init_storage(config: &Config) -> Result<()> {
    for dir in [
        &config.storage.repos_root,
        &config.storage.work_dir,
        &config.upload_store_dir(),
        &config.completed_dir(),
    ] {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Failed to create {}", dir.display()))?;
    }
    Ok(())
}

impl Vault {
    /// Build with the bundled [`StaticPolicy`].
    pub async fn build(config: Config) -> Result<Self> {
        let policy = Arc::new(StaticPolicy::new(config.assets.max_repo_bytes));
        Self::build_with_policy(config, policy).await
    }

    /// Build with a caller-supplied access policy.
    pub async fn build_with_policy(config: Config, policy: Arc<dyn AccessPolicy>) -> Result<Self> {
        config.validate()?;
        init_storage(&config).await?;

        let locks = RepoLocks::new();
        let mut handlers = HandlerRegistry::new();
        handlers.register(Arc::new(CreateRepoHandler::new(
            &config.storage.repos_root,
            &config.storage.work_dir,
            config.hooks.pre_receive.clone(),
            locks.clone(),
        )));
        handlers.register(Arc::new(AssetIngestionHandler::new(
            &config.storage.repos_root,
            &config.storage.work_dir,
            config.assets.clone(),
            policy,
            locks,
        )));

        let store = Arc::new(InMemoryTaskStore::new(RetentionPolicy {
            ttl: config.task_ttl()?,
            max_retained: config.queue.max_retained_tasks,
        }));
        let queue = TaskQueue::start(
            store,
            handlers,
            QueueOptions {
                workers: config.queue.workers,
                task_timeout: config.queue.task_timeout_secs.map(Duration::from_secs),
                ..QueueOptions::default()
            },
        );

        let uploads = UploadReceiver::open(
            config.upload_store_dir(),
            StagingArea::new(config.completed_dir()),
            queue.clone(),
            UploadOptions {
                max_size: config.uploads.max_size,
                idle_timeout: Duration::from_secs(config.uploads.idle_timeout_secs),
            },
        )
        .await
        .context("Failed to open upload store")?;
        uploads.spawn_gc(Duration::from_secs(config.uploads.gc_interval_secs));

        let provisioner = Provisioner::new(queue.clone(), &config.storage.repos_root);
        info!(
            repos = %config.storage.repos_root.display(),
            staging = %config.storage.staging_dir.display(),
            "vault ready"
        );

        Ok(Self {
            config: Arc::new(config),
            queue,
            uploads,
            provisioner,
        })
    }
}
