//! Storage abstraction for queued tasks.
//!
//! The [`TaskStore`] trait holds every task the queue has accepted and
//! applies status transitions atomically, so a poller never observes a
//! half-applied change. Implementations must be `Send + Sync` to work with
//! async runtimes.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::task::{Task, Transition};

/// How long finished tasks are kept and how many are kept at most.
///
/// Pending and running tasks are never evicted.
#[derive(Debug, Clone, Copy)]
pub struct RetentionPolicy {
    /// Finished tasks older than this (measured from completion) are dropped.
    pub ttl: Duration,
    /// Upper bound on retained tasks; the oldest finished ones go first.
    pub max_retained: usize,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            ttl: Duration::hours(24),
            max_retained: 10_000,
        }
    }
}

/// Abstract task table.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`insert`](TaskStore::insert) | Record a new pending task |
/// | [`get`](TaskStore::get) | Snapshot one task by id |
/// | [`transition`](TaskStore::transition) | Atomically advance a task's status |
/// | [`list`](TaskStore::list) | Snapshot every retained task |
/// | [`evict_expired`](TaskStore::evict_expired) | Apply the retention policy |
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn insert(&self, task: Task) -> Result<()>;

    async fn get(&self, id: &str) -> Result<Option<Task>>;

    /// Apply `transition` to task `id` and return the updated snapshot.
    ///
    /// Fails if the task is unknown or the transition is not forward.
    async fn transition(&self, id: &str, transition: Transition) -> Result<Task>;

    async fn list(&self) -> Result<Vec<Task>>;

    /// Drop finished tasks that fall outside the retention policy.
    /// Returns how many were removed.
    async fn evict_expired(&self, now: DateTime<Utc>) -> Result<usize>;
}
