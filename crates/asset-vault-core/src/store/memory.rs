//! In-memory [`TaskStore`] with TTL-since-completion and size-bound eviction.
//!
//! Uses a `HashMap` behind `std::sync::RwLock`. Critical sections never
//! await, so a blocking lock is fine inside async code.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::task::{Task, Transition};

use super::{RetentionPolicy, TaskStore};

pub struct InMemoryTaskStore {
    tasks: RwLock<HashMap<String, Task>>,
    policy: RetentionPolicy,
}

impl InMemoryTaskStore {
    pub fn new(policy: RetentionPolicy) -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
            policy,
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<String, Task>>> {
        self.tasks.read().map_err(|_| anyhow!("task table lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<String, Task>>> {
        self.tasks.write().map_err(|_| anyhow!("task table lock poisoned"))
    }
}

impl Default for InMemoryTaskStore {
    fn default() -> Self {
        Self::new(RetentionPolicy::default())
    }
}

/// Remove finished tasks until at most `max` remain, oldest completion first.
fn enforce_capacity(tasks: &mut HashMap<String, Task>, max: usize) -> usize {
    if tasks.len() <= max {
        return 0;
    }
    let mut finished: Vec<(DateTime<Utc>, String)> = tasks
        .values()
        .filter_map(|t| t.finished_at.map(|at| (at, t.id.clone())))
        .collect();
    finished.sort();

    let excess = tasks.len() - max;
    let mut removed = 0;
    for (_, id) in finished.into_iter().take(excess) {
        tasks.remove(&id);
        removed += 1;
    }
    removed
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn insert(&self, task: Task) -> Result<()> {
        let mut tasks = self.write()?;
        tasks.insert(task.id.clone(), task);
        enforce_capacity(&mut tasks, self.policy.max_retained);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Task>> {
        Ok(self.read()?.get(id).cloned())
    }

    async fn transition(&self, id: &str, transition: Transition) -> Result<Task> {
        let mut tasks = self.write()?;
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| anyhow!("task not found: {}", id))?;
        task.apply(transition, Utc::now())?;
        Ok(task.clone())
    }

    async fn list(&self) -> Result<Vec<Task>> {
        let mut all: Vec<Task> = self.read()?.values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(all)
    }

    async fn evict_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut tasks = self.write()?;
        let before = tasks.len();
        let ttl = self.policy.ttl;
        tasks.retain(|_, t| match t.finished_at {
            Some(at) => now - at < ttl,
            None => true,
        });
        let expired = before - tasks.len();
        Ok(expired + enforce_capacity(&mut tasks, self.policy.max_retained))
    }
}
