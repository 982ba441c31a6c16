//! Per-repository mutual exclusion.
//!
//! Every task that mutates a bare repository first acquires the lock for its
//! `repo_hash` and holds the returned guard until it is done. Unrelated
//! repositories never contend. The table only keeps entries that are held or
//! awaited; idle entries are pruned on the next acquisition.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::OwnedMutexGuard;
use tracing::trace;

/// RAII guard for one repository. Dropping it releases the lock.
pub struct RepoGuard {
    repo_hash: String,
    _guard: OwnedMutexGuard<()>,
}

impl RepoGuard {
    pub fn repo_hash(&self) -> &str {
        &self.repo_hash
    }
}

impl std::fmt::Debug for RepoGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepoGuard")
            .field("repo_hash", &self.repo_hash)
            .finish()
    }
}

/// In-process lock table keyed by repository hash.
#[derive(Debug, Clone, Default)]
pub struct RepoLocks {
    inner: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl RepoLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, repo_hash: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut table = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        // An entry whose only reference is the table is neither held nor awaited.
        table.retain(|key, lock| key == repo_hash || Arc::strong_count(lock) > 1);
        table
            .entry(repo_hash.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Wait for exclusive access to `repo_hash`.
    pub async fn acquire(&self, repo_hash: &str) -> RepoGuard {
        let lock = self.slot(repo_hash);
        let guard = lock.lock_owned().await;
        trace!(repo_hash, "repository lock acquired");
        RepoGuard {
            repo_hash: repo_hash.to_string(),
            _guard: guard,
        }
    }

    /// Number of entries currently tracked.
    pub fn tracked(&self) -> usize {
        self.inner.lock().map(|t| t.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn same_repo_is_serialized() {
        let locks = RepoLocks::new();
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let active = active.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                let _guard = locks.acquire("abc").await;
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                active.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn different_repos_do_not_block() {
        let locks = RepoLocks::new();
        let _a = locks.acquire("a").await;
        let b = tokio::time::timeout(Duration::from_millis(200), locks.acquire("b")).await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn idle_entries_are_pruned() {
        let locks = RepoLocks::new();
        drop(locks.acquire("a").await);
        drop(locks.acquire("b").await);
        let _c = locks.acquire("c").await;
        assert_eq!(locks.tracked(), 1);
    }
}
