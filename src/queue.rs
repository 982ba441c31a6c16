//! Asynchronous task queue with a bounded worker pool.
//!
//! Request handlers call [`TaskQueue::add_task`], which records a `pending`
//! task and returns its id immediately. A single dispatcher drains the
//! submission channel and runs each task on the Tokio runtime, holding one
//! [`Semaphore`] permit per running task so at most `workers` bodies run at
//! once.
//!
//! # Execution contract
//!
//! | Property | Behavior |
//! |----------|----------|
//! | Attempts | Exactly one per task, no retry |
//! | Status | `pending → running → success \| failed`, never backward |
//! | Errors | Recorded on the task as [`TaskFailure`] |
//! | Panics | Captured and recorded as a `panic` failure |
//! | Watchdog | Optional; cancels the task's [`TaskContext`] and records whatever the body returns |
//!
//! Handlers are looked up in a [`HandlerRegistry`] keyed by [`TaskKind`].
//!
//! The watchdog never abandons a running body. Once the limit passes it
//! cancels the task's context; the handler notices at its next
//! [`TaskContext::checkpoint`], rolls back, and returns
//! [`VaultError::TimedOut`]. The task is only recorded after that, so a
//! `failed` task never leaves committed work behind.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::{mpsc, Notify, Semaphore};
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use asset_vault_core::payload::TaskPayload;
use asset_vault_core::store::TaskStore;
use asset_vault_core::task::{Task, TaskFailure, TaskKind, Transition};
use asset_vault_core::{VaultError, VaultResult};

// ═══════════════════════════════════════════════════════════════════════
// Handlers
// ═══════════════════════════════════════════════════════════════════════

/// Per-execution state handed to a [`TaskHandler`].
#[derive(Debug, Clone)]
pub struct TaskContext {
    task_id: String,
    cancel: CancellationToken,
}

impl TaskContext {
    pub fn new(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Ask the handler to stop at its next checkpoint.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// `Err(TimedOut)` once the context has been cancelled.
    pub fn checkpoint(&self) -> VaultResult<()> {
        if self.is_cancelled() {
            return Err(VaultError::TimedOut(format!(
                "task {} exceeded its time limit",
                self.task_id
            )));
        }
        Ok(())
    }
}

/// Body of one task kind.
///
/// The returned JSON becomes the task's `result`; an error becomes its
/// `error`. Implementations must clean up after themselves on every path:
/// the queue never retries and never rolls anything back. Handlers call
/// [`TaskContext::checkpoint`] between steps and before returning success,
/// undoing their own work when it fails.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    fn kind(&self) -> TaskKind;

    async fn handle(&self, ctx: &TaskContext, payload: TaskPayload) -> VaultResult<Value>;
}

/// Handlers keyed by the task kind they execute.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<TaskKind, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous one for the same kind.
    pub fn register(&mut self, handler: Arc<dyn TaskHandler>) {
        self.handlers.insert(handler.kind(), handler);
    }

    pub fn get(&self, kind: TaskKind) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(&kind).cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Queue
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub struct QueueOptions {
    pub workers: usize,
    pub task_timeout: Option<Duration>,
    /// How often the retention policy is applied in the background.
    pub sweep_interval: Duration,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            workers: 4,
            task_timeout: None,
            sweep_interval: Duration::from_secs(60),
        }
    }
}

struct Dispatch {
    store: Arc<dyn TaskStore>,
    handlers: HandlerRegistry,
    slots: Arc<Semaphore>,
    task_timeout: Option<Duration>,
    finished: Notify,
}

/// Handle for submitting and polling tasks. Cheap to clone.
#[derive(Clone)]
pub struct TaskQueue {
    dispatch: Arc<Dispatch>,
    submit: mpsc::UnboundedSender<String>,
}

impl TaskQueue {
    /// Spawn the dispatcher and the retention sweep on the current runtime.
    pub fn start(store: Arc<dyn TaskStore>, handlers: HandlerRegistry, options: QueueOptions) -> Self {
        let (submit, rx) = mpsc::unbounded_channel();
        let dispatch = Arc::new(Dispatch {
            store,
            handlers,
            slots: Arc::new(Semaphore::new(options.workers.max(1))),
            task_timeout: options.task_timeout,
            finished: Notify::new(),
        });

        tokio::spawn(run_dispatcher(rx, dispatch.clone()));
        tokio::spawn(run_sweeper(Arc::downgrade(&dispatch), options.sweep_interval));
        info!(
            workers = options.workers,
            handlers = dispatch.handlers.len(),
            "task queue started"
        );

        Self { dispatch, submit }
    }

    /// Record a pending task and schedule it. Returns the task id.
    ///
    /// Never fails: if the task cannot be scheduled it is recorded as failed.
    pub async fn add_task(&self, payload: TaskPayload) -> String {
        let task = Task::new(payload);
        let id = task.id.clone();
        let kind = task.kind;

        if let Err(e) = self.dispatch.store.insert(task).await {
            error!(task_id = %id, %kind, error = %e, "failed to record task");
            return id;
        }
        debug!(task_id = %id, %kind, "task enqueued");

        if self.submit.send(id.clone()).is_err() {
            warn!(task_id = %id, "dispatcher is gone; failing task");
            let failure = TaskFailure::new("internal", "task queue is shut down");
            self.dispatch.record(&id, Ok(Transition::Start)).await;
            self.dispatch.record(&id, Err(failure)).await;
        }
        id
    }

    pub async fn get_task(&self, id: &str) -> Result<Option<Task>> {
        self.dispatch.store.get(id).await
    }

    pub async fn list_tasks(&self) -> Result<Vec<Task>> {
        self.dispatch.store.list().await
    }

    /// Wait until task `id` reaches a terminal status.
    ///
    /// Returns `None` if the task is unknown (or was evicted while waiting).
    pub async fn wait_for(&self, id: &str) -> Result<Option<Task>> {
        loop {
            let notified = self.dispatch.finished.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.dispatch.store.get(id).await? {
                Some(task) if task.status.is_terminal() => return Ok(Some(task)),
                Some(_) => {}
                None => return Ok(None),
            }
            notified.await;
        }
    }
}

async fn run_dispatcher(mut rx: mpsc::UnboundedReceiver<String>, dispatch: Arc<Dispatch>) {
    while let Some(id) = rx.recv().await {
        let permit = match dispatch.slots.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };
        let dispatch = dispatch.clone();
        let span = tracing::info_span!("task", task_id = %id);
        tokio::spawn(
            async move {
                dispatch.execute(&id).await;
                drop(permit);
            }
            .instrument(span),
        );
    }
    debug!("task dispatcher stopped");
}

async fn run_sweeper(dispatch: std::sync::Weak<Dispatch>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(dispatch) = dispatch.upgrade() else {
            break;
        };
        match dispatch.store.evict_expired(Utc::now()).await {
            Ok(0) => {}
            Ok(n) => debug!(evicted = n, "expired tasks evicted"),
            Err(e) => warn!(error = %e, "task eviction failed"),
        }
    }
}

impl Dispatch {
    async fn execute(&self, id: &str) {
        let task = match self.store.transition(id, Transition::Start).await {
            Ok(task) => task,
            Err(e) => {
                error!(error = %e, "task could not be started");
                return;
            }
        };
        info!(kind = %task.kind, "task running");

        let Some(handler) = self.handlers.get(task.kind) else {
            let failure = TaskFailure::new("internal", format!("no handler for {}", task.kind));
            self.record(id, Err(failure)).await;
            return;
        };

        let ctx = TaskContext::new(id);
        let watchdog = ctx.clone();
        let payload = task.payload;
        let mut body = tokio::spawn(
            async move { handler.handle(&ctx, payload).await }.in_current_span(),
        );

        let joined = match self.task_timeout {
            Some(limit) => match tokio::time::timeout(limit, &mut body).await {
                Ok(joined) => joined,
                Err(_) => {
                    warn!(limit_secs = limit.as_secs(), "task over its time limit; cancelling");
                    watchdog.cancel();
                    body.await
                }
            },
            None => body.await,
        };

        let outcome = match joined {
            Ok(Ok(value)) => Ok(Transition::Succeed(value)),
            Ok(Err(err)) => Err(TaskFailure::from(&err)),
            Err(join_err) => Err(join_failure(join_err)),
        };
        self.record(id, outcome).await;
    }

    /// Apply a transition (or a failure) and wake anyone waiting on completion.
    async fn record(&self, id: &str, outcome: std::result::Result<Transition, TaskFailure>) {
        let transition = match outcome {
            Ok(t) => t,
            Err(failure) => {
                warn!(task_id = %id, kind = %failure.kind, message = %failure.message, "task failed");
                Transition::Fail(failure)
            }
        };
        let succeeded = matches!(transition, Transition::Succeed(_));
        match self.store.transition(id, transition).await {
            Ok(task) => {
                if succeeded {
                    info!(task_id = %id, "task succeeded");
                }
                if task.status.is_terminal() {
                    self.finished.notify_waiters();
                }
            }
            Err(e) => error!(task_id = %id, error = %e, "task transition rejected"),
        }
    }
}

/// Serialize a handler's typed result into the task's `result` JSON.
pub fn encode_result<T: serde::Serialize>(value: &T) -> VaultResult<Value> {
    serde_json::to_value(value).map_err(|e| VaultError::io("encoding task result", e.into()))
}

fn join_failure(err: JoinError) -> TaskFailure {
    if err.is_panic() {
        TaskFailure::new("panic", panic_message(err.into_panic()))
    } else {
        TaskFailure::new("internal", "task was cancelled")
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("task panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("task panicked: {}", s)
    } else {
        "task panicked".to_string()
    }
}
