use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::QueueConfig;
use crate::queue::store::{CancelAction, CompleteAction, TaskStore};
use crate::queue::task::{
    BackoffPolicy, SubmitResult, Task, TaskError, TaskOutcome, TaskState,
};

/// Upper bound on how long an idle worker sleeps before re-checking the
/// queue, independent of wakeup notifications.
const MAX_IDLE_WAIT: Duration = Duration::from_millis(500);

/// Executes the payload of tasks of one registered `kind`.
///
/// Handlers must watch `cancel` at their own suspension points; cancellation
/// is cooperative and only guarantees eventual termination.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn run(&self, payload: &Value, cancel: CancellationToken) -> Result<(), TaskError>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(Value, CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), TaskError>> + Send,
{
    async fn run(&self, payload: &Value, cancel: CancellationToken) -> Result<(), TaskError> {
        (self.0)(payload.clone(), cancel).await
    }
}

/// Wrap an async closure as a [`TaskHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn TaskHandler>
where
    F: Fn(Value, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), TaskError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Lock-free execution counters, readable by status queries without touching
/// the queue lock.
#[derive(Debug, Default)]
pub struct QueueStats {
    pub succeeded: AtomicU64,
    pub failed: AtomicU64,
    pub cancelled: AtomicU64,
    pub retries: AtomicU64,
}

struct QueueInner {
    store: Mutex<TaskStore>,
    notify: Notify,
    idle: Notify,
    handlers: RwLock<HashMap<String, Arc<dyn TaskHandler>>>,
    outcomes: mpsc::UnboundedSender<TaskOutcome>,
    policy: BackoffPolicy,
    task_timeout: Duration,
    stats: Arc<QueueStats>,
}

/// Priority task queue with per-key serialization, retry backoff, and a
/// bounded worker pool front end. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct TaskQueue {
    inner: Arc<QueueInner>,
}

impl TaskQueue {
    /// Build a queue from config. The receiver carries terminal
    /// [`TaskOutcome`]s (succeeded, failed, cancelled); exhausted retries are
    /// surfaced there, never silently dropped.
    pub fn new(config: &QueueConfig) -> (Self, mpsc::UnboundedReceiver<TaskOutcome>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let queue = Self {
            inner: Arc::new(QueueInner {
                store: Mutex::new(TaskStore::new()),
                notify: Notify::new(),
                idle: Notify::new(),
                handlers: RwLock::new(HashMap::new()),
                outcomes: tx,
                policy: BackoffPolicy {
                    base: config.backoff_base,
                    max: config.backoff_max,
                    jitter: config.backoff_jitter,
                },
                task_timeout: config.task_timeout,
                stats: Arc::new(QueueStats::default()),
            }),
        };
        (queue, rx)
    }

    pub async fn register_handler(&self, kind: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        self.inner.handlers.write().await.insert(kind.into(), handler);
    }

    pub async fn submit(&self, task: Task) -> SubmitResult {
        let result = self.inner.store.lock().await.submit(task);
        if result.is_accepted() {
            self.inner.notify.notify_one();
        }
        result
    }

    /// Cancel by key. Returns whether anything was cancelled.
    pub async fn cancel(&self, key: &str) -> bool {
        let action = self.inner.store.lock().await.cancel(key, Utc::now());
        match action {
            CancelAction::PendingRemoved(outcome) => {
                self.inner.stats.cancelled.fetch_add(1, Ordering::Relaxed);
                let _ = self.inner.outcomes.send(outcome);
                true
            }
            CancelAction::RunningSignalled => true,
            CancelAction::NotFound => false,
        }
    }

    /// Execute the next eligible task inline, if any.
    ///
    /// Returns the attempt's outcome; a `Pending` state means the task
    /// failed and was requeued for retry.
    pub async fn run_once(&self) -> Option<TaskOutcome> {
        let pair = self.inner.store.lock().await.next_eligible(Utc::now());
        let (task, cancel) = pair?;
        Some(self.execute(task, cancel).await)
    }

    pub async fn depth(&self) -> usize {
        self.inner.store.lock().await.depth()
    }

    pub async fn running_count(&self) -> usize {
        self.inner.store.lock().await.running_count()
    }

    pub async fn running_keys(&self) -> Vec<String> {
        self.inner.store.lock().await.running_keys()
    }

    pub async fn pending_tasks(&self) -> Vec<Task> {
        self.inner.store.lock().await.pending_tasks()
    }

    pub fn stats(&self) -> Arc<QueueStats> {
        Arc::clone(&self.inner.stats)
    }

    /// Wait until no task is running, or until `timeout` elapses.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.running_count().await == 0 {
                return true;
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return false;
            }
            tokio::select! {
                _ = self.inner.idle.notified() => {}
                _ = tokio::time::sleep(remaining.min(Duration::from_millis(50))) => {}
            }
        }
    }

    /// Blocking dequeue for workers: waits until an eligible task exists or
    /// shutdown is signalled.
    pub(crate) async fn next_task(
        &self,
        shutdown: &CancellationToken,
    ) -> Option<(Task, CancellationToken)> {
        loop {
            if shutdown.is_cancelled() {
                return None;
            }
            let wait = {
                let mut store = self.inner.store.lock().await;
                let now = Utc::now();
                if let Some(pair) = store.next_eligible(now) {
                    return Some(pair);
                }
                store
                    .earliest_wakeup()
                    .map(|at| (at - now).to_std().unwrap_or(Duration::ZERO))
            };
            let sleep_for = wait.unwrap_or(MAX_IDLE_WAIT).min(MAX_IDLE_WAIT);
            tokio::select! {
                _ = self.inner.notify.notified() => {}
                _ = tokio::time::sleep(sleep_for) => {}
                _ = shutdown.cancelled() => return None,
            }
        }
    }

    /// Run one dequeued task under the per-task timeout and record the
    /// result. A timeout counts as a failed attempt and feeds the retry
    /// path.
    pub(crate) async fn execute(&self, task: Task, cancel: CancellationToken) -> TaskOutcome {
        let handler = self.inner.handlers.read().await.get(&task.kind).cloned();
        let result = match handler {
            Some(handler) => {
                match tokio::time::timeout(
                    self.inner.task_timeout,
                    handler.run(&task.payload, cancel.clone()),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(TaskError::new("task timed out")),
                }
            }
            None => Err(TaskError::new(format!(
                "no handler registered for kind {}",
                task.kind
            ))),
        };

        let cancelled = cancel.is_cancelled();
        let key = task.key.clone();
        let action = {
            let mut store = self.inner.store.lock().await;
            store.complete(task, result, cancelled, &self.inner.policy, Utc::now())
        };
        // completion may unblock a follower for this key
        self.inner.notify.notify_one();
        self.inner.idle.notify_waiters();

        match action {
            CompleteAction::Requeued {
                attempt,
                next_run_at,
                error,
                ..
            } => {
                self.inner.stats.retries.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    key = %key,
                    attempt,
                    next_run_at = %next_run_at,
                    error = %error,
                    "Task failed, retry scheduled"
                );
                TaskOutcome {
                    key,
                    state: TaskState::Pending,
                    attempt,
                    error: Some(error),
                    completed_at: Utc::now(),
                }
            }
            CompleteAction::Done(outcome) => {
                match outcome.state {
                    TaskState::Succeeded => {
                        self.inner.stats.succeeded.fetch_add(1, Ordering::Relaxed);
                    }
                    TaskState::Failed => {
                        self.inner.stats.failed.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(
                            key = %outcome.key,
                            attempts = outcome.attempt,
                            error = outcome.error.as_deref().unwrap_or(""),
                            "Task failed permanently"
                        );
                    }
                    TaskState::Cancelled => {
                        self.inner.stats.cancelled.fetch_add(1, Ordering::Relaxed);
                    }
                    _ => {}
                }
                let _ = self.inner.outcomes.send(outcome.clone());
                outcome
            }
        }
    }
}

/// Bounded pool of workers draining a [`TaskQueue`].
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    shutdown: CancellationToken,
}

impl WorkerPool {
    pub fn spawn(queue: TaskQueue, workers: usize) -> Self {
        let shutdown = CancellationToken::new();
        let handles = (0..workers)
            .map(|id| {
                let queue = queue.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    while let Some((task, cancel)) = queue.next_task(&shutdown).await {
                        let _ = queue.execute(task, cancel).await;
                    }
                    tracing::debug!(worker = id, "Worker stopped");
                })
            })
            .collect();
        Self { handles, shutdown }
    }

    /// Stop accepting work and join the workers. Returns `false` if any
    /// worker had to be aborted after `timeout`.
    pub async fn stop(self, timeout: Duration) -> bool {
        self.shutdown.cancel();
        let mut clean = true;
        for handle in self.handles {
            let abort = handle.abort_handle();
            match tokio::time::timeout(timeout, handle).await {
                Ok(_) => {}
                Err(_) => {
                    abort.abort();
                    clean = false;
                }
            }
        }
        clean
    }
}
