use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::error::{Result, SkysweepError};
use crate::queue::{SubmitResult, TaskQueue, WorkerPool};
use crate::scheduler::entry::ScheduleEntry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl SchedulerState {
    fn as_str(&self) -> &'static str {
        match self {
            SchedulerState::Stopped => "stopped",
            SchedulerState::Starting => "starting",
            SchedulerState::Running => "running",
            SchedulerState::Stopping => "stopping",
        }
    }
}

impl std::fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What was left behind when `stop` returned.
#[derive(Debug, Default)]
pub struct StopReport {
    /// Keys of tasks still running when the graceful window closed.
    pub abandoned: Vec<String>,
    /// Tasks still queued (they survive in the snapshot, if configured).
    pub pending: usize,
    /// True when every in-flight task finished inside the window.
    pub graceful: bool,
}

/// Drives recurring jobs into the [`TaskQueue`] and owns the daemon's
/// worker-pool lifecycle.
///
/// State machine: Stopped → Starting → Running → Stopping → Stopped.
pub struct Scheduler {
    queue: TaskQueue,
    config: SchedulerConfig,
    workers: usize,
    entries: Arc<Mutex<HashMap<Uuid, ScheduleEntry>>>,
    state: Arc<Mutex<SchedulerState>>,
    tick_cancel: Mutex<Option<CancellationToken>>,
    tick_handle: Mutex<Option<JoinHandle<()>>>,
    pool: Mutex<Option<WorkerPool>>,
}

impl Scheduler {
    pub fn new(queue: TaskQueue, config: SchedulerConfig, workers: usize) -> Self {
        Self {
            queue,
            config,
            workers,
            entries: Arc::new(Mutex::new(HashMap::new())),
            state: Arc::new(Mutex::new(SchedulerState::Stopped)),
            tick_cancel: Mutex::new(None),
            tick_handle: Mutex::new(None),
            pool: Mutex::new(None),
        }
    }

    /// Register a recurring entry. The first fire lands one jittered
    /// interval after registration is observed by the tick loop.
    pub async fn register(&self, entry: ScheduleEntry) -> Uuid {
        let id = entry.id;
        tracing::debug!(name = %entry.name, interval = ?entry.interval, "Schedule entry registered");
        self.entries.lock().await.insert(id, entry);
        id
    }

    pub async fn unregister(&self, id: Uuid) -> bool {
        self.entries.lock().await.remove(&id).is_some()
    }

    /// Enable or disable an entry. Disabling takes effect immediately: no
    /// further fires happen, while an already-enqueued task runs to
    /// completion. Re-enabling schedules the next fire one interval out.
    pub async fn set_enabled(&self, id: Uuid, enabled: bool) -> bool {
        let mut entries = self.entries.lock().await;
        match entries.get_mut(&id) {
            Some(entry) => {
                entry.enabled = enabled;
                entry.next_due = None;
                true
            }
            None => false,
        }
    }

    pub async fn state(&self) -> SchedulerState {
        *self.state.lock().await
    }

    pub async fn start(&self) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            if *state != SchedulerState::Stopped {
                return Err(SkysweepError::SchedulerState {
                    state: state.as_str(),
                    expected: "stopped",
                });
            }
            *state = SchedulerState::Starting;
        }

        let pool = WorkerPool::spawn(self.queue.clone(), self.workers);
        *self.pool.lock().await = Some(pool);

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(Self::tick_loop(
            Arc::clone(&self.entries),
            self.queue.clone(),
            self.config.tick,
            cancel.clone(),
        ));
        *self.tick_cancel.lock().await = Some(cancel);
        *self.tick_handle.lock().await = Some(handle);

        *self.state.lock().await = SchedulerState::Running;
        tracing::info!(workers = self.workers, tick = ?self.config.tick, "Scheduler running");
        Ok(())
    }

    /// Stop firing and drain. In-flight tasks get up to `graceful_timeout`;
    /// whatever is still running afterwards is abandoned and reported.
    pub async fn stop(&self, graceful_timeout: Duration) -> StopReport {
        {
            let mut state = self.state.lock().await;
            if *state != SchedulerState::Running {
                tracing::debug!(state = %state, "Scheduler stop requested while not running");
                return StopReport {
                    graceful: true,
                    ..Default::default()
                };
            }
            *state = SchedulerState::Stopping;
        }

        if let Some(cancel) = self.tick_cancel.lock().await.take() {
            cancel.cancel();
        }
        if let Some(handle) = self.tick_handle.lock().await.take() {
            let _ = handle.await;
        }

        let drained = self.queue.wait_idle(graceful_timeout).await;
        let abandoned = if drained {
            Vec::new()
        } else {
            self.queue.running_keys().await
        };

        let pool_clean = match self.pool.lock().await.take() {
            Some(pool) => pool.stop(Duration::from_secs(1)).await,
            None => true,
        };

        let pending = self.queue.depth().await;
        let report = StopReport {
            graceful: drained && pool_clean,
            abandoned,
            pending,
        };
        if report.graceful {
            tracing::info!(pending = report.pending, "Scheduler stopped cleanly");
        } else {
            tracing::warn!(
                abandoned = ?report.abandoned,
                pending = report.pending,
                "Scheduler stopped with tasks abandoned"
            );
        }

        *self.state.lock().await = SchedulerState::Stopped;
        report
    }

    async fn tick_loop(
        entries: Arc<Mutex<HashMap<Uuid, ScheduleEntry>>>,
        queue: TaskQueue,
        configured_tick: Duration,
        cancel: CancellationToken,
    ) {
        loop {
            // keep granularity at or below the smallest registered interval
            let tick = {
                let entries = entries.lock().await;
                entries
                    .values()
                    .filter(|e| e.enabled)
                    .map(|e| e.interval)
                    .min()
                    .map(|min| configured_tick.min(min))
                    .unwrap_or(configured_tick)
            };
            tokio::select! {
                _ = tokio::time::sleep(tick) => {}
                _ = cancel.cancelled() => break,
            }
            Self::fire_due(&entries, &queue).await;
        }
    }

    async fn fire_due(entries: &Mutex<HashMap<Uuid, ScheduleEntry>>, queue: &TaskQueue) {
        let now = Utc::now();
        let mut entries = entries.lock().await;
        for entry in entries.values_mut() {
            if !entry.enabled {
                continue;
            }
            let due = match entry.next_due {
                Some(due) => due,
                None => {
                    entry.next_due = Some(entry.draw_next_due(now));
                    continue;
                }
            };
            if now < due {
                continue;
            }

            let task = entry.make_task();
            let key = task.key.clone();
            match queue.submit(task).await {
                SubmitResult::Accepted => {
                    tracing::debug!(entry = %entry.name, key = %key, "Schedule entry fired");
                }
                SubmitResult::Rejected(reason) => {
                    tracing::debug!(
                        entry = %entry.name,
                        key = %key,
                        reason = ?reason,
                        "Schedule fire rejected by queue"
                    );
                }
            }

            entry.last_fired_at = Some(due);
            // draw from the scheduled time so gaps keep the jitter bound;
            // fall back to now if the loop stalled past a whole interval
            let mut next = entry.draw_next_due(due);
            if next <= now {
                next = entry.draw_next_due(now);
            }
            entry.next_due = Some(next);
        }
    }
}
