use std::cmp::Reverse;
use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::queue::task::{
    to_delta, BackoffPolicy, RejectReason, SubmitResult, Task, TaskError, TaskOutcome, TaskState,
};

/// Queue position is (priority desc, next_run_at asc, submission order).
#[derive(Debug)]
struct QueuedTask {
    task: Task,
    seq: u64,
}

/// What `complete` decided to do with a finished attempt.
#[derive(Debug)]
pub enum CompleteAction {
    /// Failed with attempts left; requeued at `next_run_at`.
    Requeued {
        key: String,
        attempt: u32,
        next_run_at: DateTime<Utc>,
        error: String,
    },
    /// Terminal: succeeded, exhausted, or cancelled.
    Done(TaskOutcome),
}

#[derive(Debug)]
pub enum CancelAction {
    /// A pending instance was removed from the queue.
    PendingRemoved(TaskOutcome),
    /// The running instance was asked to stop cooperatively.
    RunningSignalled,
    NotFound,
}

/// Synchronous task-queue state. One instance lives behind the
/// [`crate::queue::TaskQueue`] lock; everything here is plain data
/// manipulation so it stays unit-testable without a runtime.
#[derive(Debug, Default)]
pub struct TaskStore {
    pending: Vec<QueuedTask>,
    running: HashMap<String, CancellationToken>,
    next_seq: u64,
}

impl TaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Submit a task.
    ///
    /// A pending task with the same key has its payload (and kind) replaced
    /// in place, keeping its queue position unless the new priority is
    /// higher. A key whose previous instance is still running accepts one
    /// queued follower; further submissions for that key are rejected until
    /// either finishes.
    pub fn submit(&mut self, mut task: Task) -> SubmitResult {
        let key_running = self.running.contains_key(&task.key);

        if let Some(existing) = self.pending.iter_mut().find(|q| q.task.key == task.key) {
            if key_running {
                return SubmitResult::Rejected(RejectReason::DuplicateRunning);
            }
            existing.task.payload = task.payload;
            existing.task.kind = task.kind;
            if task.priority > existing.task.priority {
                existing.task.priority = task.priority;
            }
            return SubmitResult::Accepted;
        }

        task.state = TaskState::Pending;
        let seq = self.next_seq;
        self.next_seq += 1;
        self.pending.push(QueuedTask { task, seq });
        SubmitResult::Accepted
    }

    /// Dequeue the best eligible task: highest priority first, then earliest
    /// `next_run_at`, then submission order. Tasks whose `next_run_at` is in
    /// the future or whose key is currently running are scanned past, never
    /// blocking eligible work behind them.
    pub fn next_eligible(&mut self, now: DateTime<Utc>) -> Option<(Task, CancellationToken)> {
        let idx = self
            .pending
            .iter()
            .enumerate()
            .filter(|(_, q)| q.task.next_run_at <= now && !self.running.contains_key(&q.task.key))
            .min_by_key(|(_, q)| (Reverse(q.task.priority), q.task.next_run_at, q.seq))
            .map(|(i, _)| i)?;

        let mut queued = self.pending.swap_remove(idx);
        queued.task.state = TaskState::Running;
        let token = CancellationToken::new();
        self.running.insert(queued.task.key.clone(), token.clone());
        Some((queued.task, token))
    }

    /// Earliest time at which a currently unrunnable-but-unblocked task
    /// becomes eligible. Followers blocked behind a running key are excluded;
    /// completion wakes the workers for those.
    pub fn earliest_wakeup(&self) -> Option<DateTime<Utc>> {
        self.pending
            .iter()
            .filter(|q| !self.running.contains_key(&q.task.key))
            .map(|q| q.task.next_run_at)
            .min()
    }

    /// Record the result of an execution attempt.
    pub fn complete(
        &mut self,
        mut task: Task,
        result: Result<(), TaskError>,
        cancelled: bool,
        policy: &BackoffPolicy,
        now: DateTime<Utc>,
    ) -> CompleteAction {
        self.running.remove(&task.key);

        if cancelled {
            return CompleteAction::Done(TaskOutcome {
                key: task.key,
                state: TaskState::Cancelled,
                attempt: task.attempt,
                error: None,
                completed_at: now,
            });
        }

        match result {
            Ok(()) => CompleteAction::Done(TaskOutcome {
                key: task.key,
                state: TaskState::Succeeded,
                attempt: task.attempt,
                error: None,
                completed_at: now,
            }),
            Err(err) => {
                let delay = policy.jittered_delay(task.attempt);
                task.attempt += 1;
                if task.attempt < task.max_attempts {
                    task.state = TaskState::Pending;
                    task.next_run_at = now + to_delta(delay);
                    let key = task.key.clone();
                    let attempt = task.attempt;
                    let next_run_at = task.next_run_at;
                    let seq = self.next_seq;
                    self.next_seq += 1;
                    self.pending.push(QueuedTask { task, seq });
                    CompleteAction::Requeued {
                        key,
                        attempt,
                        next_run_at,
                        error: err.to_string(),
                    }
                } else {
                    CompleteAction::Done(TaskOutcome {
                        key: task.key,
                        state: TaskState::Failed,
                        attempt: task.attempt,
                        error: Some(err.to_string()),
                        completed_at: now,
                    })
                }
            }
        }
    }

    /// Cancel by key. Removes a pending instance and signals a running one;
    /// running tasks are only guaranteed eventual termination.
    pub fn cancel(&mut self, key: &str, now: DateTime<Utc>) -> CancelAction {
        if let Some(idx) = self.pending.iter().position(|q| q.task.key == key) {
            let queued = self.pending.swap_remove(idx);
            // A follower behind a running instance goes away too, but the
            // running instance itself still gets the stop request below.
            if let Some(token) = self.running.get(key) {
                token.cancel();
            }
            return CancelAction::PendingRemoved(TaskOutcome {
                key: queued.task.key,
                state: TaskState::Cancelled,
                attempt: queued.task.attempt,
                error: None,
                completed_at: now,
            });
        }
        if let Some(token) = self.running.get(key) {
            token.cancel();
            return CancelAction::RunningSignalled;
        }
        CancelAction::NotFound
    }

    pub fn depth(&self) -> usize {
        self.pending.len()
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    pub fn running_keys(&self) -> Vec<String> {
        self.running.keys().cloned().collect()
    }

    pub fn is_key_running(&self, key: &str) -> bool {
        self.running.contains_key(key)
    }

    /// Pending tasks, cloned, for snapshot persistence and inspection.
    pub fn pending_tasks(&self) -> Vec<Task> {
        self.pending.iter().map(|q| q.task.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::queue::task::TaskPriority;

    fn policy() -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_millis(100),
            max: Duration::from_secs(10),
            jitter: Duration::ZERO,
        }
    }

    #[test]
    fn submit_and_dequeue_fifo_within_priority() {
        let mut store = TaskStore::new();
        store.submit(Task::new("a", "noop"));
        store.submit(Task::new("b", "noop"));

        let now = Utc::now();
        let (first, _) = store.next_eligible(now).unwrap();
        assert_eq!(first.key, "a");
        let (second, _) = store.next_eligible(now).unwrap();
        assert_eq!(second.key, "b");
        assert!(store.next_eligible(now).is_none());
    }

    #[test]
    fn higher_priority_dequeues_first() {
        let mut store = TaskStore::new();
        store.submit(Task::new("low", "noop").with_priority(TaskPriority::Low));
        store.submit(Task::new("crit", "noop").with_priority(TaskPriority::Critical));
        store.submit(Task::new("norm", "noop"));

        let now = Utc::now();
        assert_eq!(store.next_eligible(now).unwrap().0.key, "crit");
        assert_eq!(store.next_eligible(now).unwrap().0.key, "norm");
        assert_eq!(store.next_eligible(now).unwrap().0.key, "low");
    }

    #[test]
    fn ineligible_high_priority_does_not_block_eligible_low() {
        let mut store = TaskStore::new();
        store.submit(
            Task::new("later", "noop")
                .with_priority(TaskPriority::Critical)
                .run_after(Duration::from_secs(60)),
        );
        store.submit(Task::new("now", "noop").with_priority(TaskPriority::Low));

        let (task, _) = store.next_eligible(Utc::now()).unwrap();
        assert_eq!(task.key, "now");
        // the future task stays queued
        assert_eq!(store.depth(), 1);
    }

    #[test]
    fn pending_resubmit_replaces_payload_keeps_position() {
        let mut store = TaskStore::new();
        store.submit(Task::new("a", "noop").with_payload(serde_json::json!(1)));
        store.submit(Task::new("b", "noop"));
        // replacement does not push "a" behind "b"
        let result = store.submit(Task::new("a", "noop").with_payload(serde_json::json!(2)));
        assert!(result.is_accepted());
        assert_eq!(store.depth(), 2);

        let (task, _) = store.next_eligible(Utc::now()).unwrap();
        assert_eq!(task.key, "a");
        assert_eq!(task.payload, serde_json::json!(2));
    }

    #[test]
    fn pending_resubmit_with_higher_priority_repositions() {
        let mut store = TaskStore::new();
        store.submit(Task::new("a", "noop"));
        store.submit(Task::new("b", "noop").with_priority(TaskPriority::High));
        store.submit(Task::new("a", "noop").with_priority(TaskPriority::Critical));

        let (task, _) = store.next_eligible(Utc::now()).unwrap();
        assert_eq!(task.key, "a");
        assert_eq!(task.priority, TaskPriority::Critical);
    }

    #[test]
    fn running_key_blocks_follower_not_others() {
        let mut store = TaskStore::new();
        store.submit(Task::new("a", "noop"));
        // Construct follower and "b" up front so their `next_run_at`
        // (stamped at construction) precedes the `now` captured below.
        let follower = Task::new("a", "noop");
        let b = Task::new("b", "noop");
        let now = Utc::now();
        let (running, _) = store.next_eligible(now).unwrap();
        assert_eq!(running.key, "a");

        // follower queues behind the running instance
        assert!(store.submit(follower).is_accepted());
        assert!(store.next_eligible(now).is_none());

        // an unrelated key is still served
        store.submit(b);
        assert_eq!(store.next_eligible(now).unwrap().0.key, "b");
    }

    #[test]
    fn second_follower_rejected_while_running() {
        let mut store = TaskStore::new();
        store.submit(Task::new("a", "noop"));
        let _ = store.next_eligible(Utc::now()).unwrap();
        assert!(store.submit(Task::new("a", "noop")).is_accepted());
        assert_eq!(
            store.submit(Task::new("a", "noop")),
            SubmitResult::Rejected(RejectReason::DuplicateRunning)
        );
    }

    #[test]
    fn follower_runs_after_completion() {
        let mut store = TaskStore::new();
        store.submit(Task::new("a", "noop"));
        // Construct the follower before capturing `now` so its
        // construction-time `next_run_at` precedes `now`.
        let follower = Task::new("a", "noop");
        let now = Utc::now();
        let (task, _) = store.next_eligible(now).unwrap();
        store.submit(follower);

        let action = store.complete(task, Ok(()), false, &policy(), now);
        assert!(matches!(action, CompleteAction::Done(ref o) if o.state == TaskState::Succeeded));

        let (follower, _) = store.next_eligible(now).unwrap();
        assert_eq!(follower.key, "a");
    }

    #[test]
    fn failure_requeues_with_backoff_until_exhausted() {
        let mut store = TaskStore::new();
        store.submit(Task::new("a", "noop").with_max_attempts(2));
        let now = Utc::now();

        let (task, _) = store.next_eligible(now).unwrap();
        let action = store.complete(task, Err(TaskError::new("boom")), false, &policy(), now);
        match action {
            CompleteAction::Requeued {
                attempt,
                next_run_at,
                ..
            } => {
                assert_eq!(attempt, 1);
                assert!(next_run_at > now);
            }
            other => panic!("expected requeue, got {other:?}"),
        }

        // second failure exhausts the task
        let later = now + chrono::TimeDelta::seconds(30);
        let (task, _) = store.next_eligible(later).unwrap();
        let action = store.complete(task, Err(TaskError::new("boom")), false, &policy(), later);
        match action {
            CompleteAction::Done(outcome) => {
                assert_eq!(outcome.state, TaskState::Failed);
                assert_eq!(outcome.attempt, 2);
                assert_eq!(outcome.error.as_deref(), Some("boom"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(store.depth(), 0);
    }

    #[test]
    fn cancel_pending_removes() {
        let mut store = TaskStore::new();
        store.submit(Task::new("a", "noop"));
        let action = store.cancel("a", Utc::now());
        assert!(matches!(action, CancelAction::PendingRemoved(_)));
        assert_eq!(store.depth(), 0);
    }

    #[test]
    fn cancel_running_signals_token() {
        let mut store = TaskStore::new();
        store.submit(Task::new("a", "noop"));
        let (_, token) = store.next_eligible(Utc::now()).unwrap();
        assert!(!token.is_cancelled());
        let action = store.cancel("a", Utc::now());
        assert!(matches!(action, CancelAction::RunningSignalled));
        assert!(token.is_cancelled());
    }

    #[test]
    fn cancel_unknown_key() {
        let mut store = TaskStore::new();
        assert!(matches!(
            store.cancel("ghost", Utc::now()),
            CancelAction::NotFound
        ));
    }

    #[test]
    fn earliest_wakeup_skips_blocked_followers() {
        let mut store = TaskStore::new();
        store.submit(Task::new("a", "noop"));
        let _ = store.next_eligible(Utc::now()).unwrap();
        // follower is pending but blocked; no wakeup time from it
        store.submit(Task::new("a", "noop"));
        assert!(store.earliest_wakeup().is_none());

        store.submit(Task::new("b", "noop").run_after(Duration::from_secs(5)));
        assert!(store.earliest_wakeup().is_some());
    }
}
