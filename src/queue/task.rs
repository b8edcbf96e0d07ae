use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Task priority, highest first when draining the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Low,
    Normal,
    High,
    Critical,
}

impl std::fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskPriority::Low => write!(f, "low"),
            TaskPriority::Normal => write!(f, "normal"),
            TaskPriority::High => write!(f, "high"),
            TaskPriority::Critical => write!(f, "critical"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskState::Pending => write!(f, "pending"),
            TaskState::Running => write!(f, "running"),
            TaskState::Succeeded => write!(f, "succeeded"),
            TaskState::Failed => write!(f, "failed"),
            TaskState::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A unit of work. The queue never looks inside `payload`; `kind` selects the
/// registered handler that does.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub key: String,
    pub kind: String,
    pub priority: TaskPriority,
    pub payload: Value,
    pub attempt: u32,
    pub max_attempts: u32,
    pub next_run_at: DateTime<Utc>,
    pub state: TaskState,
}

impl Task {
    pub fn new(key: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            kind: kind.into(),
            priority: TaskPriority::Normal,
            payload: Value::Null,
            attempt: 0,
            max_attempts: 3,
            next_run_at: Utc::now(),
            state: TaskState::Pending,
        }
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn run_after(mut self, delay: Duration) -> Self {
        self.next_run_at = Utc::now() + to_delta(delay);
        self
    }
}

/// Failure reported by a task handler. All handler failures are retryable
/// until the task's attempts are exhausted.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct TaskError(pub String);

impl TaskError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Terminal (or retry, see [`TaskState::Pending`]) result of one execution
/// attempt, surfaced on the queue's outcome channel.
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub key: String,
    pub state: TaskState,
    pub attempt: u32,
    pub error: Option<String>,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// The key already has a running instance and a queued follower.
    DuplicateRunning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitResult {
    Accepted,
    Rejected(RejectReason),
}

impl SubmitResult {
    pub fn is_accepted(&self) -> bool {
        matches!(self, SubmitResult::Accepted)
    }
}

/// Retry backoff parameters.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    pub jitter: Duration,
}

impl BackoffPolicy {
    /// `base * 2^attempt`, capped at `max`. Deterministic; jitter is applied
    /// separately so the curve itself stays testable.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.min(32);
        let millis = (self.base.as_millis() as u64).saturating_mul(factor);
        Duration::from_millis(millis).min(self.max)
    }

    /// Delay for `attempt` plus a random jitter in `[0, jitter]`, breaking up
    /// synchronized retry storms across agents.
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let delay = self.delay(attempt);
        if self.jitter.is_zero() {
            return delay;
        }
        let extra = rand::thread_rng().gen_range(0..=self.jitter.as_millis() as u64);
        delay + Duration::from_millis(extra)
    }
}

/// Lossless-enough conversion for queue arithmetic; delays far beyond the
/// representable range saturate.
pub(crate) fn to_delta(d: Duration) -> TimeDelta {
    TimeDelta::from_std(d).unwrap_or(TimeDelta::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_defaults() {
        let task = Task::new("scan-001", "capture.sweep");
        assert_eq!(task.priority, TaskPriority::Normal);
        assert_eq!(task.state, TaskState::Pending);
        assert_eq!(task.attempt, 0);
        assert_eq!(task.max_attempts, 3);
        assert!(task.next_run_at <= Utc::now());
    }

    #[test]
    fn priority_ordering() {
        assert!(TaskPriority::Critical > TaskPriority::High);
        assert!(TaskPriority::High > TaskPriority::Normal);
        assert!(TaskPriority::Normal > TaskPriority::Low);
    }

    #[test]
    fn backoff_curve_doubles_until_cap() {
        let policy = BackoffPolicy {
            base: Duration::from_millis(100),
            max: Duration::from_secs(2),
            jitter: Duration::ZERO,
        };
        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(1), Duration::from_millis(200));
        assert_eq!(policy.delay(2), Duration::from_millis(400));
        assert_eq!(policy.delay(3), Duration::from_millis(800));
        assert_eq!(policy.delay(4), Duration::from_millis(1600));
        // capped from here on
        assert_eq!(policy.delay(5), Duration::from_secs(2));
        assert_eq!(policy.delay(20), Duration::from_secs(2));
    }

    #[test]
    fn backoff_monotonic_non_decreasing() {
        let policy = BackoffPolicy {
            base: Duration::from_millis(50),
            max: Duration::from_secs(30),
            jitter: Duration::ZERO,
        };
        let mut last = Duration::ZERO;
        for attempt in 0..40 {
            let d = policy.delay(attempt);
            assert!(d >= last, "delay regressed at attempt {attempt}");
            last = d;
        }
    }

    #[test]
    fn jittered_delay_bounded() {
        let policy = BackoffPolicy {
            base: Duration::from_millis(100),
            max: Duration::from_secs(10),
            jitter: Duration::from_millis(50),
        };
        for _ in 0..100 {
            let d = policy.jittered_delay(1);
            assert!(d >= Duration::from_millis(200));
            assert!(d <= Duration::from_millis(250));
        }
    }

    #[test]
    fn task_serde_round_trip() {
        let task = Task::new("export-7", "export.observations")
            .with_priority(TaskPriority::High)
            .with_payload(serde_json::json!({"batch": 7}))
            .with_max_attempts(5);
        let json = serde_json::to_string(&task).unwrap();
        let back: Task = serde_json::from_str(&json).unwrap();
        assert_eq!(back.key, "export-7");
        assert_eq!(back.priority, TaskPriority::High);
        assert_eq!(back.payload["batch"], 7);
        assert_eq!(back.max_attempts, 5);
    }
}
