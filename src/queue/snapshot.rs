use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::queue::task::{Task, TaskPriority, TaskState};
use crate::queue::worker::TaskQueue;

/// One persisted queue entry. Execution state is not preserved: everything
/// reloads as pending, which is exactly the retry semantics wanted after a
/// crash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotTask {
    pub key: String,
    pub kind: String,
    pub priority: TaskPriority,
    pub payload: Value,
    pub attempt: u32,
    pub max_attempts: u32,
    pub next_run_at: DateTime<Utc>,
}

impl SnapshotTask {
    pub fn from_task(task: &Task) -> Self {
        Self {
            key: task.key.clone(),
            kind: task.kind.clone(),
            priority: task.priority,
            payload: task.payload.clone(),
            attempt: task.attempt,
            max_attempts: task.max_attempts,
            next_run_at: task.next_run_at,
        }
    }

    pub fn into_task(self) -> Task {
        Task {
            key: self.key,
            kind: self.kind,
            priority: self.priority,
            payload: self.payload,
            attempt: self.attempt,
            max_attempts: self.max_attempts,
            next_run_at: self.next_run_at,
            state: TaskState::Pending,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub saved_at: DateTime<Utc>,
    pub tasks: Vec<SnapshotTask>,
}

/// Persist the queue's pending tasks to `path`. Running tasks are not
/// captured; if the process dies mid-task the scheduler re-fires the work on
/// the next cycle.
pub async fn save_snapshot(queue: &TaskQueue, path: &Path) -> Result<usize> {
    let tasks: Vec<SnapshotTask> = queue
        .pending_tasks()
        .await
        .iter()
        .map(SnapshotTask::from_task)
        .collect();
    let count = tasks.len();
    let snapshot = QueueSnapshot {
        saved_at: Utc::now(),
        tasks,
    };
    let bytes = serde_json::to_vec_pretty(&snapshot)?;
    tokio::fs::write(path, bytes).await?;
    tracing::debug!(path = %path.display(), count, "Queue snapshot saved");
    Ok(count)
}

pub async fn load_snapshot(path: &Path) -> Result<QueueSnapshot> {
    let bytes = tokio::fs::read(path).await?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Reload a snapshot into the queue. Returns how many tasks were accepted;
/// duplicates of already-queued keys fold into the existing entries.
pub async fn restore_snapshot(queue: &TaskQueue, path: &Path) -> Result<usize> {
    let snapshot = load_snapshot(path).await?;
    let mut restored = 0;
    for entry in snapshot.tasks {
        if queue.submit(entry.into_task()).await.is_accepted() {
            restored += 1;
        }
    }
    tracing::info!(path = %path.display(), restored, "Queue snapshot restored");
    Ok(restored)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::queue::task::TaskPriority;

    #[tokio::test]
    async fn snapshot_round_trip_is_lossless() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.json");

        let (queue, _rx) = TaskQueue::new(&QueueConfig::default());
        queue
            .submit(
                Task::new("export-1", "export.observations")
                    .with_priority(TaskPriority::High)
                    .with_payload(serde_json::json!({"batch": 1}))
                    .with_max_attempts(5),
            )
            .await;
        queue.submit(Task::new("sweep-1", "engine.sweep")).await;

        let saved = save_snapshot(&queue, &path).await.unwrap();
        assert_eq!(saved, 2);

        let snapshot = load_snapshot(&path).await.unwrap();
        assert_eq!(snapshot.tasks.len(), 2);
        let export = snapshot
            .tasks
            .iter()
            .find(|t| t.key == "export-1")
            .unwrap();
        assert_eq!(export.priority, TaskPriority::High);
        assert_eq!(export.payload["batch"], 1);
        assert_eq!(export.max_attempts, 5);
        assert_eq!(export.attempt, 0);

        let (fresh, _rx) = TaskQueue::new(&QueueConfig::default());
        let restored = restore_snapshot(&fresh, &path).await.unwrap();
        assert_eq!(restored, 2);
        assert_eq!(fresh.depth().await, 2);
    }

    #[tokio::test]
    async fn restore_missing_file_is_an_error() {
        let (queue, _rx) = TaskQueue::new(&QueueConfig::default());
        let result = restore_snapshot(&queue, Path::new("/nonexistent/queue.json")).await;
        assert!(result.is_err());
    }
}
