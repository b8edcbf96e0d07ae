use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::packet::EngineStats;
use crate::queue::{QueueStats, TaskQueue};

/// One metric reading from one agent's self-check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSample {
    pub agent_id: String,
    pub metric: String,
    pub value: f64,
    pub collected_at: DateTime<Utc>,
}

/// Gathers this agent's own metrics on the scheduled self-check cadence.
///
/// The samples feed the local coordinator's evaluation directly, so a lone
/// agent alerts on itself without any network round trip; the same numbers
/// back the status surface the rest of the fleet polls.
pub struct HealthMonitor {
    agent_id: String,
    queue: TaskQueue,
    queue_stats: Arc<QueueStats>,
    engine_stats: Arc<EngineStats>,
    started_at: Instant,
}

impl HealthMonitor {
    pub fn new(agent_id: String, queue: TaskQueue, engine_stats: Arc<EngineStats>) -> Self {
        let queue_stats = queue.stats();
        Self {
            agent_id,
            queue,
            queue_stats,
            engine_stats,
            started_at: Instant::now(),
        }
    }

    pub async fn sample(&self) -> Vec<HealthSample> {
        let collected_at = Utc::now();
        let mut samples = Vec::new();
        let mut push = |metric: &str, value: f64| {
            samples.push(HealthSample {
                agent_id: self.agent_id.clone(),
                metric: metric.to_string(),
                value,
                collected_at,
            });
        };

        push("queue.depth", self.queue.depth().await as f64);
        push("queue.running", self.queue.running_count().await as f64);
        push(
            "queue.failed_total",
            self.queue_stats.failed.load(Ordering::Relaxed) as f64,
        );
        push(
            "queue.retries_total",
            self.queue_stats.retries.load(Ordering::Relaxed) as f64,
        );
        push(
            "engine.frames_dropped_total",
            self.engine_stats.frames_dropped.load(Ordering::Relaxed) as f64,
        );
        push(
            "engine.devices_tracked",
            self.engine_stats.devices.load(Ordering::Relaxed) as f64,
        );
        push(
            "engine.evictions_total",
            self.engine_stats.evictions.load(Ordering::Relaxed) as f64,
        );
        push("uptime_seconds", self.started_at.elapsed().as_secs_f64());

        samples
    }
}
