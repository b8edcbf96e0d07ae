use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use rand::Rng;
use uuid::Uuid;

use crate::queue::Task;

/// Produces a fresh [`Task`] each time the entry fires.
pub type TaskFactory = Arc<dyn Fn() -> Task + Send + Sync>;

/// A recurring job registration.
///
/// Fire times are drawn as `previous + interval ± jitter`, so the gap
/// between consecutive scheduled fires always lies within
/// `[interval - jitter, interval + jitter]`.
#[derive(Clone)]
pub struct ScheduleEntry {
    pub id: Uuid,
    pub name: String,
    pub interval: Duration,
    pub jitter: Duration,
    pub enabled: bool,
    pub last_fired_at: Option<DateTime<Utc>>,
    pub(crate) next_due: Option<DateTime<Utc>>,
    factory: TaskFactory,
}

impl std::fmt::Debug for ScheduleEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduleEntry")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("interval", &self.interval)
            .field("jitter", &self.jitter)
            .field("enabled", &self.enabled)
            .field("last_fired_at", &self.last_fired_at)
            .finish()
    }
}

impl ScheduleEntry {
    /// Create an entry with the default jitter of `interval / 10`.
    pub fn new(
        name: impl Into<String>,
        interval: Duration,
        factory: impl Fn() -> Task + Send + Sync + 'static,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            interval,
            jitter: interval / 10,
            enabled: true,
            last_fired_at: None,
            next_due: None,
            factory: Arc::new(factory),
        }
    }

    /// Override the jitter, clamped to at most `interval / 10`.
    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter.min(self.interval / 10);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub(crate) fn make_task(&self) -> Task {
        (self.factory)()
    }

    /// Draw the next fire time from `from`: `from + interval + r`, with `r`
    /// uniform in `[-jitter, +jitter]`.
    pub(crate) fn draw_next_due(&self, from: DateTime<Utc>) -> DateTime<Utc> {
        let interval_ms = self.interval.as_millis() as i64;
        let jitter_ms = self.jitter.as_millis() as i64;
        let offset = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(-jitter_ms..=jitter_ms)
        };
        from + TimeDelta::milliseconds(interval_ms + offset)
    }
}
