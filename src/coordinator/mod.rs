pub mod alerts;
pub mod discovery;
pub mod poll;

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;

pub use alerts::{
    AlertEvent, AlertManager, AlertRule, AlertSink, AlertTransition, Bound, LogAlertSink, Severity,
};
pub use discovery::{
    AgentDescriptor, AgentRegistry, Announcement, DiscoveryService, PROTOCOL_VERSION,
};
pub use poll::{HealthPoller, HttpStatusProbe, PollOutcome, PollReport, ProbeError, StatusProbe};

use crate::health::HealthSample;

/// Fans health data from the fleet into threshold evaluation and forwards
/// alert transitions to the sink.
///
/// Discovery state lives in the shared [`AgentRegistry`], fed by the
/// [`DiscoveryService`] loop; this type owns polling and evaluation.
pub struct Coordinator {
    registry: Arc<AgentRegistry>,
    poller: HealthPoller,
    alerts: Mutex<AlertManager>,
    sink: Arc<dyn AlertSink>,
}

impl Coordinator {
    pub fn new(
        registry: Arc<AgentRegistry>,
        poller: HealthPoller,
        rules: Vec<AlertRule>,
        sink: Arc<dyn AlertSink>,
    ) -> Self {
        Self {
            registry,
            poller,
            alerts: Mutex::new(AlertManager::new(rules)),
            sink,
        }
    }

    /// Current set of live peers, after expiring the silent ones.
    pub async fn discover(&self) -> Vec<AgentDescriptor> {
        self.registry.expire_silent(Utc::now()).await;
        self.registry.active().await
    }

    /// Evaluate a sample batch and forward unsuppressed transitions to the
    /// alert sink. Exactly one open record and at most one resolve record
    /// reach the sink per alert event.
    pub async fn evaluate(&self, samples: &[HealthSample]) -> Vec<AlertTransition> {
        let transitions = self.alerts.lock().await.evaluate(samples, Utc::now());
        for transition in &transitions {
            if transition.event().suppressed {
                continue;
            }
            self.sink.notify(transition).await;
        }
        transitions
    }

    /// One full cycle: discover, poll everyone concurrently, evaluate what
    /// came back. Unreachable agents contribute no samples but are already
    /// logged by the poller.
    pub async fn poll_cycle(&self) -> Vec<AlertTransition> {
        let agents = self.discover().await;
        let reports = self.poller.poll_all(&agents).await;

        let mut samples = Vec::new();
        for report in reports {
            match report.outcome {
                PollOutcome::Samples(batch) => samples.extend(batch),
                PollOutcome::Failed { .. } => {}
            }
        }
        self.evaluate(&samples).await
    }

    pub async fn open_alert_count(&self) -> usize {
        self.alerts.lock().await.open_events().count()
    }
}
