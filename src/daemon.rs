use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::coordinator::{
    AgentRegistry, AlertRule, Coordinator, DiscoveryService, HealthPoller, HttpStatusProbe,
    LogAlertSink, Severity, StatusProbe,
};
use crate::error::{Result, SkysweepError};
use crate::health::HealthMonitor;
use crate::packet::{
    FrameSource, IngestOutcome, ObservationDelta, PacketEngine, ReplayFileSource,
};
use crate::queue::snapshot::{restore_snapshot, save_snapshot};
use crate::queue::{handler_fn, Task, TaskError, TaskPriority, TaskQueue, TaskState};
use crate::scheduler::{ScheduleEntry, Scheduler, StopReport};
use crate::shutdown::ShutdownSignal;

/// Messages into the engine's single consuming loop. Frame order from one
/// source is preserved by the channel.
enum EngineCommand {
    Frame(Vec<u8>),
    SweepInactive,
}

const ENGINE_CHANNEL_CAPACITY: usize = 1024;
const REPLAY_BATCH: usize = 256;

/// The assembled agent: packet engine, task queue, scheduler, and
/// coordinator wired together with explicit construction and teardown
/// ordering. No global state; everything lives here.
pub struct Daemon {
    config: AppConfig,
}

impl Daemon {
    pub fn new(config: AppConfig) -> Self {
        Self { config }
    }

    /// Run until a shutdown signal arrives.
    ///
    /// Returns `Ok(true)` for a clean drain, `Ok(false)` when tasks were
    /// abandoned or the stop was forced. Startup failures (an unbindable
    /// discovery socket, an unreadable replay file) are returned as errors
    /// before the agent ever reports itself running.
    pub async fn run(self, shutdown: ShutdownSignal) -> Result<bool> {
        let config = self.config;
        tracing::info!(
            agent_id = %config.agent_id,
            role = %config.role,
            "Starting skysweep agent"
        );

        // packet engine and task queue come up first, then the scheduler
        // that feeds them, then the coordinator
        let (queue, mut outcomes) = TaskQueue::new(&config.queue);
        let mut engine = PacketEngine::new(config.engine.clone());
        let engine_stats = engine.stats();
        let (engine_tx, mut engine_rx) = mpsc::channel::<EngineCommand>(ENGINE_CHANNEL_CAPACITY);
        let deltas: Arc<Mutex<Vec<ObservationDelta>>> = Arc::new(Mutex::new(Vec::new()));

        let registry = Arc::new(AgentRegistry::new(config.discovery.silence_timeout));
        let discovery = DiscoveryService::bind(
            config.discovery.clone(),
            config.agent_id.clone(),
            config.role,
            Arc::clone(&registry),
        )
        .await?;

        let probe: Arc<dyn StatusProbe> = Arc::new(HttpStatusProbe::new());
        let coordinator = Arc::new(Coordinator::new(
            Arc::clone(&registry),
            HealthPoller::new(probe, &config.poll),
            alert_rules(&config),
            Arc::new(LogAlertSink),
        ));
        let monitor = Arc::new(HealthMonitor::new(
            config.agent_id.clone(),
            queue.clone(),
            Arc::clone(&engine_stats),
        ));

        let source: Option<Arc<dyn FrameSource>> = match &config.replay_path {
            Some(path) => {
                let replay = ReplayFileSource::open(path, REPLAY_BATCH)
                    .await
                    .map_err(|err| SkysweepError::Internal(err.to_string()))?;
                Some(Arc::new(replay))
            }
            None => None,
        };

        if let Some(path) = &config.queue.snapshot_path {
            if tokio::fs::try_exists(path).await.unwrap_or(false) {
                match restore_snapshot(&queue, path).await {
                    Ok(count) => {
                        tracing::info!(count, "Restored queued tasks from snapshot");
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "Snapshot restore failed, starting empty");
                    }
                }
            }
        }

        register_handlers(
            &queue,
            source,
            engine_tx.clone(),
            Arc::clone(&deltas),
            Arc::clone(&coordinator),
            Arc::clone(&monitor),
            &config,
        )
        .await;

        // background loops: engine consumer, discovery, outcome drain
        let internal = CancellationToken::new();

        let engine_token = internal.clone();
        let engine_deltas = Arc::clone(&deltas);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    cmd = engine_rx.recv() => match cmd {
                        Some(EngineCommand::Frame(frame)) => {
                            if let IngestOutcome::Delta(delta) = engine.ingest(&frame) {
                                tracing::debug!(delta = ?delta, "Observation delta");
                                engine_deltas.lock().await.push(delta);
                            }
                        }
                        Some(EngineCommand::SweepInactive) => {
                            engine.sweep_inactive(Utc::now());
                        }
                        None => break,
                    },
                    _ = engine_token.cancelled() => break,
                }
            }
            tracing::debug!("Engine loop stopped");
        });

        tokio::spawn(discovery.run(internal.child_token()));

        let outcome_token = internal.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    outcome = outcomes.recv() => match outcome {
                        Some(outcome) if outcome.state == TaskState::Failed => {
                            tracing::warn!(
                                key = %outcome.key,
                                attempts = outcome.attempt,
                                error = outcome.error.as_deref().unwrap_or(""),
                                "Task exhausted its retries"
                            );
                        }
                        Some(outcome) => {
                            tracing::debug!(key = %outcome.key, state = %outcome.state, "Task finished");
                        }
                        None => break,
                    },
                    _ = outcome_token.cancelled() => break,
                }
            }
        });

        let scheduler = Scheduler::new(queue.clone(), config.scheduler.clone(), config.queue.workers);
        register_entries(&scheduler, &config).await;
        scheduler.start().await?;
        tracing::info!("Agent running");

        tokio::select! {
            _ = shutdown.graceful.cancelled() => {}
            _ = shutdown.forced.cancelled() => {}
        }

        let report = tokio::select! {
            report = scheduler.stop(config.scheduler.graceful_timeout) => report,
            _ = shutdown.forced.cancelled() => {
                tracing::warn!("Forced shutdown, abandoning drain");
                StopReport::default()
            }
        };

        if let Some(path) = &config.queue.snapshot_path {
            if let Err(err) = save_snapshot(&queue, path).await {
                tracing::warn!(error = %err, "Final snapshot save failed");
            }
        }
        internal.cancel();

        let clean = report.graceful && !shutdown.forced.is_cancelled();
        if clean {
            tracing::info!("Shutdown complete");
        } else {
            tracing::warn!(abandoned = report.abandoned.len(), "Shutdown was not clean");
        }
        Ok(clean)
    }
}

/// Thresholds for the agent's self-check metrics, scaled to its configured
/// capacities.
fn alert_rules(config: &AppConfig) -> Vec<AlertRule> {
    let cap = config.engine.working_set_cap as f64;
    vec![
        AlertRule::upper("queue-backlog", "queue.depth", 500.0).with_hysteresis(50.0),
        AlertRule::upper("working-set-pressure", "engine.devices_tracked", cap * 0.9)
            .with_hysteresis(cap * 0.05)
            .with_severity(Severity::Warning),
    ]
}

#[allow(clippy::too_many_arguments)]
async fn register_handlers(
    queue: &TaskQueue,
    source: Option<Arc<dyn FrameSource>>,
    engine_tx: mpsc::Sender<EngineCommand>,
    deltas: Arc<Mutex<Vec<ObservationDelta>>>,
    coordinator: Arc<Coordinator>,
    monitor: Arc<HealthMonitor>,
    config: &AppConfig,
) {
    let sweep_tx = engine_tx.clone();
    queue
        .register_handler(
            "capture.sweep",
            handler_fn(move |_payload, _cancel| {
                let source = source.clone();
                let tx = engine_tx.clone();
                async move {
                    let Some(source) = source else {
                        tracing::trace!("No capture source configured, sweep is a no-op");
                        return Ok(());
                    };
                    let frames = source
                        .sweep()
                        .await
                        .map_err(|err| TaskError::new(err.to_string()))?;
                    let count = frames.len();
                    for frame in frames {
                        tx.send(EngineCommand::Frame(frame))
                            .await
                            .map_err(|_| TaskError::new("engine loop stopped"))?;
                    }
                    tracing::debug!(frames = count, "Capture sweep fed the engine");
                    Ok(())
                }
            }),
        )
        .await;

    queue
        .register_handler(
            "engine.sweep",
            handler_fn(move |_payload, _cancel| {
                let tx = sweep_tx.clone();
                async move {
                    tx.send(EngineCommand::SweepInactive)
                        .await
                        .map_err(|_| TaskError::new("engine loop stopped"))?;
                    Ok(())
                }
            }),
        )
        .await;

    let check_coordinator = Arc::clone(&coordinator);
    queue
        .register_handler(
            "health.check",
            handler_fn(move |_payload, _cancel| {
                let monitor = Arc::clone(&monitor);
                let coordinator = Arc::clone(&check_coordinator);
                async move {
                    let samples = monitor.sample().await;
                    coordinator.evaluate(&samples).await;
                    Ok(())
                }
            }),
        )
        .await;

    queue
        .register_handler(
            "fleet.poll",
            handler_fn(move |_payload, _cancel| {
                let coordinator = Arc::clone(&coordinator);
                async move {
                    coordinator.poll_cycle().await;
                    Ok(())
                }
            }),
        )
        .await;

    queue
        .register_handler(
            "export.observations",
            handler_fn(move |_payload, _cancel| {
                let deltas = Arc::clone(&deltas);
                async move {
                    let drained = std::mem::take(&mut *deltas.lock().await);
                    // the storage engine is an external collaborator; the
                    // export boundary is these structured records
                    for delta in &drained {
                        tracing::info!(delta = ?delta, "Observation exported");
                    }
                    if !drained.is_empty() {
                        tracing::debug!(count = drained.len(), "Export batch flushed");
                    }
                    Ok(())
                }
            }),
        )
        .await;

    let snapshot_path = config.queue.snapshot_path.clone();
    let snapshot_queue = queue.clone();
    queue
        .register_handler(
            "queue.snapshot",
            handler_fn(move |_payload, _cancel| {
                let path = snapshot_path.clone();
                let queue = snapshot_queue.clone();
                async move {
                    if let Some(path) = path {
                        save_snapshot(&queue, &path)
                            .await
                            .map_err(|err| TaskError::new(err.to_string()))?;
                    }
                    Ok(())
                }
            }),
        )
        .await;
}

async fn register_entries(scheduler: &Scheduler, config: &AppConfig) {
    let cadence = &config.cadence;

    scheduler
        .register(ScheduleEntry::new(
            "capture-sweep",
            cadence.capture_interval,
            || Task::new("capture-sweep", "capture.sweep").with_priority(TaskPriority::High),
        ))
        .await;
    scheduler
        .register(ScheduleEntry::new(
            "health-check",
            cadence.health_interval,
            || Task::new("health-check", "health.check"),
        ))
        .await;
    scheduler
        .register(ScheduleEntry::new("fleet-poll", cadence.poll_interval, || {
            Task::new("fleet-poll", "fleet.poll")
        }))
        .await;
    scheduler
        .register(ScheduleEntry::new(
            "working-set-sweep",
            cadence.sweep_interval,
            || Task::new("working-set-sweep", "engine.sweep").with_priority(TaskPriority::Low),
        ))
        .await;
    scheduler
        .register(ScheduleEntry::new(
            "export-observations",
            cadence.export_interval,
            || Task::new("export-observations", "export.observations").with_priority(TaskPriority::Low),
        ))
        .await;
    if config.queue.snapshot_path.is_some() {
        scheduler
            .register(ScheduleEntry::new(
                "queue-snapshot",
                cadence.snapshot_interval,
                || Task::new("queue-snapshot", "queue.snapshot").with_priority(TaskPriority::Low),
            ))
            .await;
    }
}
