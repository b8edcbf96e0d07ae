use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Role a survey agent plays in the fleet.
///
/// Field agents are stationary installations; mobile agents ride along on a
/// vehicle and join/leave the network segment as they move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentRole {
    Field,
    Mobile,
}

impl std::fmt::Display for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentRole::Field => write!(f, "field"),
            AgentRole::Mobile => write!(f, "mobile"),
        }
    }
}

/// Configuration for peer discovery over UDP broadcast.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Port the announce listener binds to.
    pub listen_port: u16,
    /// Destination for announcement datagrams.
    pub broadcast_addr: SocketAddr,
    /// How often this agent announces itself.
    pub announce_interval: Duration,
    /// Peers silent for longer than this are expired from the registry.
    /// Should be a small multiple of `announce_interval`.
    pub silence_timeout: Duration,
    /// Port of this agent's status surface, advertised in announcements.
    pub status_port: u16,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            listen_port: 47700,
            // SAFETY: hardcoded valid address that will always parse
            broadcast_addr: "255.255.255.255:47700"
                .parse()
                .expect("default broadcast address is valid"),
            announce_interval: Duration::from_secs(10),
            silence_timeout: Duration::from_secs(30),
            status_port: 8040,
        }
    }
}

/// Configuration for the task queue and its worker pool.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Number of concurrent workers draining the queue.
    pub workers: usize,
    /// Per-task execution timeout. A timeout counts as a failed attempt.
    pub task_timeout: Duration,
    /// Base delay for exponential retry backoff.
    pub backoff_base: Duration,
    /// Upper bound on the backoff delay.
    pub backoff_max: Duration,
    /// Maximum random jitter added to each backoff delay.
    pub backoff_jitter: Duration,
    /// Where to persist the queue snapshot, if durability is wanted.
    pub snapshot_path: Option<PathBuf>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            task_timeout: Duration::from_secs(30),
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(60),
            backoff_jitter: Duration::from_millis(100),
            snapshot_path: None,
        }
    }
}

/// Configuration for the packet classification engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Frames from one identifier within this window merge into a single
    /// observation.
    pub debounce: Duration,
    /// Hard ceiling on tracked devices. Least-recently-seen entries are
    /// evicted beyond this point.
    pub working_set_cap: usize,
    /// Devices not seen for this long are aged out by the sweep task.
    pub inactivity_window: Duration,
    /// Best-signal improvement (dB) that produces a milestone delta.
    pub signal_milestone_db: i8,
    /// Signal spread (dB) beyond which a device is considered volatile.
    pub volatility_threshold_db: u8,
    /// Identifiers classified as Known.
    pub allowlist: HashSet<String>,
    /// Frames longer than this are dropped during validation.
    pub max_frame_len: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(750),
            working_set_cap: 4096,
            inactivity_window: Duration::from_secs(300),
            signal_milestone_db: 10,
            volatility_threshold_db: 40,
            allowlist: HashSet::new(),
            max_frame_len: 4096,
        }
    }
}

/// Configuration for health polling of peer agents.
#[derive(Debug, Clone)]
pub struct PollConfig {
    /// Per-call timeout for a single status fetch.
    pub timeout: Duration,
    /// Consecutive failed polls before an agent is flagged unreachable.
    pub max_failures: u32,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            max_failures: 3,
        }
    }
}

/// Configuration for the scheduler's tick loop and shutdown behavior.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Tick granularity. Must not exceed the smallest registered interval;
    /// the tick loop clamps itself down when a finer entry is registered.
    pub tick: Duration,
    /// How long in-flight tasks get to finish on graceful stop.
    pub graceful_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(50),
            graceful_timeout: Duration::from_secs(10),
        }
    }
}

/// Cadences for the recurring jobs the daemon registers at startup.
#[derive(Debug, Clone)]
pub struct CadenceConfig {
    /// Capture sweep cycle.
    pub capture_interval: Duration,
    /// Self health check.
    pub health_interval: Duration,
    /// Peer poll cycle.
    pub poll_interval: Duration,
    /// Working-set inactivity sweep.
    pub sweep_interval: Duration,
    /// Observation export to the storage collaborator.
    pub export_interval: Duration,
    /// Queue snapshot persistence.
    pub snapshot_interval: Duration,
}

impl Default for CadenceConfig {
    fn default() -> Self {
        Self {
            capture_interval: Duration::from_secs(30),
            health_interval: Duration::from_secs(10),
            poll_interval: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(60),
            export_interval: Duration::from_secs(60),
            snapshot_interval: Duration::from_secs(120),
        }
    }
}

/// Top-level daemon configuration, assembled by the CLI and handed to
/// [`crate::daemon::Daemon`]. No global state; every component receives the
/// slice of this it needs at construction time.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub agent_id: String,
    pub role: AgentRole,
    /// Replay file used as the frame source when no hardware capture
    /// collaborator is wired in.
    pub replay_path: Option<PathBuf>,
    pub discovery: DiscoveryConfig,
    pub queue: QueueConfig,
    pub engine: EngineConfig,
    pub poll: PollConfig,
    pub scheduler: SchedulerConfig,
    pub cadence: CadenceConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            agent_id: "field-agent-1".to_string(),
            role: AgentRole::Field,
            replay_path: None,
            discovery: DiscoveryConfig::default(),
            queue: QueueConfig::default(),
            engine: EngineConfig::default(),
            poll: PollConfig::default(),
            scheduler: SchedulerConfig::default(),
            cadence: CadenceConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn new(agent_id: impl Into<String>, role: AgentRole) -> Self {
        Self {
            agent_id: agent_id.into(),
            role,
            ..Default::default()
        }
    }

    pub fn with_allowlist(mut self, identifiers: impl IntoIterator<Item = String>) -> Self {
        self.engine.allowlist.extend(identifiers);
        self
    }
}
