use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

use skysweep::config::{AgentRole, AppConfig};
use skysweep::daemon::Daemon;
use skysweep::queue::snapshot::load_snapshot;
use skysweep::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "skysweep")]
#[command(version)]
#[command(about = "Field wireless-survey agent: capture, scheduling, fleet coordination")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the survey agent daemon
    Run(RunArgs),

    /// Queue snapshot utilities
    Snapshot {
        #[command(subcommand)]
        command: SnapshotCommands,
    },
}

#[derive(Debug, Clone, ValueEnum)]
enum RoleArg {
    Field,
    Mobile,
}

impl From<RoleArg> for AgentRole {
    fn from(role: RoleArg) -> Self {
        match role {
            RoleArg::Field => AgentRole::Field,
            RoleArg::Mobile => AgentRole::Mobile,
        }
    }
}

// =============================================================================
// Run Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct RunArgs {
    /// Unique identifier for this agent
    #[arg(long, default_value = "field-agent-1")]
    agent_id: String,

    /// Role this agent plays in the fleet
    #[arg(long, value_enum, default_value = "field")]
    role: RoleArg,

    /// UDP port for discovery announcements
    #[arg(long, default_value = "47700")]
    listen_port: u16,

    /// Broadcast destination for announcements
    #[arg(long, default_value = "255.255.255.255:47700")]
    broadcast: SocketAddr,

    /// Seconds between presence announcements
    #[arg(long, default_value = "10")]
    announce_interval_secs: u64,

    /// Seconds of silence before a peer is expired (default: 3x announce)
    #[arg(long)]
    silence_timeout_secs: Option<u64>,

    /// Advertised port of this agent's status surface
    #[arg(long, default_value = "8040")]
    status_port: u16,

    /// Worker tasks draining the queue
    #[arg(long, default_value = "2")]
    workers: usize,

    /// Replay capture frames from this file instead of hardware
    #[arg(long)]
    replay: Option<PathBuf>,

    /// Persist the task queue to this file across restarts
    #[arg(long)]
    snapshot: Option<PathBuf>,

    /// Seconds between capture sweeps
    #[arg(long, default_value = "30")]
    capture_interval_secs: u64,

    /// Seconds between self health checks
    #[arg(long, default_value = "10")]
    health_interval_secs: u64,

    /// Seconds between fleet poll cycles
    #[arg(long, default_value = "30")]
    poll_interval_secs: u64,

    /// Drain window for in-flight tasks on shutdown
    #[arg(long, default_value = "10")]
    graceful_timeout_secs: u64,

    /// Known device identifiers (comma-separated MAC addresses)
    #[arg(long, default_value = "")]
    allowlist: String,

    /// Debounce window for repeated frames, in milliseconds
    #[arg(long, default_value = "750")]
    debounce_ms: u64,

    /// Hard ceiling on tracked devices
    #[arg(long, default_value = "4096")]
    working_set_cap: usize,
}

// =============================================================================
// Snapshot Commands
// =============================================================================

#[derive(clap::Subcommand, Debug)]
enum SnapshotCommands {
    /// Print the contents of a persisted queue snapshot
    Show {
        /// Path to the snapshot file
        path: PathBuf,
    },
}

fn parse_allowlist(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.to_ascii_lowercase())
        .collect()
}

fn build_config(args: RunArgs) -> AppConfig {
    let mut config = AppConfig::new(args.agent_id, args.role.into());

    config.discovery.listen_port = args.listen_port;
    config.discovery.broadcast_addr = args.broadcast;
    config.discovery.announce_interval = Duration::from_secs(args.announce_interval_secs);
    config.discovery.silence_timeout = Duration::from_secs(
        args.silence_timeout_secs
            .unwrap_or(args.announce_interval_secs * 3),
    );
    config.discovery.status_port = args.status_port;

    config.queue.workers = args.workers;
    config.queue.snapshot_path = args.snapshot;

    config.engine.debounce = Duration::from_millis(args.debounce_ms);
    config.engine.working_set_cap = args.working_set_cap;

    config.cadence.capture_interval = Duration::from_secs(args.capture_interval_secs);
    config.cadence.health_interval = Duration::from_secs(args.health_interval_secs);
    config.cadence.poll_interval = Duration::from_secs(args.poll_interval_secs);
    config.scheduler.graceful_timeout = Duration::from_secs(args.graceful_timeout_secs);

    config.replay_path = args.replay;
    config.with_allowlist(parse_allowlist(&args.allowlist))
}

async fn run_agent(args: RunArgs) -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = build_config(args);
    let shutdown = install_shutdown_handler();

    match Daemon::new(config).run(shutdown).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => {
            // forced termination or abandoned tasks; let the service
            // manager see the difference
            ExitCode::from(1)
        }
        Err(err) => {
            tracing::error!(error = %err, "Agent failed to start");
            eprintln!("Error: {err}");
            ExitCode::from(2)
        }
    }
}

async fn show_snapshot(path: PathBuf) -> ExitCode {
    let snapshot = match load_snapshot(&path).await {
        Ok(snapshot) => snapshot,
        Err(err) => {
            eprintln!("Error: failed to read snapshot: {err}");
            return ExitCode::from(2);
        }
    };

    println!("Snapshot taken at {}", snapshot.saved_at);
    if snapshot.tasks.is_empty() {
        println!("No queued tasks.");
        return ExitCode::SUCCESS;
    }

    println!();
    println!(
        "{:<24} {:<10} {:<24} {:<8} NEXT RUN",
        "KEY", "PRIORITY", "KIND", "ATTEMPT"
    );
    println!("{}", "-".repeat(90));
    for task in &snapshot.tasks {
        println!(
            "{:<24} {:<10} {:<24} {:<8} {}",
            task.key,
            task.priority.to_string(),
            task.kind,
            format!("{}/{}", task.attempt, task.max_attempts),
            task.next_run_at
        );
    }
    println!();
    println!("{} task(s) queued", snapshot.tasks.len());
    ExitCode::SUCCESS
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    match args.command {
        Commands::Run(run_args) => run_agent(run_args).await,
        Commands::Snapshot { command } => match command {
            SnapshotCommands::Show { path } => show_snapshot(path).await,
        },
    }
}
