use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Tokens signalling the two stages of daemon shutdown.
///
/// The first SIGTERM/SIGINT cancels `graceful`: the scheduler stops firing
/// and in-flight tasks get the configured drain window. A second signal
/// cancels `forced`, abandoning whatever is still running so the process can
/// exit immediately. The daemon's exit status reflects which path was taken.
#[derive(Clone)]
pub struct ShutdownSignal {
    pub graceful: CancellationToken,
    pub forced: CancellationToken,
}

impl ShutdownSignal {
    /// A signal pair not wired to any OS signal, for tests and embedding.
    pub fn disconnected() -> Self {
        Self {
            graceful: CancellationToken::new(),
            forced: CancellationToken::new(),
        }
    }
}

/// Install a shutdown handler that listens for SIGTERM and SIGINT.
///
/// All subsystems should monitor the returned tokens and drain gracefully.
pub fn install_shutdown_handler() -> ShutdownSignal {
    let signal_pair = ShutdownSignal::disconnected();
    let pair = signal_pair.clone();

    tokio::spawn(async move {
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, initiating graceful shutdown");
            }
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT, initiating graceful shutdown");
            }
        }
        pair.graceful.cancel();

        tokio::select! {
            _ = sigterm.recv() => {
                tracing::warn!("Received second SIGTERM, forcing shutdown");
            }
            _ = sigint.recv() => {
                tracing::warn!("Received second SIGINT, forcing shutdown");
            }
        }
        pair.forced.cancel();
    });

    signal_pair
}
