use std::net::SocketAddr;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SkysweepError {
    #[error("failed to bind discovery socket on {addr}: {source}")]
    DiscoveryBind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("scheduler is {state}, expected {expected}")]
    SchedulerState {
        state: &'static str,
        expected: &'static str,
    },

    #[error("snapshot I/O error: {0}")]
    SnapshotIo(#[from] std::io::Error),

    #[error("snapshot encoding error: {0}")]
    SnapshotCodec(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, SkysweepError>;
