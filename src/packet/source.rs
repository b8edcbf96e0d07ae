use std::path::Path;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("capture source I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt replay file: {0}")]
    Corrupt(String),
}

/// Where raw capture frames come from. Hardware capture is an external
/// collaborator behind this seam; each sweep returns the frames observed
/// since the last one.
#[async_trait]
pub trait FrameSource: Send + Sync {
    async fn sweep(&self) -> Result<Vec<Vec<u8>>, SourceError>;
}

/// Replays frames from a file of `u16`-little-endian-length-prefixed
/// records. Used for bench runs and development without capture hardware.
pub struct ReplayFileSource {
    frames: Vec<Vec<u8>>,
    cursor: Mutex<usize>,
    batch: usize,
}

impl ReplayFileSource {
    pub async fn open(path: &Path, batch: usize) -> Result<Self, SourceError> {
        let bytes = tokio::fs::read(path).await?;
        let mut frames = Vec::new();
        let mut offset = 0;
        while offset + 2 <= bytes.len() {
            let len = u16::from_le_bytes([bytes[offset], bytes[offset + 1]]) as usize;
            offset += 2;
            if offset + len > bytes.len() {
                return Err(SourceError::Corrupt(format!(
                    "frame length {len} overruns file at offset {offset}"
                )));
            }
            frames.push(bytes[offset..offset + len].to_vec());
            offset += len;
        }
        if offset != bytes.len() {
            return Err(SourceError::Corrupt("trailing bytes after last frame".into()));
        }
        tracing::info!(path = %path.display(), frames = frames.len(), "Replay source loaded");
        Ok(Self {
            frames,
            cursor: Mutex::new(0),
            batch: batch.max(1),
        })
    }

    pub async fn remaining(&self) -> usize {
        let cursor = self.cursor.lock().await;
        self.frames.len().saturating_sub(*cursor)
    }
}

#[async_trait]
impl FrameSource for ReplayFileSource {
    async fn sweep(&self) -> Result<Vec<Vec<u8>>, SourceError> {
        let mut cursor = self.cursor.lock().await;
        let start = *cursor;
        let end = (start + self.batch).min(self.frames.len());
        *cursor = end;
        Ok(self.frames[start..end].to_vec())
    }
}
