use std::path::{Path, PathBuf};

use kiln_common::WorkerMessage;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

/// Tee for build output: the local temp file keeps everything, the
/// coordinator gets whatever fits in the event queue.
pub struct BuildLogWriter {
    build_id: String,
    path: PathBuf,
    file: File,
    events: mpsc::Sender<WorkerMessage>,
    dropped: u64,
}

impl BuildLogWriter {
    pub async fn create(
        build_id: &str,
        path: &Path,
        events: mpsc::Sender<WorkerMessage>,
    ) -> std::io::Result<Self> {
        let file = File::create(path).await?;
        Ok(Self {
            build_id: build_id.to_string(),
            path: path.to_path_buf(),
            file,
            events,
            dropped: 0,
        })
    }

    pub async fn write(&mut self, chunk: &str) -> std::io::Result<()> {
        if chunk.is_empty() {
            return Ok(());
        }
        self.file.write_all(chunk.as_bytes()).await?;
        let msg = WorkerMessage::BuildLog {
            build_id: self.build_id.clone(),
            chunk: chunk.to_string(),
        };
        if self.events.try_send(msg).is_err() {
            self.dropped += 1;
        }
        Ok(())
    }

    pub async fn line(&mut self, line: &str) -> std::io::Result<()> {
        self.write(&format!("{}\n", line)).await
    }

    /// Flush to disk. Returns the log file path for persistence.
    pub async fn finish(mut self) -> std::io::Result<PathBuf> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        if self.dropped > 0 {
            tracing::debug!(
                build_id = %self.build_id,
                dropped = self.dropped,
                "Log chunks not forwarded due to backpressure"
            );
        }
        Ok(self.path)
    }
}
