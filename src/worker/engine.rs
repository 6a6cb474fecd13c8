use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::log_writer::BuildLogWriter;
use crate::errors::PipelineError;

/// One checked-out build context ready for the engine.
#[derive(Debug, Clone, Copy)]
pub struct BuildRequest<'a> {
    pub build_id: &'a str,
    pub context: &'a Path,
    /// Relative to `context`.
    pub dockerfile: &'a str,
}

/// Container build backend.
///
/// Implementations stream progress into `log` and must return
/// [`PipelineError::Canceled`] promptly once `cancel` fires.
#[async_trait]
pub trait BuildEngine: Send + Sync {
    /// Build `image_ref` and push it to the registry.
    async fn build_image(
        &self,
        request: BuildRequest<'_>,
        image_ref: &str,
        log: &mut BuildLogWriter,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError>;

    /// Build, then export `artifact_path` from the image as a tar stream
    /// into `dest`. Nothing is pushed.
    async fn build_static(
        &self,
        request: BuildRequest<'_>,
        artifact_path: &str,
        dest: &Path,
        log: &mut BuildLogWriter,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError>;

    async fn prune_cache(&self) -> anyhow::Result<()>;
}

/// Prune the engine's build cache every `interval` until `shutdown`.
pub async fn run_prune_loop(
    engine: Arc<dyn BuildEngine>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    // First tick is immediate.
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                match engine.prune_cache().await {
                    Ok(()) => tracing::info!("Pruned build cache"),
                    Err(e) => tracing::warn!(error = %e, "Failed to prune build cache"),
                }
            }
        }
    }
}
