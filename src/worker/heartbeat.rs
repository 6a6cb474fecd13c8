use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::store::BuildStore;

/// Keeps a running build's `updated_at` fresh so stale builds are detectable.
pub struct Heartbeat {
    interval: Duration,
}

impl Heartbeat {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    /// Touch `build_id` every interval until `stop` fires.
    pub async fn run(&self, store: Arc<dyn BuildStore>, build_id: String, stop: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = store.touch_build(&build_id).await {
                        tracing::warn!(build_id = %build_id, error = %e, "Heartbeat failed");
                    }
                }
            }
        }
    }
}
