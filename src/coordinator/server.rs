use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use super::Coordinator;

/// Accept worker connections until `shutdown`, one task per connection.
pub async fn serve_workers(
    listener: TcpListener,
    coordinator: Arc<Coordinator>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        tracing::debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
                    }
                    let coordinator = coordinator.clone();
                    tokio::spawn(async move {
                        if let Err(e) = coordinator.connect(stream).await {
                            tracing::warn!(peer = %peer, error = %e, "Worker connection ended with error");
                        }
                    });
                }
                Err(e) => tracing::warn!(error = %e, "Failed to accept worker connection"),
            },
        }
    }
}
