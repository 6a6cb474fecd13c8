//! Coordinator side of the build protocol: worker connections, broadcast
//! dispatch, and routing of worker events into the log fan-out and event bus.

pub mod registry;
pub mod scheduler;
pub mod server;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use kiln_common::{CoordinatorMessage, SettleReason, WorkerMessage};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Notify, mpsc};
use tokio_util::codec::{Framed, LinesCodec};

use crate::bus::{Event, EventBus};
use crate::logstream::LogStreamService;
use crate::store::BuildStore;
use registry::ConnectionRegistry;

/// Longest accepted JSON line on a worker connection.
pub const MAX_FRAME_LENGTH: usize = 8 * 1024 * 1024;

/// How long a new connection may take to send its handshake.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Coordinator {
    registry: ConnectionRegistry,
    logs: Arc<LogStreamService>,
    bus: EventBus,
    store: Arc<dyn BuildStore>,
    idle: Notify,
    settled: Notify,
    dispatch: Notify,
    queue_size: usize,
}

impl Coordinator {
    pub fn new(
        store: Arc<dyn BuildStore>,
        logs: Arc<LogStreamService>,
        bus: EventBus,
        queue_size: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry: ConnectionRegistry::new(),
            logs,
            bus,
            store,
            idle: Notify::new(),
            settled: Notify::new(),
            dispatch: Notify::new(),
            queue_size: queue_size.max(1),
        })
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn logs(&self) -> &Arc<LogStreamService> {
        &self.logs
    }

    /// Serve one worker connection until it closes or fails.
    ///
    /// The first frame must be the worker's `Connected` handshake.
    pub async fn connect<S>(&self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.connect_within(stream, HANDSHAKE_TIMEOUT).await
    }

    /// [`Coordinator::connect`] with an explicit handshake deadline.
    pub async fn connect_within<S>(&self, stream: S, handshake_timeout: Duration) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_FRAME_LENGTH));
        let first = tokio::time::timeout(handshake_timeout, framed.next())
            .await
            .map_err(|_| anyhow::anyhow!("No handshake within {:?}", handshake_timeout))?
            .context("Worker disconnected before handshake")?
            .context("Failed to read handshake")?;
        let worker_id = match serde_json::from_str::<WorkerMessage>(&first) {
            Ok(WorkerMessage::Connected { worker_id }) => worker_id,
            Ok(other) => anyhow::bail!("Expected handshake, got {:?}", other),
            Err(e) => anyhow::bail!("Malformed handshake: {}", e),
        };

        let (tx, mut rx) = mpsc::channel(self.queue_size);
        let conn = self.registry.register(&worker_id, tx);
        tracing::info!(worker_id = %worker_id, workers = self.registry.len(), "Worker connected");
        self.idle.notify_one();

        let (mut sink, mut frames) = framed.split();
        let writer = async {
            while let Some(msg) = rx.recv().await {
                sink.send(serde_json::to_string(&msg)?).await?;
            }
            Ok::<(), anyhow::Error>(())
        };
        let reader = async {
            while let Some(frame) = frames.next().await {
                let line = frame?;
                match serde_json::from_str::<WorkerMessage>(&line) {
                    Ok(event) => self.handle_event(&worker_id, event).await,
                    Err(e) => {
                        tracing::warn!(worker_id = %worker_id, error = %e, "Ignoring malformed worker frame")
                    }
                }
            }
            Ok::<(), anyhow::Error>(())
        };
        let result = tokio::select! {
            r = writer => r,
            r = reader => r,
        };

        self.registry.unregister(conn.id);
        tracing::info!(worker_id = %worker_id, workers = self.registry.len(), "Worker disconnected");
        result
    }

    /// Offer `msg` to every connected worker. Returns how many accepted it.
    pub fn broadcast_builder(&self, msg: CoordinatorMessage) -> usize {
        self.registry.broadcast(&msg)
    }

    pub fn cancel_build(&self, build_id: &str) {
        let delivered = self.broadcast_builder(CoordinatorMessage::CancelBuild {
            build_id: build_id.to_string(),
        });
        tracing::info!(build_id = %build_id, delivered, "Cancel broadcast");
    }

    /// Ask the scheduler for a pass as soon as possible.
    pub fn request_dispatch(&self) {
        self.dispatch.notify_one();
    }

    /// Resolves once a worker may have become idle.
    pub async fn idle(&self) {
        self.idle.notified().await
    }

    /// Resolves after a build settled.
    pub async fn settled(&self) {
        self.settled.notified().await
    }

    pub async fn dispatch_requested(&self) {
        self.dispatch.notified().await
    }

    async fn handle_event(&self, worker_id: &str, event: WorkerMessage) {
        match event {
            WorkerMessage::Connected { .. } => {
                tracing::warn!(worker_id = %worker_id, "Duplicate handshake ignored");
            }
            WorkerMessage::BuildStarted {
                application_id,
                build_id,
            } => {
                tracing::info!(worker_id = %worker_id, build_id = %build_id, application_id = %application_id, "Build started");
                self.logs.start_build_log(&build_id);
            }
            WorkerMessage::BuildLog { build_id, chunk } => {
                self.logs.append_build_log(&build_id, &chunk);
            }
            WorkerMessage::BuildSettled {
                application_id,
                build_id,
                reason,
            } => {
                tracing::info!(worker_id = %worker_id, build_id = %build_id, reason = ?reason, "Build settled");
                self.idle.notify_one();
                self.settled.notify_one();
                self.logs.close_build_log(&build_id);

                if reason == SettleReason::Success {
                    let environment_id = self.environment_of(&application_id).await;
                    self.bus.publish(Event::BuildSucceeded {
                        environment_id,
                        build_id: build_id.clone(),
                    });
                }
                self.bus.publish(Event::BuildSettled {
                    application_id,
                    build_id,
                    reason,
                });
            }
        }
    }

    async fn environment_of(&self, application_id: &str) -> String {
        match self.store.get_application(application_id).await {
            Ok(Some(app)) => app.environment_id.unwrap_or_default(),
            Ok(None) => String::new(),
            Err(e) => {
                tracing::warn!(application_id = %application_id, error = %e, "Failed to look up environment");
                String::new()
            }
        }
    }
}
