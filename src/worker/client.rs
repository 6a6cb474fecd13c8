//! Worker side of the coordinator connection.

use std::collections::VecDeque;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use kiln_common::{CoordinatorMessage, WorkerMessage};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LinesCodec};
use tokio_util::sync::CancellationToken;

use super::BuilderWorker;
use crate::coordinator::MAX_FRAME_LENGTH;

/// Exponential reconnect delay.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(30))
    }
}

/// Keep a connection to the coordinator alive until `shutdown`.
///
/// Log chunks produced while disconnected are discarded. Lifecycle events
/// (`BuildStarted`, `BuildSettled`) are held and delivered, in order, on the
/// next connection.
pub async fn run(
    addr: String,
    worker_id: String,
    worker: BuilderWorker,
    mut events: mpsc::Receiver<WorkerMessage>,
    shutdown: CancellationToken,
) {
    let mut backoff = Backoff::default();
    let mut pending = VecDeque::new();
    loop {
        match TcpStream::connect(&addr).await {
            Ok(stream) => {
                tracing::info!(addr = %addr, "Connected to coordinator");
                backoff.reset();
                if let Err(e) =
                    serve_with_pending(stream, &worker_id, &worker, &mut events, &mut pending, &shutdown).await
                {
                    tracing::warn!(addr = %addr, error = %e, "Coordinator connection lost");
                }
            }
            Err(e) => {
                tracing::warn!(addr = %addr, error = %e, "Failed to connect to coordinator");
            }
        }
        if shutdown.is_cancelled() {
            return;
        }

        let delay = backoff.next_delay();
        tracing::debug!(delay_ms = delay.as_millis() as u64, "Reconnecting");
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => break,
                _ = shutdown.cancelled() => return,
                event = events.recv() => match event {
                    Some(event) => hold_while_disconnected(&mut pending, event),
                    None => return,
                },
            }
        }
    }
}

fn hold_while_disconnected(pending: &mut VecDeque<WorkerMessage>, event: WorkerMessage) {
    match event {
        WorkerMessage::BuildLog { build_id, .. } => {
            tracing::debug!(build_id = %build_id, "Dropping log chunk while disconnected");
        }
        event => {
            tracing::debug!(build_id = ?event.build_id(), "Holding event until reconnected");
            pending.push_back(event);
        }
    }
}

/// Drive one established connection: handshake, then pump both directions.
pub async fn serve<S>(
    stream: S,
    worker_id: &str,
    worker: &BuilderWorker,
    events: &mut mpsc::Receiver<WorkerMessage>,
    shutdown: &CancellationToken,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    serve_with_pending(stream, worker_id, worker, events, &mut VecDeque::new(), shutdown).await
}

/// [`serve`], first flushing events held from a previous connection.
/// Lifecycle events that could not be written go back into `pending`.
async fn serve_with_pending<S>(
    stream: S,
    worker_id: &str,
    worker: &BuilderWorker,
    events: &mut mpsc::Receiver<WorkerMessage>,
    pending: &mut VecDeque<WorkerMessage>,
    shutdown: &CancellationToken,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_FRAME_LENGTH));
    let hello = WorkerMessage::Connected {
        worker_id: worker_id.to_string(),
    };
    framed
        .send(serde_json::to_string(&hello)?)
        .await
        .context("Failed to send handshake")?;

    while let Some(event) = pending.pop_front() {
        if let Err(e) = framed.send(serde_json::to_string(&event)?).await {
            pending.push_front(event);
            return Err(e).context("Failed to send held event");
        }
    }

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            event = events.recv() => {
                let Some(event) = event else { return Ok(()) };
                let line = serde_json::to_string(&event)?;
                if let Err(e) = framed.send(line).await {
                    hold_while_disconnected(pending, event);
                    return Err(e).context("Failed to send event");
                }
            }
            frame = framed.next() => {
                let line = match frame {
                    Some(line) => line.context("Failed to read frame")?,
                    None => anyhow::bail!("Coordinator closed the connection"),
                };
                match serde_json::from_str::<CoordinatorMessage>(&line) {
                    Ok(msg) => {
                        // Cancels wait for the build to unwind; keep reading meanwhile.
                        let worker = worker.clone();
                        tokio::spawn(async move { worker.on_request(msg).await });
                    }
                    Err(e) => tracing::warn!(error = %e, "Ignoring malformed coordinator frame"),
                }
            }
        }
    }
}
