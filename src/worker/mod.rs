//! Builder worker: accepts at most one build at a time, runs it, reports back.

pub mod client;
pub mod docker;
pub mod dockerfile;
pub mod engine;
pub mod heartbeat;
pub mod log_writer;
pub mod pipeline;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use kiln_common::{
    BuildStatus, CoordinatorMessage, Repository, SettleReason, Task, WorkerMessage,
};
use tokio::sync::{Mutex, mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::errors::{StoreError, WorkerError};
use heartbeat::Heartbeat;
use log_writer::BuildLogWriter;
pub use pipeline::PipelineDeps;

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub work_dir: PathBuf,
    pub heartbeat_interval: Duration,
}

/// What the worker is doing right now.
enum Slot {
    Idle,
    Building {
        build_id: String,
        cancel: CancellationToken,
        /// Flips to `true` once the unit of work has fully unwound.
        done: watch::Receiver<bool>,
    },
}

impl Slot {
    /// The only way into `Building`.
    fn try_accept(
        &mut self,
        build_id: &str,
        cancel: CancellationToken,
        done: watch::Receiver<bool>,
    ) -> bool {
        match self {
            Slot::Idle => {
                *self = Slot::Building {
                    build_id: build_id.to_string(),
                    cancel,
                    done,
                };
                true
            }
            Slot::Building { .. } => false,
        }
    }

    fn active(&self) -> Option<&str> {
        match self {
            Slot::Idle => None,
            Slot::Building { build_id, .. } => Some(build_id),
        }
    }
}

struct Inner {
    slot: Mutex<Slot>,
    deps: PipelineDeps,
    events: mpsc::Sender<WorkerMessage>,
    settings: WorkerSettings,
}

#[derive(Clone)]
pub struct BuilderWorker {
    inner: Arc<Inner>,
}

impl BuilderWorker {
    pub fn new(
        deps: PipelineDeps,
        settings: WorkerSettings,
        events: mpsc::Sender<WorkerMessage>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                slot: Mutex::new(Slot::Idle),
                deps,
                events,
                settings,
            }),
        }
    }

    pub async fn is_idle(&self) -> bool {
        self.inner.slot.lock().await.active().is_none()
    }

    pub async fn active_build(&self) -> Option<String> {
        self.inner.slot.lock().await.active().map(str::to_string)
    }

    /// Handle one coordinator request.
    pub async fn on_request(&self, msg: CoordinatorMessage) {
        match msg {
            CoordinatorMessage::StartBuildImage { task }
            | CoordinatorMessage::StartBuildStatic { task } => {
                let build_id = task.build_id.clone();
                match self.try_start_task(task).await {
                    Ok(()) => {}
                    Err(WorkerError::Unavailable { active }) => {
                        tracing::debug!(build_id = %build_id, active = %active, "Busy, ignoring build request");
                    }
                    Err(e) => {
                        tracing::error!(build_id = %build_id, error = %e, "Failed to start build");
                    }
                }
            }
            CoordinatorMessage::CancelBuild { build_id } => {
                self.cancel_build(&build_id).await;
            }
        }
    }

    /// Claim and start `task`.
    ///
    /// Returns `Ok(())` both when the build started and when another worker
    /// claimed it first.
    pub async fn try_start_task(&self, task: Task) -> Result<(), WorkerError> {
        let store = &self.inner.deps.store;
        let mut slot = self.inner.slot.lock().await;
        if let Some(active) = slot.active() {
            return Err(WorkerError::Unavailable {
                active: active.to_string(),
            });
        }

        if !store
            .update_build_if(&task.build_id, BuildStatus::Queued, BuildStatus::Building)
            .await?
        {
            tracing::debug!(build_id = %task.build_id, "Build already claimed");
            return Ok(());
        }

        let repo = match store.get_repository(&task.source.repository_id).await {
            Ok(Some(repo)) => repo,
            Ok(None) => {
                drop(slot);
                self.fail_claimed(&task).await;
                return Err(StoreError::RepositoryNotFound {
                    id: task.source.repository_id.clone(),
                }
                .into());
            }
            Err(e) => {
                drop(slot);
                self.fail_claimed(&task).await;
                return Err(e.into());
            }
        };

        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(false);
        slot.try_accept(&task.build_id, cancel.clone(), done_rx);
        drop(slot);

        tracing::info!(build_id = %task.build_id, application_id = %task.application_id, "Build started");
        let worker = self.clone();
        tokio::spawn(async move {
            worker.execute(task, repo, cancel, done_tx).await;
        });
        Ok(())
    }

    /// Cancel the active build if it is `build_id`, waiting for it to unwind.
    /// Returns whether anything was canceled.
    pub async fn cancel_build(&self, build_id: &str) -> bool {
        let mut done = {
            let slot = self.inner.slot.lock().await;
            match &*slot {
                Slot::Building {
                    build_id: active,
                    cancel,
                    done,
                } if active == build_id => {
                    cancel.cancel();
                    done.clone()
                }
                _ => return false,
            }
        };
        tracing::info!(build_id = %build_id, "Canceling build");
        let _ = done.wait_for(|finished| *finished).await;
        true
    }

    /// Settle a claimed build that never reached the pipeline.
    async fn fail_claimed(&self, task: &Task) {
        pipeline::settle(&self.inner.deps, &task.build_id, BuildStatus::Failed).await;
        let _ = self
            .inner
            .events
            .send(WorkerMessage::BuildSettled {
                application_id: task.application_id.clone(),
                build_id: task.build_id.clone(),
                reason: SettleReason::Failed,
            })
            .await;
    }

    async fn execute(
        self,
        task: Task,
        repo: Repository,
        cancel: CancellationToken,
        done: watch::Sender<bool>,
    ) {
        let inner = &self.inner;
        let _ = inner
            .events
            .send(WorkerMessage::BuildStarted {
                application_id: task.application_id.clone(),
                build_id: task.build_id.clone(),
            })
            .await;

        let stop_heartbeat = CancellationToken::new();
        let heartbeat = {
            let beat = Heartbeat::new(inner.settings.heartbeat_interval);
            let store = inner.deps.store.clone();
            let build_id = task.build_id.clone();
            let stop = stop_heartbeat.clone();
            tokio::spawn(async move { beat.run(store, build_id, stop).await })
        };

        let status = match pipeline::Workspace::create(
            &inner.settings.work_dir,
            &task.build_id,
            task.is_static(),
        ) {
            Ok(workspace) => {
                let status = self.run_in(&task, &repo, &workspace, &cancel).await;
                stop_heartbeat.cancel();
                let _ = heartbeat.await;
                pipeline::finalize(&inner.deps, &task, workspace, status).await;
                status
            }
            Err(e) => {
                tracing::error!(build_id = %task.build_id, error = %e, "Failed to create build workspace");
                stop_heartbeat.cancel();
                let _ = heartbeat.await;
                pipeline::settle(&inner.deps, &task.build_id, BuildStatus::Failed).await;
                BuildStatus::Failed
            }
        };

        let _ = inner
            .events
            .send(WorkerMessage::BuildSettled {
                application_id: task.application_id.clone(),
                build_id: task.build_id.clone(),
                reason: SettleReason::from_status(status),
            })
            .await;

        *inner.slot.lock().await = Slot::Idle;
        let _ = done.send(true);
        tracing::info!(build_id = %task.build_id, status = %status, "Build settled");
    }

    async fn run_in(
        &self,
        task: &Task,
        repo: &Repository,
        workspace: &pipeline::Workspace,
        cancel: &CancellationToken,
    ) -> BuildStatus {
        let inner = &self.inner;
        let mut log = match BuildLogWriter::create(
            &task.build_id,
            workspace.log_path(),
            inner.events.clone(),
        )
        .await
        {
            Ok(log) => log,
            Err(e) => {
                tracing::error!(build_id = %task.build_id, error = %e, "Failed to open build log");
                return BuildStatus::Failed;
            }
        };

        let result = pipeline::run(&inner.deps, task, repo, workspace, &mut log, cancel).await;
        let status = pipeline::classify(&result, cancel);
        let closing = match (&result, status) {
            (Err(_), BuildStatus::Canceled) => Some("Build canceled".to_string()),
            (Err(e), _) => {
                tracing::warn!(build_id = %task.build_id, error = %e, "Build failed");
                Some(format!("Build failed: {}", e))
            }
            (Ok(()), _) => None,
        };
        if let Some(line) = closing {
            let _ = log.line(&line).await;
        }
        if let Err(e) = log.finish().await {
            tracing::warn!(build_id = %task.build_id, error = %e, "Failed to flush build log");
        }
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_accepts_once() {
        let mut slot = Slot::Idle;
        let (_tx, rx) = watch::channel(false);
        assert!(slot.try_accept("b1", CancellationToken::new(), rx.clone()));
        assert_eq!(slot.active(), Some("b1"));
        assert!(!slot.try_accept("b2", CancellationToken::new(), rx));
        assert_eq!(slot.active(), Some("b1"));
    }
}
