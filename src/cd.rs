//! Continuous deployment: pushes enqueue builds, successful builds deploy.

use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use kiln_common::{Build, BuildStatus};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bus::{Event, EventBus, Subscription, Topic};
use crate::coordinator::Coordinator;
use crate::git::CommitResolver;
use crate::store::BuildStore;

/// Rolls a built artifact out to an environment.
#[async_trait]
pub trait Deployer: Send + Sync {
    async fn deploy(&self, environment_id: &str, build_id: &str) -> Result<()>;
}

/// Deployer for setups without an orchestration backend: records the request.
pub struct LogDeployer;

#[async_trait]
impl Deployer for LogDeployer {
    async fn deploy(&self, environment_id: &str, build_id: &str) -> Result<()> {
        tracing::info!(environment_id = %environment_id, build_id = %build_id, "Deploy requested");
        Ok(())
    }
}

pub struct ContinuousDeployment {
    bus: EventBus,
    store: Arc<dyn BuildStore>,
    resolver: Arc<dyn CommitResolver>,
    deployer: Arc<dyn Deployer>,
    coordinator: Arc<Coordinator>,
    stop: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ContinuousDeployment {
    pub fn new(
        bus: EventBus,
        store: Arc<dyn BuildStore>,
        resolver: Arc<dyn CommitResolver>,
        deployer: Arc<dyn Deployer>,
        coordinator: Arc<Coordinator>,
    ) -> Arc<Self> {
        Arc::new(Self {
            bus,
            store,
            resolver,
            deployer,
            coordinator,
            stop: CancellationToken::new(),
            handle: Mutex::new(None),
        })
    }

    /// Spawn the event consumer. Subscribes before returning so no event
    /// published afterwards is missed. Calling it twice has no effect.
    pub fn start(self: &Arc<Self>) {
        let mut handle = self
            .handle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if handle.is_some() {
            return;
        }
        let sub = self
            .bus
            .subscribe(&[Topic::RepositoryPushed, Topic::BuildSucceeded]);
        let this = self.clone();
        *handle = Some(tokio::spawn(async move { this.consume(sub).await }));
    }

    /// Stop consuming. An event already being handled runs to completion.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Stop and wait for the consumer to exit.
    pub async fn shutdown(&self) {
        self.stop();
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    async fn consume(&self, mut sub: Subscription) {
        loop {
            let event = tokio::select! {
                _ = self.stop.cancelled() => break,
                event = sub.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            let result = match &event {
                Event::RepositoryPushed { repo_url, branch } => {
                    self.on_push(repo_url, branch).await
                }
                Event::BuildSucceeded {
                    environment_id,
                    build_id,
                } => self.on_build_succeeded(environment_id, build_id).await,
                Event::BuildSettled { .. } => Ok(()),
            };
            if let Err(e) = result {
                tracing::error!(event = ?event, error = %e, "Deployment event handling failed");
            }
        }
        tracing::debug!("Continuous deployment stopped");
    }

    /// Queue a build of the new head of every application tracking the branch.
    pub async fn on_push(&self, repo_url: &str, branch: &str) -> Result<()> {
        let apps = self.store.find_applications(repo_url, branch).await?;
        if apps.is_empty() {
            tracing::debug!(repo_url = %repo_url, branch = %branch, "Push matches no application");
            return Ok(());
        }

        let mut queued = 0;
        for app in apps {
            let Some(repo) = self.store.get_repository(&app.repository_id).await? else {
                tracing::warn!(application_id = %app.id, "Repository missing for application");
                continue;
            };
            let commit = match self.resolver.resolve_head(&repo, &app.ref_name).await {
                Ok(Some(commit)) => commit,
                Ok(None) => {
                    tracing::warn!(application_id = %app.id, branch = %app.ref_name, "Branch not found on remote");
                    continue;
                }
                Err(e) => {
                    tracing::warn!(application_id = %app.id, error = %e, "Failed to resolve branch head");
                    continue;
                }
            };
            self.store.update_application_commit(&app.id, &commit).await?;

            let builds = self.store.list_application_builds(&app.id).await?;
            for stale in builds
                .iter()
                .filter(|b| b.status == BuildStatus::Queued && b.commit != commit)
            {
                if self
                    .store
                    .update_build_if(&stale.id, BuildStatus::Queued, BuildStatus::Skipped)
                    .await?
                {
                    tracing::info!(build_id = %stale.id, "Superseded queued build skipped");
                }
            }
            if builds.iter().any(|b| b.commit == commit) {
                tracing::debug!(application_id = %app.id, commit = %commit, "Commit already built or queued");
                continue;
            }

            let mut build = Build::queued(&app.id, &commit);
            build.retriable = true;
            self.store.create_build(&build).await?;
            tracing::info!(application_id = %app.id, build_id = %build.id, commit = %commit, "Build queued");
            queued += 1;
        }

        if queued > 0 {
            self.coordinator.request_dispatch();
        }
        Ok(())
    }

    pub async fn on_build_succeeded(&self, environment_id: &str, build_id: &str) -> Result<()> {
        if environment_id.is_empty() {
            return Ok(());
        }
        self.deployer.deploy(environment_id, build_id).await
    }
}
