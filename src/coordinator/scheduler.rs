use std::sync::Arc;
use std::time::Duration;

use kiln_common::{
    Application, Build, BuildSource, BuildStatus, BuildTarget, CoordinatorMessage, Task,
};
use tokio_util::sync::CancellationToken;

use super::Coordinator;
use crate::errors::StoreError;
use crate::store::BuildStore;

/// How image builds are named in the registry.
#[derive(Debug, Clone)]
pub struct ImageNaming {
    pub registry: String,
    pub prefix: String,
}

impl ImageNaming {
    pub fn image_name(&self, application_id: &str) -> String {
        format!(
            "{}/{}{}",
            self.registry.trim_end_matches('/'),
            self.prefix,
            application_id
        )
    }
}

/// Turn a queued build into the task workers receive.
pub fn build_task(build: &Build, app: &Application, naming: &ImageNaming) -> Task {
    let target = if app.build.static_build {
        BuildTarget::Static
    } else {
        BuildTarget::Image {
            name: naming.image_name(&app.id),
            tag: build.id.clone(),
        }
    };
    Task {
        build_id: build.id.clone(),
        application_id: app.id.clone(),
        source: BuildSource {
            repository_id: app.repository_id.clone(),
            commit: build.commit.clone(),
        },
        options: app.build_options(),
        target,
    }
}

/// Broadcasts queued builds whenever a worker may be free.
pub struct BuildScheduler {
    coordinator: Arc<Coordinator>,
    store: Arc<dyn BuildStore>,
    naming: ImageNaming,
    interval: Duration,
}

impl BuildScheduler {
    pub fn new(
        coordinator: Arc<Coordinator>,
        store: Arc<dyn BuildStore>,
        naming: ImageNaming,
        interval: Duration,
    ) -> Self {
        Self {
            coordinator,
            store,
            naming,
            interval,
        }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.coordinator.idle() => {}
                _ = self.coordinator.dispatch_requested() => {}
                _ = ticker.tick() => {}
            }
            match self.dispatch_queued().await {
                Ok(0) => {}
                Ok(sent) => tracing::debug!(sent, "Dispatched queued builds"),
                Err(e) => tracing::error!(error = %e, "Dispatch pass failed"),
            }
        }
    }

    /// One pass: offer up to one queued build per connected worker, oldest
    /// first. Returns how many builds were broadcast.
    pub async fn dispatch_queued(&self) -> Result<usize, StoreError> {
        let workers = self.coordinator.registry().len();
        if workers == 0 {
            return Ok(0);
        }

        let mut sent = 0;
        for build in self.store.list_builds(BuildStatus::Queued).await? {
            if sent >= workers {
                break;
            }
            let Some(app) = self.store.get_application(&build.application_id).await? else {
                tracing::warn!(build_id = %build.id, application_id = %build.application_id, "Application gone, skipping build");
                self.store
                    .update_build_if(&build.id, BuildStatus::Queued, BuildStatus::Skipped)
                    .await?;
                continue;
            };
            let task = build_task(&build, &app, &self.naming);
            let delivered = self
                .coordinator
                .broadcast_builder(CoordinatorMessage::start(task));
            tracing::debug!(build_id = %build.id, delivered, "Offered build to workers");
            sent += 1;
        }
        Ok(sent)
    }
}
