//! User-facing build operations.

use std::sync::Arc;

use kiln_common::{Build, BuildStatus};
use tokio::sync::mpsc;

use crate::coordinator::Coordinator;
use crate::errors::{ServiceError, StorageError};
use crate::logstream::{LogStreamService, Unsubscribe};
use crate::storage::{Storage, build_log_key};
use crate::store::BuildStore;

/// Per-subscriber queue depth for live log tails.
const LOG_SUBSCRIBER_CAPACITY: usize = 256;

/// A live tail of a running build's log. Dropping it unsubscribes.
pub struct LogSubscription {
    pub rx: mpsc::Receiver<String>,
    handle: Unsubscribe,
}

impl LogSubscription {
    /// Next chunk, or `None` once the build settled.
    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }
}

impl Drop for LogSubscription {
    fn drop(&mut self) {
        self.handle.unsubscribe();
    }
}

#[derive(Clone)]
pub struct BuildService {
    store: Arc<dyn BuildStore>,
    storage: Arc<dyn Storage>,
    logs: Arc<LogStreamService>,
    coordinator: Arc<Coordinator>,
}

impl BuildService {
    pub fn new(
        store: Arc<dyn BuildStore>,
        storage: Arc<dyn Storage>,
        coordinator: Arc<Coordinator>,
    ) -> Self {
        Self {
            store,
            storage,
            logs: coordinator.logs().clone(),
            coordinator,
        }
    }

    pub async fn get_build(&self, id: &str) -> Result<Build, ServiceError> {
        self.store
            .get_build(id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Build {} not found", id)))
    }

    /// Cancel a queued or running build.
    ///
    /// A queued build is settled here; a running one is asked to stop and
    /// settles through its worker.
    pub async fn cancel_build(&self, id: &str) -> Result<Build, ServiceError> {
        let build = self.get_build(id).await?;
        match build.status {
            BuildStatus::Queued => {
                if !self
                    .store
                    .update_build_if(id, BuildStatus::Queued, BuildStatus::Canceled)
                    .await?
                {
                    // Claimed between the read and the update.
                    self.coordinator.cancel_build(id);
                }
            }
            BuildStatus::Building => self.coordinator.cancel_build(id),
            status => {
                return Err(ServiceError::BadRequest(format!(
                    "Build {} is {} and cannot be canceled",
                    id, status
                )));
            }
        }
        tracing::info!(build_id = %id, "Cancel requested");
        self.get_build(id).await
    }

    /// Queue a fresh build of the same commit. Only finished, retriable
    /// builds qualify; the old row stops being retriable.
    pub async fn retry_build(&self, id: &str) -> Result<Build, ServiceError> {
        let build = self.get_build(id).await?;
        if !build.status.is_finished() {
            return Err(ServiceError::BadRequest(format!(
                "Build {} is still {}",
                id, build.status
            )));
        }
        if !build.retriable {
            return Err(ServiceError::BadRequest(format!(
                "Build {} is not retriable",
                id
            )));
        }

        let mut retry = Build::queued(&build.application_id, &build.commit);
        retry.retriable = true;
        self.store.create_build(&retry).await?;
        self.store.set_retriable(id, false).await?;
        self.coordinator.request_dispatch();
        tracing::info!(build_id = %id, retry_id = %retry.id, "Build retried");
        Ok(retry)
    }

    /// Stored log of a finished build.
    pub async fn get_build_log(&self, id: &str) -> Result<Vec<u8>, ServiceError> {
        let build = self.get_build(id).await?;
        if !build.status.is_finished() {
            return Err(ServiceError::BadRequest(format!(
                "Build {} has not finished; subscribe to the live log instead",
                id
            )));
        }
        match self.storage.open(&build_log_key(id)).await {
            Ok(data) => Ok(data),
            Err(StorageError::NotFound { .. }) => Err(ServiceError::NotFound(format!(
                "No log stored for build {}",
                id
            ))),
            Err(e) => Err(e.into()),
        }
    }

    /// Live tail of a running build. Replays what was logged so far.
    pub async fn subscribe_build_log(&self, id: &str) -> Result<LogSubscription, ServiceError> {
        let build = self.get_build(id).await?;
        if build.status != BuildStatus::Building {
            return Err(ServiceError::BadRequest(format!(
                "Build {} is {}, not building",
                id, build.status
            )));
        }
        let (tx, rx) = mpsc::channel(LOG_SUBSCRIBER_CAPACITY);
        let handle = self.logs.subscribe_build_log(id, tx).ok_or_else(|| {
            ServiceError::BadRequest(format!("Build {} has no live log yet", id))
        })?;
        Ok(LogSubscription { rx, handle })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use crate::storage::LocalStorage;
    use crate::store::SqliteStore;
    use kiln_common::CoordinatorMessage;

    struct Fixture {
        service: BuildService,
        store: Arc<SqliteStore>,
        storage: Arc<LocalStorage>,
        coordinator: Arc<Coordinator>,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let storage = Arc::new(LocalStorage::new(dir.path()));
        let coordinator = Coordinator::new(
            store.clone(),
            Arc::new(LogStreamService::new()),
            EventBus::default(),
            4,
        );
        let service = BuildService::new(store.clone(), storage.clone(), coordinator.clone());
        Fixture {
            service,
            store,
            storage,
            coordinator,
            _dir: dir,
        }
    }

    async fn build_in(store: &SqliteStore, status: BuildStatus) -> Build {
        let build = Build::queued("app1", "abc123");
        store.create_build(&build).await.unwrap();
        if status != BuildStatus::Queued {
            assert!(
                store
                    .update_build_if(&build.id, BuildStatus::Queued, BuildStatus::Building)
                    .await
                    .unwrap()
            );
        }
        if status.is_finished() {
            assert!(store.finish_build(&build.id, status).await.unwrap());
        }
        store.get_build(&build.id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_get_missing_build_is_not_found() {
        let f = fixture();
        let err = f.service.get_build("nope").await.unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_cancel_queued_settles_immediately() {
        let f = fixture();
        let build = build_in(&f.store, BuildStatus::Queued).await;
        let canceled = f.service.cancel_build(&build.id).await.unwrap();
        assert_eq!(canceled.status, BuildStatus::Canceled);
        assert!(canceled.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_cancel_building_routes_to_workers() {
        let f = fixture();
        let (tx, mut rx) = mpsc::channel(4);
        f.coordinator.registry().register("w1", tx);
        let build = build_in(&f.store, BuildStatus::Building).await;

        let after = f.service.cancel_build(&build.id).await.unwrap();
        assert_eq!(after.status, BuildStatus::Building);
        assert_eq!(
            rx.try_recv().unwrap(),
            CoordinatorMessage::CancelBuild {
                build_id: build.id.clone()
            }
        );
    }

    #[tokio::test]
    async fn test_cancel_finished_is_bad_request() {
        let f = fixture();
        let build = build_in(&f.store, BuildStatus::Succeeded).await;
        let err = f.service.cancel_build(&build.id).await.unwrap_err();
        assert!(matches!(err, ServiceError::BadRequest(_)));
    }

    #[tokio::test]
    async fn test_retry_requires_finished_and_retriable() {
        let f = fixture();
        let running = build_in(&f.store, BuildStatus::Building).await;
        assert!(matches!(
            f.service.retry_build(&running.id).await.unwrap_err(),
            ServiceError::BadRequest(_)
        ));

        let failed = build_in(&f.store, BuildStatus::Failed).await;
        assert!(matches!(
            f.service.retry_build(&failed.id).await.unwrap_err(),
            ServiceError::BadRequest(_)
        ));

        f.store.set_retriable(&failed.id, true).await.unwrap();
        let retry = f.service.retry_build(&failed.id).await.unwrap();
        assert_eq!(retry.status, BuildStatus::Queued);
        assert_eq!(retry.commit, failed.commit);
        assert_ne!(retry.id, failed.id);

        let old = f.store.get_build(&failed.id).await.unwrap().unwrap();
        assert!(!old.retriable);
        assert!(f.service.retry_build(&failed.id).await.is_err());
    }

    #[tokio::test]
    async fn test_build_log_only_for_finished_builds() {
        let f = fixture();
        let running = build_in(&f.store, BuildStatus::Building).await;
        assert!(matches!(
            f.service.get_build_log(&running.id).await.unwrap_err(),
            ServiceError::BadRequest(_)
        ));

        let done = build_in(&f.store, BuildStatus::Succeeded).await;
        assert!(matches!(
            f.service.get_build_log(&done.id).await.unwrap_err(),
            ServiceError::NotFound(_)
        ));

        f.storage
            .save(&build_log_key(&done.id), b"step 1\nstep 2\n".to_vec())
            .await
            .unwrap();
        assert_eq!(
            f.service.get_build_log(&done.id).await.unwrap(),
            b"step 1\nstep 2\n"
        );
    }

    #[tokio::test]
    async fn test_live_log_requires_active_stream() {
        let f = fixture();
        let queued = build_in(&f.store, BuildStatus::Queued).await;
        assert!(matches!(
            f.service.subscribe_build_log(&queued.id).await.err().unwrap(),
            ServiceError::BadRequest(_)
        ));

        let running = build_in(&f.store, BuildStatus::Building).await;
        assert!(f.service.subscribe_build_log(&running.id).await.is_err());

        let logs = f.coordinator.logs();
        logs.start_build_log(&running.id);
        logs.append_build_log(&running.id, "cloning\n");
        let mut sub = f.service.subscribe_build_log(&running.id).await.unwrap();
        logs.append_build_log(&running.id, "building\n");
        assert_eq!(sub.recv().await.unwrap(), "cloning\n");
        assert_eq!(sub.recv().await.unwrap(), "building\n");
        logs.close_build_log(&running.id);
        assert!(sub.recv().await.is_none());
    }
}
