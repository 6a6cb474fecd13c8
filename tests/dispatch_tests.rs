//! End-to-end dispatch tests: a coordinator and real builder workers talking
//! over in-memory pipes, with the git and container layers faked out.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use kiln::bus::{Event, EventBus, Subscription, Topic};
use kiln::coordinator::Coordinator;
use kiln::coordinator::scheduler::{BuildScheduler, ImageNaming, build_task};
use kiln::coordinator::server::serve_workers;
use kiln::errors::PipelineError;
use kiln::git::SourceFetcher;
use kiln::logstream::LogStreamService;
use kiln::service::BuildService;
use kiln::storage::{LocalStorage, Storage, artifact_key, build_log_key};
use kiln::store::{BuildStore, SqliteStore};
use kiln::worker::engine::{BuildEngine, BuildRequest};
use kiln::worker::log_writer::BuildLogWriter;
use kiln::worker::{BuilderWorker, PipelineDeps, WorkerSettings, client};
use kiln_common::{
    Application, ApplicationBuildConfig, Build, BuildStatus, CoordinatorMessage, Repository,
    RepositoryAuth, SettleReason, WorkerMessage,
};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;

const TIMEOUT: Duration = Duration::from_secs(10);

struct FakeFetcher;

#[async_trait]
impl SourceFetcher for FakeFetcher {
    async fn fetch(
        &self,
        _repo: &Repository,
        commit: &str,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError> {
        if cancel.is_cancelled() {
            return Err(PipelineError::Canceled);
        }
        tokio::fs::write(dest.join("index.html"), commit)
            .await
            .map_err(PipelineError::Workspace)
    }
}

/// Engine that succeeds immediately, except that the first build can be
/// held until it is canceled.
#[derive(Default)]
struct FakeEngine {
    hold_first: AtomicBool,
    started: Notify,
    builds: AtomicUsize,
}

impl FakeEngine {
    fn holding_first() -> Self {
        Self {
            hold_first: AtomicBool::new(true),
            ..Default::default()
        }
    }

    async fn run(&self, log: &mut BuildLogWriter, cancel: &CancellationToken) -> Result<(), PipelineError> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        log.line("Step 1/2 : FROM scratch").await.map_err(PipelineError::Log)?;
        if self.hold_first.swap(false, Ordering::SeqCst) {
            self.started.notify_one();
            cancel.cancelled().await;
            return Err(PipelineError::Canceled);
        }
        log.line("Step 2/2 : COPY . /srv").await.map_err(PipelineError::Log)?;
        Ok(())
    }
}

#[async_trait]
impl BuildEngine for FakeEngine {
    async fn build_image(
        &self,
        _request: BuildRequest<'_>,
        _image_ref: &str,
        log: &mut BuildLogWriter,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError> {
        self.run(log, cancel).await
    }

    async fn build_static(
        &self,
        _request: BuildRequest<'_>,
        _artifact_path: &str,
        dest: &Path,
        log: &mut BuildLogWriter,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError> {
        self.run(log, cancel).await?;
        tokio::fs::write(dest, b"tarball")
            .await
            .map_err(PipelineError::Workspace)
    }

    async fn prune_cache(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

fn naming() -> ImageNaming {
    ImageNaming {
        registry: "registry.test:5000".into(),
        prefix: "kiln-".into(),
    }
}

fn new_worker(
    store: &Arc<SqliteStore>,
    storage: &Arc<LocalStorage>,
    engine: &Arc<FakeEngine>,
    work_dir: &Path,
) -> (BuilderWorker, mpsc::Receiver<WorkerMessage>) {
    std::fs::create_dir_all(work_dir).unwrap();
    let (events_tx, events_rx) = mpsc::channel(256);
    let worker = BuilderWorker::new(
        PipelineDeps {
            store: store.clone(),
            storage: storage.clone(),
            engine: engine.clone(),
            fetcher: Arc::new(FakeFetcher),
        },
        WorkerSettings {
            work_dir: work_dir.to_path_buf(),
            heartbeat_interval: Duration::from_millis(50),
        },
        events_tx,
    );
    (worker, events_rx)
}

struct Cluster {
    store: Arc<SqliteStore>,
    storage: Arc<LocalStorage>,
    engine: Arc<FakeEngine>,
    coordinator: Arc<Coordinator>,
    scheduler: BuildScheduler,
    service: BuildService,
    bus: EventBus,
    workers: Vec<BuilderWorker>,
    shutdown: CancellationToken,
    dir: TempDir,
}

impl Cluster {
    async fn start(worker_count: usize, engine: FakeEngine) -> Self {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let storage = Arc::new(LocalStorage::new(dir.path().join("storage")));
        let engine = Arc::new(engine);
        let bus = EventBus::default();
        let coordinator = Coordinator::new(
            store.clone(),
            Arc::new(LogStreamService::new()),
            bus.clone(),
            16,
        );
        let scheduler = BuildScheduler::new(
            coordinator.clone(),
            store.clone(),
            naming(),
            Duration::from_secs(3600),
        );
        let service = BuildService::new(store.clone(), storage.clone(), coordinator.clone());
        let shutdown = CancellationToken::new();

        let mut workers = Vec::new();
        for i in 0..worker_count {
            let work_dir = dir.path().join(format!("work-{}", i));
            let (worker, mut events_rx) = new_worker(&store, &storage, &engine, &work_dir);

            let (coordinator_side, worker_side) = tokio::io::duplex(64 * 1024);
            let coord = coordinator.clone();
            tokio::spawn(async move {
                let _ = coord.connect(coordinator_side).await;
            });
            let w = worker.clone();
            let token = shutdown.clone();
            let worker_id = format!("w{}", i);
            tokio::spawn(async move {
                let _ = client::serve(worker_side, &worker_id, &w, &mut events_rx, &token).await;
            });
            workers.push(worker);
        }

        let registered = async {
            while coordinator.registry().len() < worker_count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };
        tokio::time::timeout(TIMEOUT, registered).await.unwrap();

        store
            .create_repository(&Repository {
                id: "r1".into(),
                url: "https://git.example.com/blog.git".into(),
                auth: RepositoryAuth::None,
            })
            .await
            .unwrap();

        Self {
            store,
            storage,
            engine,
            coordinator,
            scheduler,
            service,
            bus,
            workers,
            shutdown,
            dir,
        }
    }

    async fn add_app(&self, id: &str, static_build: bool, environment_id: Option<&str>) {
        self.store
            .create_application(&Application {
                id: id.into(),
                name: id.into(),
                repository_id: "r1".into(),
                ref_name: "main".into(),
                commit: None,
                environment_id: environment_id.map(str::to_string),
                build: ApplicationBuildConfig {
                    static_build,
                    base_image_name: Some("alpine:3".into()),
                    build_cmd: "make".into(),
                    entrypoint_cmd: "./serve".into(),
                    artifact_path: "dist".into(),
                    ..Default::default()
                },
            })
            .await
            .unwrap();
    }

    async fn queue(&self, app_id: &str, commit: &str) -> Build {
        let build = Build::queued(app_id, commit);
        self.store.create_build(&build).await.unwrap();
        build
    }

    async fn wait_all_idle(&self) {
        let idle = async {
            loop {
                let mut all = true;
                for w in &self.workers {
                    all &= w.is_idle().await;
                }
                if all {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };
        tokio::time::timeout(TIMEOUT, idle).await.unwrap();
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn next_settled(sub: &mut Subscription) -> (String, SettleReason) {
    match tokio::time::timeout(TIMEOUT, sub.recv()).await.unwrap() {
        Some(Event::BuildSettled {
            build_id, reason, ..
        }) => (build_id, reason),
        other => panic!("expected settlement, got {:?}", other),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_workers_race_for_one_build() {
    let cluster = Cluster::start(2, FakeEngine::default()).await;
    cluster.add_app("app1", false, None).await;
    let build = cluster.queue("app1", "abc123").await;
    let mut settled = cluster.bus.subscribe(&[Topic::BuildSettled]);

    assert_eq!(cluster.scheduler.dispatch_queued().await.unwrap(), 1);

    let (id, reason) = next_settled(&mut settled).await;
    assert_eq!(id, build.id);
    assert_eq!(reason, SettleReason::Success);
    cluster.wait_all_idle().await;

    assert_eq!(cluster.engine.builds.load(Ordering::SeqCst), 1, "exactly one worker built");
    let done = cluster.store.get_build(&build.id).await.unwrap().unwrap();
    assert_eq!(done.status, BuildStatus::Succeeded);
    assert!(done.started_at.is_some());
    assert!(done.timestamps_consistent());
    assert!(done.artifact.is_none(), "image builds have no artifact");

    let log = cluster.storage.open(&build_log_key(&build.id)).await.unwrap();
    let log = String::from_utf8(log).unwrap();
    assert!(log.contains("Cloning https://git.example.com/blog.git at abc123"));
    assert!(log.contains("Step 2/2"));

    // Nothing else settles.
    assert!(
        tokio::time::timeout(Duration::from_millis(200), settled.recv())
            .await
            .is_err()
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_mid_build_then_accept_next() {
    let cluster = Cluster::start(1, FakeEngine::holding_first()).await;
    cluster.add_app("app1", false, None).await;
    let first = cluster.queue("app1", "c1").await;
    let mut settled = cluster.bus.subscribe(&[Topic::BuildSettled]);

    cluster.scheduler.dispatch_queued().await.unwrap();
    tokio::time::timeout(TIMEOUT, cluster.engine.started.notified())
        .await
        .unwrap();
    assert_eq!(cluster.workers[0].active_build().await.as_deref(), Some(first.id.as_str()));

    // Live log is available while building, once the coordinator has seen
    // the start event.
    let subscribe = async {
        loop {
            match cluster.service.subscribe_build_log(&first.id).await {
                Ok(tail) => return tail,
                Err(_) => tokio::time::sleep(Duration::from_millis(5)).await,
            }
        }
    };
    let mut tail = tokio::time::timeout(TIMEOUT, subscribe).await.unwrap();
    let mut seen = String::new();
    while !seen.contains("Step 1/2") {
        let chunk = tokio::time::timeout(TIMEOUT, tail.recv()).await.unwrap().unwrap();
        seen.push_str(&chunk);
    }
    assert!(seen.contains("Cloning"));

    let after = cluster.service.cancel_build(&first.id).await.unwrap();
    assert_eq!(after.status, BuildStatus::Building, "settles through the worker");

    let (id, reason) = next_settled(&mut settled).await;
    assert_eq!(id, first.id);
    assert_eq!(reason, SettleReason::Cancelled);
    let canceled = cluster.store.get_build(&first.id).await.unwrap().unwrap();
    assert_eq!(canceled.status, BuildStatus::Canceled);
    assert!(canceled.finished_at.is_some());

    // The tail ends once the build settles.
    let drained = async { while tail.recv().await.is_some() {} };
    tokio::time::timeout(TIMEOUT, drained).await.unwrap();

    cluster.wait_all_idle().await;
    let second = cluster.queue("app1", "c2").await;
    cluster.scheduler.dispatch_queued().await.unwrap();
    let (id, reason) = next_settled(&mut settled).await;
    assert_eq!(id, second.id);
    assert_eq!(reason, SettleReason::Success);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_static_build_stores_artifact_and_announces_success() {
    let cluster = Cluster::start(1, FakeEngine::default()).await;
    cluster.add_app("site", true, Some("env-prod")).await;
    let build = cluster.queue("site", "f00d").await;
    let mut events = cluster
        .bus
        .subscribe(&[Topic::BuildSucceeded, Topic::BuildSettled]);

    cluster.scheduler.dispatch_queued().await.unwrap();

    let succeeded = tokio::time::timeout(TIMEOUT, events.recv()).await.unwrap();
    assert_eq!(
        succeeded,
        Some(Event::BuildSucceeded {
            environment_id: "env-prod".into(),
            build_id: build.id.clone(),
        })
    );
    let (id, reason) = next_settled(&mut events).await;
    assert_eq!(id, build.id);
    assert_eq!(reason, SettleReason::Success);

    let done = cluster.store.get_build(&build.id).await.unwrap().unwrap();
    assert_eq!(done.status, BuildStatus::Succeeded);
    let artifact = done.artifact.expect("static build has an artifact");
    assert_eq!(artifact.size, 7);
    assert!(artifact.deleted_at.is_none());
    assert_eq!(
        cluster.storage.open(&artifact_key(&artifact.id)).await.unwrap(),
        b"tarball"
    );
    assert!(cluster.storage.open(&build_log_key(&build.id)).await.is_ok());
    assert!(!cluster.coordinator.logs().is_active(&build.id));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_build_for_missing_repository_still_settles() {
    let cluster = Cluster::start(1, FakeEngine::default()).await;
    cluster
        .store
        .create_application(&Application {
            id: "orphan".into(),
            name: "orphan".into(),
            repository_id: "gone".into(),
            ref_name: "main".into(),
            commit: None,
            environment_id: None,
            build: ApplicationBuildConfig::default(),
        })
        .await
        .unwrap();
    let build = cluster.queue("orphan", "c1").await;
    let mut settled = cluster.bus.subscribe(&[Topic::BuildSettled]);

    cluster.scheduler.dispatch_queued().await.unwrap();

    let (id, reason) = next_settled(&mut settled).await;
    assert_eq!(id, build.id);
    assert_eq!(reason, SettleReason::Failed);
    assert_eq!(
        cluster.store.get_build(&build.id).await.unwrap().unwrap().status,
        BuildStatus::Failed
    );
    assert_eq!(cluster.engine.builds.load(Ordering::SeqCst), 0);
    cluster.wait_all_idle().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_settlement_delivered_after_reconnect() {
    let cluster = Cluster::start(0, FakeEngine::default()).await;
    cluster.add_app("app1", false, Some("env-prod")).await;
    let build = cluster.queue("app1", "c1").await;
    let mut events = cluster
        .bus
        .subscribe(&[Topic::BuildSucceeded, Topic::BuildSettled]);

    // A port nobody listens on yet.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let (worker, events_rx) = new_worker(
        &cluster.store,
        &cluster.storage,
        &cluster.engine,
        &cluster.dir.path().join("work-offline"),
    );
    tokio::spawn(client::run(
        addr.to_string(),
        "w-offline".into(),
        worker.clone(),
        events_rx,
        cluster.shutdown.clone(),
    ));

    // Build entirely while disconnected.
    let app = cluster.store.get_application("app1").await.unwrap().unwrap();
    worker
        .on_request(CoordinatorMessage::start(build_task(&build, &app, &naming())))
        .await;
    let finished = async {
        loop {
            let b = cluster.store.get_build(&build.id).await.unwrap().unwrap();
            if b.status.is_finished() && worker.is_idle().await {
                return b;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    let b = tokio::time::timeout(TIMEOUT, finished).await.unwrap();
    assert_eq!(b.status, BuildStatus::Succeeded);
    assert!(cluster.coordinator.registry().is_empty());

    let listener = TcpListener::bind(addr).await.unwrap();
    tokio::spawn(serve_workers(
        listener,
        cluster.coordinator.clone(),
        cluster.shutdown.clone(),
    ));

    let succeeded = tokio::time::timeout(TIMEOUT, events.recv()).await.unwrap();
    assert_eq!(
        succeeded,
        Some(Event::BuildSucceeded {
            environment_id: "env-prod".into(),
            build_id: build.id.clone(),
        })
    );
    let (id, reason) = next_settled(&mut events).await;
    assert_eq!(id, build.id);
    assert_eq!(reason, SettleReason::Success);
    assert!(!cluster.coordinator.logs().is_active(&build.id));
}
