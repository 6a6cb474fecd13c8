//! `kiln worker`.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc;

use kiln::config::KilnConfig;
use kiln::git::{GitCredentials, GitFetcher};
use kiln::shutdown::install_shutdown_handler;
use kiln::storage::LocalStorage;
use kiln::store::SqliteStore;
use kiln::worker::docker::DockerEngine;
use kiln::worker::engine::{BuildEngine, run_prune_loop};
use kiln::worker::{BuilderWorker, PipelineDeps, WorkerSettings, client};

pub async fn cmd_worker(config: KilnConfig) -> Result<()> {
    let shutdown = install_shutdown_handler()?;
    let worker_config = config.worker;

    let store = Arc::new(
        SqliteStore::open(&config.database.path, config.database.busy_timeout())
            .with_context(|| format!("Failed to open database {}", config.database.path.display()))?,
    );
    let engine: Arc<dyn BuildEngine> = Arc::new(DockerEngine::connect(&worker_config.registry)?);
    let credentials = GitCredentials::load(worker_config.ssh_key_path.as_deref())?;

    let work_dir = worker_config.work_dir();
    std::fs::create_dir_all(&work_dir)
        .with_context(|| format!("Failed to create work dir {}", work_dir.display()))?;

    let deps = PipelineDeps {
        store,
        storage: Arc::new(LocalStorage::new(&config.storage.root)),
        engine: engine.clone(),
        fetcher: Arc::new(GitFetcher::new(credentials)),
    };
    let (events_tx, events_rx) = mpsc::channel(worker_config.event_queue_size.max(1));
    let worker = BuilderWorker::new(
        deps,
        WorkerSettings {
            work_dir,
            heartbeat_interval: worker_config.heartbeat_interval(),
        },
        events_tx,
    );

    let prune_task = tokio::spawn(run_prune_loop(
        engine,
        worker_config.prune_interval(),
        shutdown.clone(),
    ));

    let worker_id = worker_config
        .worker_id
        .clone()
        .unwrap_or_else(kiln_common::new_id);
    tracing::info!(worker_id = %worker_id, coordinator = %worker_config.coordinator_addr, "Worker starting");
    client::run(
        worker_config.coordinator_addr.clone(),
        worker_id,
        worker.clone(),
        events_rx,
        shutdown.clone(),
    )
    .await;

    if let Some(build_id) = worker.active_build().await {
        tracing::info!(build_id = %build_id, "Canceling in-flight build");
        worker.cancel_build(&build_id).await;
    }
    let _ = prune_task.await;
    tracing::info!("Worker stopped");
    Ok(())
}
