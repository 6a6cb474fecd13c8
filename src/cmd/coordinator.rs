//! `kiln coordinator`.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;

use kiln::api::{AppState, build_router};
use kiln::bus::EventBus;
use kiln::cd::{ContinuousDeployment, LogDeployer};
use kiln::config::KilnConfig;
use kiln::coordinator::Coordinator;
use kiln::coordinator::scheduler::{BuildScheduler, ImageNaming};
use kiln::coordinator::server::serve_workers;
use kiln::git::{GitCredentials, RemoteCommitResolver};
use kiln::logstream::LogStreamService;
use kiln::service::BuildService;
use kiln::shutdown::install_shutdown_handler;
use kiln::storage::LocalStorage;
use kiln::store::SqliteStore;

pub async fn cmd_coordinator(config: KilnConfig) -> Result<()> {
    let shutdown = install_shutdown_handler()?;

    let store = Arc::new(
        SqliteStore::open(&config.database.path, config.database.busy_timeout())
            .with_context(|| format!("Failed to open database {}", config.database.path.display()))?,
    );
    let storage = Arc::new(LocalStorage::new(&config.storage.root));
    let bus = EventBus::default();
    let coordinator = Coordinator::new(
        store.clone(),
        Arc::new(LogStreamService::new()),
        bus.clone(),
        config.coordinator.worker_queue_size,
    );

    let scheduler = BuildScheduler::new(
        coordinator.clone(),
        store.clone(),
        ImageNaming {
            registry: config.coordinator.image_registry.clone(),
            prefix: config.coordinator.image_prefix.clone(),
        },
        config.coordinator.dispatch_interval(),
    );
    let scheduler_task = tokio::spawn(scheduler.run(shutdown.clone()));

    let credentials = GitCredentials::load(config.worker.ssh_key_path.as_deref())?;
    let cd = ContinuousDeployment::new(
        bus.clone(),
        store.clone(),
        Arc::new(RemoteCommitResolver::new(credentials)),
        Arc::new(LogDeployer),
        coordinator.clone(),
    );
    cd.start();

    let worker_listener = TcpListener::bind(config.coordinator.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.coordinator.listen_addr))?;
    tracing::info!(addr = %config.coordinator.listen_addr, "Listening for workers");
    let workers_task = tokio::spawn(serve_workers(
        worker_listener,
        coordinator.clone(),
        shutdown.clone(),
    ));

    let state = Arc::new(AppState {
        service: BuildService::new(store.clone(), storage, coordinator),
        bus,
    });
    let http_listener = TcpListener::bind(config.coordinator.http_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.coordinator.http_addr))?;
    tracing::info!(addr = %config.coordinator.http_addr, "HTTP API listening");

    let http_shutdown = shutdown.clone();
    axum::serve(http_listener, build_router(state))
        .with_graceful_shutdown(async move { http_shutdown.cancelled().await })
        .await
        .context("HTTP server failed")?;

    shutdown.cancel();
    cd.shutdown().await;
    let _ = tokio::join!(scheduler_task, workers_task);
    tracing::info!("Coordinator stopped");
    Ok(())
}
