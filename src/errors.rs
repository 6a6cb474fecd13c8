//! Typed error hierarchy for kiln.
//!
//! One enum per seam:
//! - `StoreError` — build/artifact/application persistence
//! - `StorageError` — durable blob storage (logs, artifact tarballs)
//! - `PipelineError` — a single build pipeline run
//! - `WorkerError` — task acceptance on a builder worker
//! - `ServiceError` — user-facing build operations

use kiln_common::BuildStatus;
use thiserror::Error;

/// Errors from the build store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Build {id} not found")]
    BuildNotFound { id: String },

    #[error("Application {id} not found")]
    ApplicationNotFound { id: String },

    #[error("Repository {id} not found")]
    RepositoryNotFound { id: String },

    #[error("Invalid build status transition {from} -> {to}")]
    InvalidTransition { from: BuildStatus, to: BuildStatus },

    #[error("Database lock poisoned")]
    LockPoisoned,

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Corrupt row in {table}: {message}")]
    CorruptRow { table: &'static str, message: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from durable blob storage.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Object {key} not found")]
    NotFound { key: String },

    #[error("Invalid storage key '{key}'")]
    InvalidKey { key: String },

    #[error("Storage I/O failed for {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from one pipeline run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Build canceled")]
    Canceled,

    #[error("Failed to prepare build workspace: {0}")]
    Workspace(#[source] std::io::Error),

    #[error("Failed to clone {url} at {commit}: {message}")]
    Clone {
        url: String,
        commit: String,
        message: String,
    },

    #[error("Invalid build options: {0}")]
    InvalidOptions(String),

    #[error("Build engine error: {0}")]
    Engine(String),

    #[error("Failed to write build log: {0}")]
    Log(#[source] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PipelineError {
    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }
}

/// Errors from a worker's task acceptance path.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Builder unavailable: build {active} in progress")]
    Unavailable { active: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors surfaced to API callers.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}
