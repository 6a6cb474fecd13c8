//! Shared domain types for the kiln build platform.
//!
//! Everything that crosses a process boundary lives here: the persisted
//! [`Build`] / [`Artifact`] rows, the ephemeral [`Task`] handed to workers,
//! the repository/application configuration the scheduler reads, and the
//! coordinator↔worker [`protocol`] messages.

pub mod application;
pub mod build;
pub mod protocol;
pub mod task;

pub use application::{Application, ApplicationBuildConfig, Repository, RepositoryAuth};
pub use build::{Artifact, Build, BuildStatus, is_valid_transition};
pub use protocol::{CoordinatorMessage, SettleReason, WorkerMessage};
pub use task::{BuildOptions, BuildSource, BuildTarget, Task};

/// Generate a fresh identifier for a persisted row.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}
