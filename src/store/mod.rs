//! Persistence for builds, artifacts, repositories and applications.

mod sqlite;

pub use sqlite::{Db, SqliteStore};

use async_trait::async_trait;
use kiln_common::{Application, Artifact, Build, BuildStatus, Repository};

use crate::errors::StoreError;

#[async_trait]
pub trait BuildStore: Send + Sync {
    async fn create_build(&self, build: &Build) -> Result<(), StoreError>;

    async fn get_build(&self, id: &str) -> Result<Option<Build>, StoreError>;

    /// Builds in `status`, oldest first.
    async fn list_builds(&self, status: BuildStatus) -> Result<Vec<Build>, StoreError>;

    async fn list_application_builds(&self, application_id: &str)
    -> Result<Vec<Build>, StoreError>;

    /// Compare-and-set on status. Returns `false` when the row was not in
    /// `from` (another writer got there first). Entering `Building` stamps
    /// `started_at`; entering a terminal status stamps `finished_at`.
    async fn update_build_if(
        &self,
        id: &str,
        from: BuildStatus,
        to: BuildStatus,
    ) -> Result<bool, StoreError>;

    /// Heartbeat: refresh `updated_at` of a build that is still building.
    async fn touch_build(&self, id: &str) -> Result<(), StoreError>;

    async fn set_retriable(&self, id: &str, retriable: bool) -> Result<(), StoreError>;

    async fn create_artifact(&self, artifact: &Artifact) -> Result<(), StoreError>;

    async fn soft_delete_artifact(&self, id: &str) -> Result<(), StoreError>;

    async fn create_repository(&self, repository: &Repository) -> Result<(), StoreError>;

    async fn get_repository(&self, id: &str) -> Result<Option<Repository>, StoreError>;

    async fn create_application(&self, application: &Application) -> Result<(), StoreError>;

    async fn get_application(&self, id: &str) -> Result<Option<Application>, StoreError>;

    /// Applications tracking `ref_name` of the repository at `repo_url`.
    async fn find_applications(
        &self,
        repo_url: &str,
        ref_name: &str,
    ) -> Result<Vec<Application>, StoreError>;

    async fn update_application_commit(&self, id: &str, commit: &str) -> Result<(), StoreError>;

    /// Settle a running build.
    async fn finish_build(&self, id: &str, status: BuildStatus) -> Result<bool, StoreError> {
        self.update_build_if(id, BuildStatus::Building, status).await
    }
}
