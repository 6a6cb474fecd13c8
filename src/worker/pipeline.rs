//! One build, start to finish: clone, build, package, persist.

use std::path::Path;
use std::sync::Arc;

use kiln_common::{Artifact, BuildStatus, BuildTarget, Repository, Task};
use tempfile::{NamedTempFile, TempDir};
use tokio_util::sync::CancellationToken;

use super::dockerfile;
use super::engine::{BuildEngine, BuildRequest};
use super::log_writer::BuildLogWriter;
use crate::errors::PipelineError;
use crate::git::SourceFetcher;
use crate::storage::{self, Storage};
use crate::store::BuildStore;

/// Collaborators a pipeline run needs.
#[derive(Clone)]
pub struct PipelineDeps {
    pub store: Arc<dyn BuildStore>,
    pub storage: Arc<dyn Storage>,
    pub engine: Arc<dyn BuildEngine>,
    pub fetcher: Arc<dyn SourceFetcher>,
}

/// Temp files owned by one build. Dropping it removes whatever is left.
pub struct Workspace {
    clone_dir: TempDir,
    log_file: NamedTempFile,
    artifact_file: Option<NamedTempFile>,
}

impl Workspace {
    pub fn create(root: &Path, build_id: &str, static_build: bool) -> std::io::Result<Self> {
        std::fs::create_dir_all(root)?;
        let log_file = tempfile::Builder::new()
            .prefix(&format!("kiln-log-{}-", build_id))
            .tempfile_in(root)?;
        let artifact_file = if static_build {
            Some(
                tempfile::Builder::new()
                    .prefix(&format!("kiln-artifact-{}-", build_id))
                    .suffix(".tar")
                    .tempfile_in(root)?,
            )
        } else {
            None
        };
        let clone_dir = tempfile::Builder::new()
            .prefix(&format!("kiln-clone-{}-", build_id))
            .tempdir_in(root)?;
        Ok(Self {
            clone_dir,
            log_file,
            artifact_file,
        })
    }

    pub fn clone_dir(&self) -> &Path {
        self.clone_dir.path()
    }

    pub fn log_path(&self) -> &Path {
        self.log_file.path()
    }

    pub fn artifact_path(&self) -> Option<&Path> {
        self.artifact_file.as_ref().map(|f| f.path())
    }
}

/// Clone the commit and hand it to the engine.
pub async fn run(
    deps: &PipelineDeps,
    task: &Task,
    repo: &Repository,
    workspace: &Workspace,
    log: &mut BuildLogWriter,
    cancel: &CancellationToken,
) -> Result<(), PipelineError> {
    if cancel.is_cancelled() {
        return Err(PipelineError::Canceled);
    }

    log.line(&format!(
        "Cloning {} at {}",
        repo.url, task.source.commit
    ))
    .await
    .map_err(PipelineError::Log)?;
    deps.fetcher
        .fetch(repo, &task.source.commit, workspace.clone_dir(), cancel)
        .await?;

    if cancel.is_cancelled() {
        return Err(PipelineError::Canceled);
    }

    let dockerfile =
        dockerfile::prepare(workspace.clone_dir(), &task.options, task.is_static()).await?;
    let request = BuildRequest {
        build_id: &task.build_id,
        context: workspace.clone_dir(),
        dockerfile: &dockerfile,
    };

    match &task.target {
        BuildTarget::Image { name, tag } => {
            let image_ref = format!("{}:{}", name, tag);
            log.line(&format!("Building image {}", image_ref))
                .await
                .map_err(PipelineError::Log)?;
            deps.engine
                .build_image(request, &image_ref, log, cancel)
                .await
        }
        BuildTarget::Static => {
            let artifact_path = dockerfile::artifact_path(&task.options)?;
            let dest = workspace.artifact_path().ok_or_else(|| {
                PipelineError::InvalidOptions("static build without artifact file".into())
            })?;
            log.line("Building static artifact")
                .await
                .map_err(PipelineError::Log)?;
            deps.engine
                .build_static(request, &artifact_path, dest, log, cancel)
                .await
        }
    }
}

/// Map a pipeline result to the build's final status. A fired cancellation
/// token wins over whatever error the engine reported.
pub fn classify(result: &Result<(), PipelineError>, cancel: &CancellationToken) -> BuildStatus {
    match result {
        Ok(()) => BuildStatus::Succeeded,
        Err(e) if e.is_canceled() || cancel.is_cancelled() => BuildStatus::Canceled,
        Err(_) => BuildStatus::Failed,
    }
}

/// Persist outputs and settle the build row. Errors are logged, never
/// returned: the build settles even if its log or artifact could not be saved.
pub async fn finalize(deps: &PipelineDeps, task: &Task, workspace: Workspace, status: BuildStatus) {
    let build_id = task.build_id.as_str();

    if let Err(e) = deps
        .storage
        .save_file(&storage::build_log_key(build_id), workspace.log_path())
        .await
    {
        tracing::error!(build_id = %build_id, error = %e, "Failed to save build log");
    }

    if task.is_static() && status == BuildStatus::Succeeded {
        if let Some(path) = workspace.artifact_path() {
            if let Err(e) = save_artifact(deps, build_id, path).await {
                tracing::error!(build_id = %build_id, error = %e, "Failed to save artifact");
            }
        }
    }

    let Workspace {
        clone_dir,
        log_file,
        artifact_file,
    } = workspace;
    if let Err(e) = clone_dir.close() {
        tracing::warn!(build_id = %build_id, error = %e, "Failed to remove clone directory");
    }
    drop(log_file);
    drop(artifact_file);

    settle(deps, build_id, status).await;
}

/// Move the build row out of `Building`.
pub async fn settle(deps: &PipelineDeps, build_id: &str, status: BuildStatus) {
    match deps.store.finish_build(build_id, status).await {
        Ok(true) => {}
        Ok(false) => {
            tracing::warn!(build_id = %build_id, status = %status, "Build was no longer building at settlement")
        }
        Err(e) => {
            tracing::error!(build_id = %build_id, error = %e, "Failed to record build status")
        }
    }
}

async fn save_artifact(deps: &PipelineDeps, build_id: &str, path: &Path) -> anyhow::Result<()> {
    let size = tokio::fs::metadata(path).await?.len();
    let artifact = Artifact::new(build_id, i64::try_from(size)?);
    deps.store.create_artifact(&artifact).await?;
    deps.storage
        .save_file(&storage::artifact_key(&artifact.id), path)
        .await?;
    tracing::info!(build_id = %build_id, artifact_id = %artifact.id, size, "Saved artifact");
    Ok(())
}
