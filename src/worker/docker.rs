//! [`BuildEngine`] backed by the Docker Engine API.

use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use bollard::Docker;
use bollard::auth::DockerCredentials;
use bollard::models::ContainerCreateBody;
use bollard::query_parameters::{
    BuildImageOptionsBuilder, CreateContainerOptionsBuilder, DownloadFromContainerOptionsBuilder,
    PruneBuildOptions, PushImageOptionsBuilder, RemoveContainerOptionsBuilder,
    RemoveImageOptionsBuilder,
};
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use super::engine::{BuildEngine, BuildRequest};
use super::log_writer::BuildLogWriter;
use crate::config::RegistryConfig;
use crate::errors::PipelineError;

pub struct DockerEngine {
    docker: Docker,
    credentials: Option<DockerCredentials>,
}

fn engine_err(e: bollard::errors::Error) -> PipelineError {
    PipelineError::Engine(e.to_string())
}

/// Split `registry:port/name:tag` into name and tag. Missing tag → `latest`.
pub fn split_image_ref(image_ref: &str) -> (&str, &str) {
    match image_ref.rsplit_once(':') {
        Some((name, tag)) if !tag.contains('/') => (name, tag),
        _ => (image_ref, "latest"),
    }
}

/// Tar the checkout for the daemon, leaving out `.git`.
fn tar_context(dir: &Path) -> std::io::Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    builder.follow_symlinks(false);
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        if name == ".git" {
            continue;
        }
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            builder.append_dir_all(&name, &path)?;
        } else {
            builder.append_path_with_name(&path, &name)?;
        }
    }
    builder.into_inner()
}

impl DockerEngine {
    /// Connect using `DOCKER_HOST` or the platform default socket.
    pub fn connect(registry: &RegistryConfig) -> anyhow::Result<Self> {
        let docker =
            Docker::connect_with_local_defaults().context("Failed to connect to Docker daemon")?;
        let credentials = registry.username.as_ref().map(|username| DockerCredentials {
            username: Some(username.clone()),
            password: registry.password.clone(),
            serveraddress: registry.address.clone(),
            ..Default::default()
        });
        Ok(Self {
            docker,
            credentials,
        })
    }

    async fn run_build(
        &self,
        request: BuildRequest<'_>,
        tag: &str,
        log: &mut BuildLogWriter,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError> {
        let dir = request.context.to_path_buf();
        let context = tokio::task::spawn_blocking(move || tar_context(&dir))
            .await
            .context("Context tar task panicked")?
            .map_err(PipelineError::Workspace)?;

        let options = BuildImageOptionsBuilder::default()
            .dockerfile(request.dockerfile)
            .t(tag)
            .rm(true)
            .build();
        let mut stream = self.docker.build_image(
            options,
            None,
            Some(bollard::body_full(bytes::Bytes::from(context))),
        );

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(PipelineError::Canceled),
                item = stream.next() => match item {
                    None => return Ok(()),
                    Some(Ok(info)) => {
                        if let Some(detail) = info.error_detail {
                            return Err(PipelineError::Engine(
                                detail.message.unwrap_or_else(|| "image build failed".into()),
                            ));
                        }
                        if let Some(text) = info.stream {
                            log.write(&text).await.map_err(PipelineError::Log)?;
                        } else if let Some(status) = info.status {
                            log.line(&status).await.map_err(PipelineError::Log)?;
                        }
                    }
                    Some(Err(e)) => return Err(engine_err(e)),
                },
            }
        }
    }

    async fn push(
        &self,
        image_ref: &str,
        log: &mut BuildLogWriter,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError> {
        let (name, tag) = split_image_ref(image_ref);
        let options = PushImageOptionsBuilder::default().tag(tag).build();
        let mut stream = self
            .docker
            .push_image(name, Some(options), self.credentials.clone());

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(PipelineError::Canceled),
                item = stream.next() => match item {
                    None => return Ok(()),
                    Some(Ok(info)) => {
                        if let Some(detail) = info.error_detail {
                            return Err(PipelineError::Engine(
                                detail.message.unwrap_or_else(|| "image push failed".into()),
                            ));
                        }
                        if let Some(status) = info.status {
                            log.line(&status).await.map_err(PipelineError::Log)?;
                        }
                    }
                    Some(Err(e)) => return Err(engine_err(e)),
                },
            }
        }
    }

    async fn export(
        &self,
        build_id: &str,
        image: &str,
        artifact_path: &str,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError> {
        let name = format!("kiln-export-{}", build_id);
        let body = ContainerCreateBody {
            image: Some(image.to_string()),
            // Never started; scratch images need some command to be creatable.
            cmd: Some(vec!["kiln-export".to_string()]),
            ..Default::default()
        };
        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptionsBuilder::default().name(&name).build()),
                body,
            )
            .await
            .map_err(engine_err)?;

        let copied = self
            .copy_out(&created.id, artifact_path, dest, cancel)
            .await;

        let remove = RemoveContainerOptionsBuilder::default().force(true).build();
        if let Err(e) = self.docker.remove_container(&created.id, Some(remove)).await {
            tracing::warn!(build_id = %build_id, error = %e, "Failed to remove export container");
        }
        copied
    }

    async fn copy_out(
        &self,
        container_id: &str,
        artifact_path: &str,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError> {
        let options = DownloadFromContainerOptionsBuilder::default()
            .path(artifact_path)
            .build();
        let mut stream = self
            .docker
            .download_from_container(container_id, Some(options));
        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(PipelineError::Workspace)?;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(PipelineError::Canceled),
                chunk = stream.next() => match chunk {
                    None => break,
                    Some(Ok(bytes)) => file.write_all(&bytes).await.map_err(PipelineError::Workspace)?,
                    Some(Err(e)) => return Err(engine_err(e)),
                },
            }
        }
        file.flush().await.map_err(PipelineError::Workspace)?;
        Ok(())
    }
}

#[async_trait]
impl BuildEngine for DockerEngine {
    async fn build_image(
        &self,
        request: BuildRequest<'_>,
        image_ref: &str,
        log: &mut BuildLogWriter,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError> {
        self.run_build(request, image_ref, log, cancel).await?;
        log.line(&format!("Pushing {}", image_ref))
            .await
            .map_err(PipelineError::Log)?;
        self.push(image_ref, log, cancel).await
    }

    async fn build_static(
        &self,
        request: BuildRequest<'_>,
        artifact_path: &str,
        dest: &Path,
        log: &mut BuildLogWriter,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError> {
        let tag = format!("kiln-static:{}", request.build_id);
        self.run_build(request, &tag, log, cancel).await?;
        log.line(&format!("Exporting {}", artifact_path))
            .await
            .map_err(PipelineError::Log)?;

        let exported = self
            .export(request.build_id, &tag, artifact_path, dest, cancel)
            .await;

        let remove = RemoveImageOptionsBuilder::default().force(true).build();
        if let Err(e) = self.docker.remove_image(&tag, Some(remove), None).await {
            tracing::warn!(build_id = %request.build_id, error = %e, "Failed to remove static build image");
        }
        exported
    }

    async fn prune_cache(&self) -> anyhow::Result<()> {
        let response = self
            .docker
            .prune_build(None::<PruneBuildOptions>)
            .await
            .context("Failed to prune build cache")?;
        tracing::debug!(
            reclaimed = response.space_reclaimed.unwrap_or_default(),
            "Build cache pruned"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_split_image_ref() {
        assert_eq!(
            split_image_ref("localhost:5001/kiln-app1:b42"),
            ("localhost:5001/kiln-app1", "b42")
        );
        assert_eq!(
            split_image_ref("localhost:5001/kiln-app1"),
            ("localhost:5001/kiln-app1", "latest")
        );
        assert_eq!(split_image_ref("alpine:3.20"), ("alpine", "3.20"));
    }

    #[test]
    fn test_tar_context_skips_git_dir() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join(".git/objects")).unwrap();
        std::fs::write(dir.path().join(".git/HEAD"), "ref").unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/main.c"), "int main(){}").unwrap();
        std::fs::write(dir.path().join("kiln.Dockerfile"), "FROM scratch\n").unwrap();

        let data = tar_context(dir.path()).unwrap();
        let mut archive = tar::Archive::new(&data[..]);
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect();

        assert!(names.iter().any(|n| n == "kiln.Dockerfile"));
        assert!(names.iter().any(|n| n.ends_with("src/main.c")));
        assert!(!names.iter().any(|n| n.starts_with(".git")));
    }
}
