//! Durable blob storage for build logs and artifact tarballs.

use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;

use crate::errors::StorageError;

/// Key under which a build's log is persisted.
pub fn build_log_key(build_id: &str) -> String {
    format!("buildlogs/{}", build_id)
}

/// Key under which a static artifact tarball is persisted.
pub fn artifact_key(artifact_id: &str) -> String {
    format!("artifacts/{}.tar", artifact_id)
}

#[async_trait]
pub trait Storage: Send + Sync {
    async fn save(&self, key: &str, data: Vec<u8>) -> Result<(), StorageError>;

    /// Persist the contents of a local file.
    async fn save_file(&self, key: &str, src: &Path) -> Result<(), StorageError> {
        let data = tokio::fs::read(src).await.map_err(|source| StorageError::Io {
            key: key.to_string(),
            source,
        })?;
        self.save(key, data).await
    }

    async fn open(&self, key: &str) -> Result<Vec<u8>, StorageError>;

    async fn delete(&self, key: &str) -> Result<(), StorageError>;
}

/// Storage rooted at a local directory. Keys map to relative paths.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        let rel = Path::new(key);
        let valid = !key.is_empty()
            && rel
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !valid {
            return Err(StorageError::InvalidKey {
                key: key.to_string(),
            });
        }
        Ok(self.root.join(rel))
    }

    async fn ensure_parent(&self, key: &str, path: &Path) -> Result<(), StorageError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| io_error(key, source))?;
        }
        Ok(())
    }
}

fn io_error(key: &str, source: std::io::Error) -> StorageError {
    if source.kind() == ErrorKind::NotFound {
        StorageError::NotFound {
            key: key.to_string(),
        }
    } else {
        StorageError::Io {
            key: key.to_string(),
            source,
        }
    }
}

#[async_trait]
impl Storage for LocalStorage {
    async fn save(&self, key: &str, data: Vec<u8>) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        self.ensure_parent(key, &path).await?;
        // Write beside the target then rename so readers never see a partial object.
        let tmp = path.with_extension("partial");
        tokio::fs::write(&tmp, data)
            .await
            .map_err(|source| io_error(key, source))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|source| io_error(key, source))
    }

    async fn save_file(&self, key: &str, src: &Path) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        self.ensure_parent(key, &path).await?;
        let tmp = path.with_extension("partial");
        tokio::fs::copy(src, &tmp)
            .await
            .map_err(|source| io_error(key, source))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|source| io_error(key, source))
    }

    async fn open(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.path_for(key)?;
        tokio::fs::read(&path)
            .await
            .map_err(|source| io_error(key, source))
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        tokio::fs::remove_file(&path)
            .await
            .map_err(|source| io_error(key, source))
    }
}
