//! Git access for builds (shallow checkout of one commit) and for the
//! deployment loop (resolving branch heads on a remote).

use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use git2::build::CheckoutBuilder;
use git2::{Cred, Direction, FetchOptions, Oid, Remote, RemoteCallbacks};
use kiln_common::{Repository, RepositoryAuth};
use tokio_util::sync::CancellationToken;

use crate::errors::PipelineError;

/// Resolves repository credentials into libgit2 callbacks.
#[derive(Clone, Default)]
pub struct GitCredentials {
    default_ssh_key: Option<String>,
}

impl GitCredentials {
    pub fn new(default_ssh_key: Option<String>) -> Self {
        Self { default_ssh_key }
    }

    /// Read the fallback SSH key from disk when a path is configured.
    pub fn load(ssh_key_path: Option<&Path>) -> Result<Self> {
        let key = match ssh_key_path {
            Some(path) => Some(
                std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read SSH key {}", path.display()))?,
            ),
            None => None,
        };
        Ok(Self::new(key))
    }

    /// The key used for an SSH repository: its own, else the configured one.
    pub fn ssh_key(&self, auth: &RepositoryAuth) -> Option<String> {
        match auth {
            RepositoryAuth::Ssh {
                private_key: Some(key),
            } if !key.trim().is_empty() => Some(key.clone()),
            RepositoryAuth::Ssh { .. } => self.default_ssh_key.clone(),
            _ => None,
        }
    }

    pub fn callbacks(&self, auth: &RepositoryAuth) -> Result<RemoteCallbacks<'static>, git2::Error> {
        let mut callbacks = RemoteCallbacks::new();
        match auth {
            RepositoryAuth::None => {}
            RepositoryAuth::Basic { username, password } => {
                let (username, password) = (username.clone(), password.clone());
                let mut attempted = false;
                callbacks.credentials(move |_url, _user, _allowed| {
                    if std::mem::replace(&mut attempted, true) {
                        return Err(git2::Error::from_str("credentials rejected"));
                    }
                    Cred::userpass_plaintext(&username, &password)
                });
            }
            RepositoryAuth::Ssh { .. } => {
                let key = self
                    .ssh_key(auth)
                    .ok_or_else(|| git2::Error::from_str("no SSH key available for repository"))?;
                let mut attempted = false;
                callbacks.credentials(move |_url, user, _allowed| {
                    if std::mem::replace(&mut attempted, true) {
                        return Err(git2::Error::from_str("SSH key rejected"));
                    }
                    Cred::ssh_key_from_memory(user.unwrap_or("git"), None, &key, None)
                });
                // Build hosts are not pinned.
                callbacks.certificate_check(|_cert, _host| {
                    Ok(git2::CertificateCheckStatus::CertificateOk)
                });
            }
        }
        Ok(callbacks)
    }
}

/// Fetches the source tree of one commit.
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    async fn fetch(
        &self,
        repo: &Repository,
        commit: &str,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError>;
}

pub struct GitFetcher {
    credentials: GitCredentials,
}

impl GitFetcher {
    pub fn new(credentials: GitCredentials) -> Self {
        Self { credentials }
    }
}

#[async_trait]
impl SourceFetcher for GitFetcher {
    async fn fetch(
        &self,
        repo: &Repository,
        commit: &str,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError> {
        let url = repo.url.clone();
        let rev = commit.to_string();
        let dest = dest.to_path_buf();
        let auth = repo.auth.clone();
        let credentials = self.credentials.clone();
        let token = cancel.clone();

        let result = tokio::task::spawn_blocking(move || {
            shallow_checkout(&url, &rev, &dest, &credentials, &auth, &token)
        })
        .await
        .context("Clone task panicked")?;

        match result {
            Ok(()) => Ok(()),
            Err(_) if cancel.is_cancelled() => Err(PipelineError::Canceled),
            Err(e) => Err(PipelineError::Clone {
                url: repo.url.clone(),
                commit: commit.to_string(),
                message: e.message().to_string(),
            }),
        }
    }
}

/// Whether `url` goes through libgit2's local transport, which cannot do
/// shallow fetches.
fn is_local_url(url: &str) -> bool {
    if url.starts_with("file://") {
        return true;
    }
    if url.contains("://") {
        return false;
    }
    // scp-like `user@host:path`
    let scp_like = url
        .split_once(':')
        .is_some_and(|(host, _)| !host.is_empty() && !host.contains('/'));
    !scp_like
}

/// `git init` + `git fetch --depth 1 origin <commit>` + detached checkout.
///
/// Local repositories are fetched in full (all branches) instead.
fn shallow_checkout(
    url: &str,
    commit: &str,
    dest: &Path,
    credentials: &GitCredentials,
    auth: &RepositoryAuth,
    cancel: &CancellationToken,
) -> Result<(), git2::Error> {
    let repo = git2::Repository::init(dest)?;
    let mut remote = repo.remote("origin", url)?;

    let mut callbacks = credentials.callbacks(auth)?;
    let token = cancel.clone();
    // Returning false aborts the transfer.
    callbacks.transfer_progress(move |_progress| !token.is_cancelled());

    let mut options = FetchOptions::new();
    options.remote_callbacks(callbacks);
    if is_local_url(url) {
        remote.fetch(&["+refs/heads/*:refs/remotes/origin/*"], Some(&mut options), None)?;
    } else {
        options.depth(1);
        remote.fetch(&[commit], Some(&mut options), None)?;
    }

    let oid = Oid::from_str(commit)?;
    let target = repo.find_commit(oid)?;
    repo.checkout_tree(target.as_object(), Some(CheckoutBuilder::new().force()))?;
    repo.set_head_detached(oid)?;
    Ok(())
}

/// Looks up the commit a branch currently points at.
#[async_trait]
pub trait CommitResolver: Send + Sync {
    async fn resolve_head(&self, repo: &Repository, branch: &str) -> Result<Option<String>>;
}

/// `git ls-remote` through libgit2.
pub struct RemoteCommitResolver {
    credentials: GitCredentials,
}

impl RemoteCommitResolver {
    pub fn new(credentials: GitCredentials) -> Self {
        Self { credentials }
    }
}

#[async_trait]
impl CommitResolver for RemoteCommitResolver {
    async fn resolve_head(&self, repo: &Repository, branch: &str) -> Result<Option<String>> {
        let url = repo.url.clone();
        let auth = repo.auth.clone();
        let credentials = self.credentials.clone();
        let wanted = format!("refs/heads/{}", branch);

        tokio::task::spawn_blocking(move || -> Result<Option<String>> {
            let callbacks = credentials.callbacks(&auth)?;
            let mut remote = Remote::create_detached(url.as_str())?;
            let connection = remote
                .connect_auth(Direction::Fetch, Some(callbacks), None)
                .with_context(|| format!("Failed to list refs of {}", url))?;
            let head = connection
                .list()?
                .iter()
                .find(|head| head.name() == wanted)
                .map(|head| head.oid().to_string());
            Ok(head)
        })
        .await
        .context("ls-remote task panicked")?
    }
}
