use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use kiln_common::{
    Application, ApplicationBuildConfig, Artifact, Build, BuildStatus, Repository, RepositoryAuth,
    is_valid_transition,
};
use rusqlite::{Connection, OptionalExtension, params};

use super::BuildStore;
use crate::errors::StoreError;

/// Async-safe handle to the SQLite store.
///
/// Wraps `Db` behind `Arc<Mutex>` and runs every query on tokio's blocking
/// pool via `spawn_blocking`.
#[derive(Clone)]
pub struct SqliteStore {
    inner: Arc<std::sync::Mutex<Db>>,
}

impl SqliteStore {
    pub fn new(db: Db) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    pub fn open(path: &Path, busy_timeout: Duration) -> Result<Self, StoreError> {
        Ok(Self::new(Db::open(path, busy_timeout)?))
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Ok(Self::new(Db::open_in_memory()?))
    }

    /// Run a closure against the database on a blocking thread.
    async fn call<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&Db) -> Result<R, StoreError> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|_| StoreError::LockPoisoned)?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }
}

pub struct Db {
    conn: Connection,
}

fn ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(table: &'static str, value: Option<String>) -> Result<Option<DateTime<Utc>>, StoreError> {
    value
        .map(|s| {
            DateTime::parse_from_rfc3339(&s)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| StoreError::CorruptRow {
                    table,
                    message: format!("bad timestamp '{}': {}", s, e),
                })
        })
        .transpose()
}

const BUILD_COLUMNS: &str = "b.id, b.application_id, b.commit_hash, b.status, b.retriable,
     b.started_at, b.updated_at, b.finished_at,
     a.id, a.size, a.created_at, a.deleted_at
     FROM builds b LEFT JOIN artifacts a ON a.build_id = b.id";

const APPLICATION_COLUMNS: &str = "ap.id, ap.name, ap.repository_id, ap.ref_name, ap.commit_hash,
     ap.environment_id, ap.static_build, ap.base_image_name, ap.dockerfile_name,
     ap.build_cmd, ap.entrypoint_cmd, ap.artifact_path
     FROM applications ap";

impl Db {
    /// Open (or create) the database file, enable WAL and run migrations.
    pub fn open(path: &Path, busy_timeout: Duration) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        tracing::debug!(path = %path.display(), journal_mode = %mode, "Opened database");
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let db = Self {
            conn: Connection::open_in_memory()?,
        };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<(), StoreError> {
        self.conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        self.run_migrations()
    }

    fn run_migrations(&self) -> Result<(), StoreError> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS repositories (
                id TEXT PRIMARY KEY,
                url TEXT NOT NULL,
                auth TEXT NOT NULL DEFAULT '{\"method\":\"none\"}'
            );

            CREATE TABLE IF NOT EXISTS applications (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                repository_id TEXT NOT NULL REFERENCES repositories(id) ON DELETE CASCADE,
                ref_name TEXT NOT NULL,
                commit_hash TEXT,
                environment_id TEXT,
                static_build INTEGER NOT NULL DEFAULT 0,
                base_image_name TEXT,
                dockerfile_name TEXT,
                build_cmd TEXT NOT NULL DEFAULT '',
                entrypoint_cmd TEXT NOT NULL DEFAULT '',
                artifact_path TEXT NOT NULL DEFAULT ''
            );

            CREATE TABLE IF NOT EXISTS builds (
                id TEXT PRIMARY KEY,
                application_id TEXT NOT NULL,
                commit_hash TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'queued',
                retriable INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                started_at TEXT,
                updated_at TEXT,
                finished_at TEXT
            );

            CREATE TABLE IF NOT EXISTS artifacts (
                id TEXT PRIMARY KEY,
                build_id TEXT NOT NULL UNIQUE REFERENCES builds(id) ON DELETE CASCADE,
                size INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                deleted_at TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_builds_status ON builds(status, created_at);
            CREATE INDEX IF NOT EXISTS idx_builds_application ON builds(application_id);
            CREATE INDEX IF NOT EXISTS idx_applications_repo ON applications(repository_id, ref_name);
            ",
        )?;
        Ok(())
    }

    // ── Builds ────────────────────────────────────────────────────────

    pub fn create_build(&self, build: &Build) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO builds (id, application_id, commit_hash, status, retriable, created_at, started_at, updated_at, finished_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                build.id,
                build.application_id,
                build.commit,
                build.status.as_str(),
                build.retriable,
                ts(Utc::now()),
                build.started_at.map(ts),
                build.updated_at.map(ts),
                build.finished_at.map(ts),
            ],
        )?;
        Ok(())
    }

    pub fn get_build(&self, id: &str) -> Result<Option<Build>, StoreError> {
        let sql = format!("SELECT {} WHERE b.id = ?1", BUILD_COLUMNS);
        let row = self
            .conn
            .query_row(&sql, params![id], BuildRow::from_row)
            .optional()?;
        row.map(BuildRow::into_build).transpose()
    }

    pub fn list_builds(&self, status: BuildStatus) -> Result<Vec<Build>, StoreError> {
        let sql = format!(
            "SELECT {} WHERE b.status = ?1 ORDER BY b.created_at, b.rowid",
            BUILD_COLUMNS
        );
        self.query_builds(&sql, status.as_str())
    }

    pub fn list_application_builds(&self, application_id: &str) -> Result<Vec<Build>, StoreError> {
        let sql = format!(
            "SELECT {} WHERE b.application_id = ?1 ORDER BY b.created_at, b.rowid",
            BUILD_COLUMNS
        );
        self.query_builds(&sql, application_id)
    }

    fn query_builds(&self, sql: &str, arg: &str) -> Result<Vec<Build>, StoreError> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(params![arg], BuildRow::from_row)?;
        let mut builds = Vec::new();
        for row in rows {
            builds.push(row?.into_build()?);
        }
        Ok(builds)
    }

    pub fn update_build_if(
        &self,
        id: &str,
        from: BuildStatus,
        to: BuildStatus,
    ) -> Result<bool, StoreError> {
        if !is_valid_transition(&from, &to) {
            return Err(StoreError::InvalidTransition { from, to });
        }
        let now = ts(Utc::now());
        let started = (to == BuildStatus::Building).then(|| now.clone());
        let finished = to.is_finished().then(|| now.clone());
        let changed = self.conn.execute(
            "UPDATE builds
             SET status = ?1,
                 updated_at = ?2,
                 started_at = COALESCE(?3, started_at),
                 finished_at = COALESCE(?4, finished_at)
             WHERE id = ?5 AND status = ?6",
            params![to.as_str(), now, started, finished, id, from.as_str()],
        )?;
        Ok(changed == 1)
    }

    pub fn touch_build(&self, id: &str) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE builds SET updated_at = ?1 WHERE id = ?2 AND status = 'building'",
            params![ts(Utc::now()), id],
        )?;
        Ok(())
    }

    pub fn set_retriable(&self, id: &str, retriable: bool) -> Result<(), StoreError> {
        let changed = self.conn.execute(
            "UPDATE builds SET retriable = ?1 WHERE id = ?2",
            params![retriable, id],
        )?;
        if changed == 0 {
            return Err(StoreError::BuildNotFound { id: id.to_string() });
        }
        Ok(())
    }

    // ── Artifacts ─────────────────────────────────────────────────────

    pub fn create_artifact(&self, artifact: &Artifact) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO artifacts (id, build_id, size, created_at, deleted_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                artifact.id,
                artifact.build_id,
                artifact.size,
                ts(artifact.created_at),
                artifact.deleted_at.map(ts),
            ],
        )?;
        Ok(())
    }

    pub fn soft_delete_artifact(&self, id: &str) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE artifacts SET deleted_at = ?1 WHERE id = ?2 AND deleted_at IS NULL",
            params![ts(Utc::now()), id],
        )?;
        Ok(())
    }

    // ── Repositories & applications ───────────────────────────────────

    pub fn create_repository(&self, repository: &Repository) -> Result<(), StoreError> {
        let auth = serde_json::to_string(&repository.auth).context("Failed to encode repository auth")?;
        self.conn.execute(
            "INSERT INTO repositories (id, url, auth) VALUES (?1, ?2, ?3)",
            params![repository.id, repository.url, auth],
        )?;
        Ok(())
    }

    pub fn get_repository(&self, id: &str) -> Result<Option<Repository>, StoreError> {
        let row = self
            .conn
            .query_row(
                "SELECT id, url, auth FROM repositories WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?;
        let Some((id, url, auth)) = row else {
            return Ok(None);
        };
        let auth: RepositoryAuth =
            serde_json::from_str(&auth).map_err(|e| StoreError::CorruptRow {
                table: "repositories",
                message: format!("bad auth JSON: {}", e),
            })?;
        Ok(Some(Repository { id, url, auth }))
    }

    pub fn create_application(&self, app: &Application) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO applications (id, name, repository_id, ref_name, commit_hash, environment_id,
                static_build, base_image_name, dockerfile_name, build_cmd, entrypoint_cmd, artifact_path)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                app.id,
                app.name,
                app.repository_id,
                app.ref_name,
                app.commit,
                app.environment_id,
                app.build.static_build,
                app.build.base_image_name,
                app.build.dockerfile_name,
                app.build.build_cmd,
                app.build.entrypoint_cmd,
                app.build.artifact_path,
            ],
        )?;
        Ok(())
    }

    pub fn get_application(&self, id: &str) -> Result<Option<Application>, StoreError> {
        let sql = format!("SELECT {} WHERE ap.id = ?1", APPLICATION_COLUMNS);
        Ok(self
            .conn
            .query_row(&sql, params![id], application_from_row)
            .optional()?)
    }

    pub fn find_applications(
        &self,
        repo_url: &str,
        ref_name: &str,
    ) -> Result<Vec<Application>, StoreError> {
        let sql = format!(
            "SELECT {} JOIN repositories r ON r.id = ap.repository_id
             WHERE r.url = ?1 AND ap.ref_name = ?2 ORDER BY ap.id",
            APPLICATION_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![repo_url, ref_name], application_from_row)?;
        let mut apps = Vec::new();
        for row in rows {
            apps.push(row?);
        }
        Ok(apps)
    }

    pub fn update_application_commit(&self, id: &str, commit: &str) -> Result<(), StoreError> {
        let changed = self.conn.execute(
            "UPDATE applications SET commit_hash = ?1 WHERE id = ?2",
            params![commit, id],
        )?;
        if changed == 0 {
            return Err(StoreError::ApplicationNotFound { id: id.to_string() });
        }
        Ok(())
    }
}

fn application_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Application> {
    Ok(Application {
        id: row.get(0)?,
        name: row.get(1)?,
        repository_id: row.get(2)?,
        ref_name: row.get(3)?,
        commit: row.get(4)?,
        environment_id: row.get(5)?,
        build: ApplicationBuildConfig {
            static_build: row.get(6)?,
            base_image_name: row.get(7)?,
            dockerfile_name: row.get(8)?,
            build_cmd: row.get(9)?,
            entrypoint_cmd: row.get(10)?,
            artifact_path: row.get(11)?,
        },
    })
}

/// Raw build row before status/timestamp parsing.
struct BuildRow {
    id: String,
    application_id: String,
    commit: String,
    status: String,
    retriable: bool,
    started_at: Option<String>,
    updated_at: Option<String>,
    finished_at: Option<String>,
    artifact_id: Option<String>,
    artifact_size: Option<i64>,
    artifact_created_at: Option<String>,
    artifact_deleted_at: Option<String>,
}

impl BuildRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            application_id: row.get(1)?,
            commit: row.get(2)?,
            status: row.get(3)?,
            retriable: row.get(4)?,
            started_at: row.get(5)?,
            updated_at: row.get(6)?,
            finished_at: row.get(7)?,
            artifact_id: row.get(8)?,
            artifact_size: row.get(9)?,
            artifact_created_at: row.get(10)?,
            artifact_deleted_at: row.get(11)?,
        })
    }

    fn into_build(self) -> Result<Build, StoreError> {
        let status = BuildStatus::from_str(&self.status).map_err(|message| {
            StoreError::CorruptRow {
                table: "builds",
                message,
            }
        })?;
        let artifact = match (self.artifact_id, self.artifact_created_at) {
            (Some(id), Some(created_at)) => Some(Artifact {
                id,
                build_id: self.id.clone(),
                size: self.artifact_size.unwrap_or_default(),
                created_at: parse_ts("artifacts", Some(created_at))?.unwrap_or_default(),
                deleted_at: parse_ts("artifacts", self.artifact_deleted_at)?,
            }),
            _ => None,
        };
        Ok(Build {
            id: self.id,
            application_id: self.application_id,
            commit: self.commit,
            status,
            retriable: self.retriable,
            started_at: parse_ts("builds", self.started_at)?,
            updated_at: parse_ts("builds", self.updated_at)?,
            finished_at: parse_ts("builds", self.finished_at)?,
            artifact,
        })
    }
}

#[async_trait]
impl BuildStore for SqliteStore {
    async fn create_build(&self, build: &Build) -> Result<(), StoreError> {
        let build = build.clone();
        self.call(move |db| db.create_build(&build)).await
    }

    async fn get_build(&self, id: &str) -> Result<Option<Build>, StoreError> {
        let id = id.to_string();
        self.call(move |db| db.get_build(&id)).await
    }

    async fn list_builds(&self, status: BuildStatus) -> Result<Vec<Build>, StoreError> {
        self.call(move |db| db.list_builds(status)).await
    }

    async fn list_application_builds(
        &self,
        application_id: &str,
    ) -> Result<Vec<Build>, StoreError> {
        let application_id = application_id.to_string();
        self.call(move |db| db.list_application_builds(&application_id))
            .await
    }

    async fn update_build_if(
        &self,
        id: &str,
        from: BuildStatus,
        to: BuildStatus,
    ) -> Result<bool, StoreError> {
        let id = id.to_string();
        self.call(move |db| db.update_build_if(&id, from, to)).await
    }

    async fn touch_build(&self, id: &str) -> Result<(), StoreError> {
        let id = id.to_string();
        self.call(move |db| db.touch_build(&id)).await
    }

    async fn set_retriable(&self, id: &str, retriable: bool) -> Result<(), StoreError> {
        let id = id.to_string();
        self.call(move |db| db.set_retriable(&id, retriable)).await
    }

    async fn create_artifact(&self, artifact: &Artifact) -> Result<(), StoreError> {
        let artifact = artifact.clone();
        self.call(move |db| db.create_artifact(&artifact)).await
    }

    async fn soft_delete_artifact(&self, id: &str) -> Result<(), StoreError> {
        let id = id.to_string();
        self.call(move |db| db.soft_delete_artifact(&id)).await
    }

    async fn create_repository(&self, repository: &Repository) -> Result<(), StoreError> {
        let repository = repository.clone();
        self.call(move |db| db.create_repository(&repository)).await
    }

    async fn get_repository(&self, id: &str) -> Result<Option<Repository>, StoreError> {
        let id = id.to_string();
        self.call(move |db| db.get_repository(&id)).await
    }

    async fn create_application(&self, application: &Application) -> Result<(), StoreError> {
        let application = application.clone();
        self.call(move |db| db.create_application(&application))
            .await
    }

    async fn get_application(&self, id: &str) -> Result<Option<Application>, StoreError> {
        let id = id.to_string();
        self.call(move |db| db.get_application(&id)).await
    }

    async fn find_applications(
        &self,
        repo_url: &str,
        ref_name: &str,
    ) -> Result<Vec<Application>, StoreError> {
        let repo_url = repo_url.to_string();
        let ref_name = ref_name.to_string();
        self.call(move |db| db.find_applications(&repo_url, &ref_name))
            .await
    }

    async fn update_application_commit(&self, id: &str, commit: &str) -> Result<(), StoreError> {
        let id = id.to_string();
        let commit = commit.to_string();
        self.call(move |db| db.update_application_commit(&id, &commit))
            .await
    }
}
