use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Top-level `kiln.toml`.
///
/// Every section and field has a default, so an empty or missing file yields
/// a working single-host setup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KilnConfig {
    pub database: DatabaseConfig,
    pub storage: StorageConfig,
    pub coordinator: CoordinatorConfig,
    pub worker: WorkerConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite file shared by the coordinator and local workers.
    pub path: PathBuf,
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/kiln.db"),
            busy_timeout_ms: 5_000,
        }
    }
}

impl DatabaseConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root directory for build logs and artifact tarballs.
    pub root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("data/storage"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Address workers dial.
    pub listen_addr: SocketAddr,
    /// Address of the HTTP API.
    pub http_addr: SocketAddr,
    /// Registry host that image names are prefixed with.
    pub image_registry: String,
    pub image_prefix: String,
    /// Outbound queue depth per worker connection. A full queue drops.
    pub worker_queue_size: usize,
    /// Periodic scheduler pass, in seconds, on top of idle/dispatch signals.
    pub dispatch_interval_secs: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 5000)),
            http_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            image_registry: "localhost:5001".to_string(),
            image_prefix: "kiln-".to_string(),
            worker_queue_size: 16,
            dispatch_interval_secs: 10,
        }
    }
}

impl CoordinatorConfig {
    pub fn dispatch_interval(&self) -> Duration {
        Duration::from_secs(self.dispatch_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Reported in the handshake. Generated when unset.
    pub worker_id: Option<String>,
    pub coordinator_addr: String,
    /// Parent directory for per-build temp files. System temp dir when unset.
    pub work_dir: Option<PathBuf>,
    pub heartbeat_interval_secs: u64,
    pub prune_interval_secs: u64,
    /// Depth of the outbound event queue. Log chunks beyond it are dropped.
    pub event_queue_size: usize,
    /// Fallback SSH key for repositories using SSH auth without their own key.
    pub ssh_key_path: Option<PathBuf>,
    pub registry: RegistryConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: None,
            coordinator_addr: "127.0.0.1:5000".to_string(),
            work_dir: None,
            heartbeat_interval_secs: 3,
            prune_interval_secs: 3600,
            event_queue_size: 256,
            ssh_key_path: None,
            registry: RegistryConfig::default(),
        }
    }
}

impl WorkerConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn prune_interval(&self) -> Duration {
        Duration::from_secs(self.prune_interval_secs.max(60))
    }

    pub fn work_dir(&self) -> PathBuf {
        self.work_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

/// Credentials used when pushing built images.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub address: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(format!("Invalid log format: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub format: LogFormat,
    /// Filter used when `RUST_LOG` is unset.
    pub level: String,
    /// Also write daily-rolling log files here.
    pub file_dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Pretty,
            level: "info".to_string(),
            file_dir: None,
        }
    }
}

impl KilnConfig {
    /// Load from `path`, falling back to defaults when the file doesn't exist,
    /// then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = Self::from_file(path)?;
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }

    /// Apply `KILN_*` / `LOG_FORMAT` overrides. `lookup` is injected so tests
    /// don't touch the process environment.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup("KILN_DATABASE_PATH") {
            self.database.path = PathBuf::from(path);
        }
        if let Some(root) = lookup("KILN_STORAGE_ROOT") {
            self.storage.root = PathBuf::from(root);
        }
        if let Some(addr) = lookup("KILN_COORDINATOR_ADDR") {
            self.worker.coordinator_addr = addr;
        }
        if let Some(addr) = lookup("KILN_LISTEN_ADDR") {
            self.coordinator.listen_addr = addr
                .parse()
                .with_context(|| format!("Invalid KILN_LISTEN_ADDR '{}'", addr))?;
        }
        if let Some(addr) = lookup("KILN_HTTP_ADDR") {
            self.coordinator.http_addr = addr
                .parse()
                .with_context(|| format!("Invalid KILN_HTTP_ADDR '{}'", addr))?;
        }
        if let Some(format) = lookup("LOG_FORMAT") {
            self.logging.format = format.parse().map_err(anyhow::Error::msg)?;
        }
        Ok(())
    }
}
