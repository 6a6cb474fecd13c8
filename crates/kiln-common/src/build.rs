use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of a build row.
///
/// ```text
/// Queued ──> Building ──> Succeeded | Failed | Canceled | Skipped
///   │                          ▲
///   └──────────────────────────┘  (Canceled | Skipped only)
/// ```
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    Queued,
    Building,
    Succeeded,
    Failed,
    Canceled,
    Skipped,
}

impl BuildStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Building => "building",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
            Self::Skipped => "skipped",
        }
    }

    /// True for the four terminal outcomes.
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Canceled | Self::Skipped
        )
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BuildStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "building" => Ok(Self::Building),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "canceled" => Ok(Self::Canceled),
            "skipped" => Ok(Self::Skipped),
            _ => Err(format!("Invalid build status: {}", s)),
        }
    }
}

/// Whether a build may move from `from` to `to`. Transitions only move forward.
pub fn is_valid_transition(from: &BuildStatus, to: &BuildStatus) -> bool {
    use BuildStatus::*;
    matches!(
        (from, to),
        (Queued, Building)
            | (Queued, Canceled)
            | (Queued, Skipped)
            | (Building, Succeeded)
            | (Building, Failed)
            | (Building, Canceled)
            | (Building, Skipped)
    )
}

/// A persisted unit of work converting one repository commit into an artifact.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Build {
    pub id: String,
    pub application_id: String,
    pub commit: String,
    pub status: BuildStatus,
    pub retriable: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub artifact: Option<Artifact>,
}

impl Build {
    /// A fresh `Queued` row, not yet persisted.
    pub fn queued(application_id: &str, commit: &str) -> Self {
        Self {
            id: crate::new_id(),
            application_id: application_id.to_string(),
            commit: commit.to_string(),
            status: BuildStatus::Queued,
            retriable: false,
            started_at: None,
            updated_at: None,
            finished_at: None,
            artifact: None,
        }
    }

    /// `finished_at` is set iff the status is terminal, and the timestamps
    /// that are set are ordered.
    pub fn timestamps_consistent(&self) -> bool {
        if self.finished_at.is_some() != self.status.is_finished() {
            return false;
        }
        match (self.started_at, self.updated_at) {
            (Some(s), Some(u)) if s > u => return false,
            _ => {}
        }
        match (self.updated_at, self.finished_at) {
            (Some(u), Some(f)) if u > f => return false,
            _ => {}
        }
        true
    }
}

/// Output of a successful static build. Immutable except for soft deletion.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Artifact {
    pub id: String,
    pub build_id: String,
    pub size: i64,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Artifact {
    pub fn new(build_id: &str, size: i64) -> Self {
        Self {
            id: crate::new_id(),
            build_id: build_id.to_string(),
            size,
            created_at: Utc::now(),
            deleted_at: None,
        }
    }
}
