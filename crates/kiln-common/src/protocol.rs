//! Coordinator ↔ worker message bodies.
//!
//! Both directions are tagged enums serialized as `{"type": ..., "data": ...}`.
//! Framing is the transport's business; these types only fix the semantics.

use serde::{Deserialize, Serialize};

use crate::build::BuildStatus;
use crate::task::Task;

/// Coordinator → worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CoordinatorMessage {
    StartBuildImage { task: Task },
    StartBuildStatic { task: Task },
    CancelBuild { build_id: String },
}

impl CoordinatorMessage {
    /// Pick the start variant matching the task's target.
    pub fn start(task: Task) -> Self {
        if task.is_static() {
            Self::StartBuildStatic { task }
        } else {
            Self::StartBuildImage { task }
        }
    }
}

/// Final outcome reported in `BUILD_SETTLED`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SettleReason {
    Success,
    Failed,
    Cancelled,
}

impl SettleReason {
    pub fn from_status(status: BuildStatus) -> Self {
        match status {
            BuildStatus::Succeeded => Self::Success,
            BuildStatus::Canceled | BuildStatus::Skipped => Self::Cancelled,
            _ => Self::Failed,
        }
    }
}

/// Worker → coordinator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerMessage {
    /// Handshake, always the first frame on a connection.
    Connected { worker_id: String },
    BuildStarted {
        application_id: String,
        build_id: String,
    },
    BuildLog { build_id: String, chunk: String },
    BuildSettled {
        application_id: String,
        build_id: String,
        reason: SettleReason,
    },
}

impl WorkerMessage {
    pub fn build_id(&self) -> Option<&str> {
        match self {
            Self::Connected { .. } => None,
            Self::BuildStarted { build_id, .. }
            | Self::BuildLog { build_id, .. }
            | Self::BuildSettled { build_id, .. } => Some(build_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{BuildOptions, BuildSource, BuildTarget};

    fn static_task() -> Task {
        Task {
            build_id: "b1".into(),
            application_id: "app1".into(),
            source: BuildSource {
                repository_id: "r1".into(),
                commit: "abc123".into(),
            },
            options: BuildOptions::default(),
            target: BuildTarget::Static,
        }
    }

    #[test]
    fn test_start_picks_variant_from_target() {
        let msg = CoordinatorMessage::start(static_task());
        assert!(matches!(msg, CoordinatorMessage::StartBuildStatic { .. }));

        let mut task = static_task();
        task.target = BuildTarget::Image {
            name: "img".into(),
            tag: "t".into(),
        };
        let msg = CoordinatorMessage::start(task);
        assert!(matches!(msg, CoordinatorMessage::StartBuildImage { .. }));
    }

    #[test]
    fn test_wire_tags_match_message_kinds() {
        let msg = CoordinatorMessage::CancelBuild {
            build_id: "b1".into(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "CANCEL_BUILD");
        assert_eq!(json["data"]["build_id"], "b1");

        let settled = WorkerMessage::BuildSettled {
            application_id: "app1".into(),
            build_id: "b1".into(),
            reason: SettleReason::Cancelled,
        };
        let json = serde_json::to_value(&settled).unwrap();
        assert_eq!(json["type"], "BUILD_SETTLED");
        assert_eq!(json["data"]["reason"], "CANCELLED");
    }

    #[test]
    fn test_connected_has_no_build_id() {
        let msg = WorkerMessage::Connected {
            worker_id: "w1".into(),
        };
        assert!(msg.build_id().is_none());
        let log = WorkerMessage::BuildLog {
            build_id: "b9".into(),
            chunk: "step 1\n".into(),
        };
        assert_eq!(log.build_id(), Some("b9"));
    }

    #[test]
    fn test_settle_reason_from_status() {
        assert_eq!(SettleReason::from_status(BuildStatus::Succeeded), SettleReason::Success);
        assert_eq!(SettleReason::from_status(BuildStatus::Failed), SettleReason::Failed);
        assert_eq!(SettleReason::from_status(BuildStatus::Canceled), SettleReason::Cancelled);
    }

    #[test]
    fn test_decode_rejects_unknown_type() {
        let res: Result<WorkerMessage, _> =
            serde_json::from_str(r#"{"type": "BUILD_EXPLODED", "data": {}}"#);
        assert!(res.is_err());
    }
}
