use serde::{Deserialize, Serialize};

/// Which commit of which repository to build.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BuildSource {
    pub repository_id: String,
    pub commit: String,
}

/// Structured build configuration carried by a task.
///
/// When `dockerfile_name` is set the repository's own Dockerfile is used and
/// `build_cmd` / `entrypoint_cmd` are ignored.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BuildOptions {
    #[serde(default)]
    pub base_image_name: Option<String>,
    #[serde(default)]
    pub dockerfile_name: Option<String>,
    #[serde(default)]
    pub build_cmd: String,
    #[serde(default)]
    pub entrypoint_cmd: String,
    /// Subtree exported by static builds.
    #[serde(default)]
    pub artifact_path: String,
}

/// What a build produces.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BuildTarget {
    /// Push `name:tag` to the registry.
    Image { name: String, tag: String },
    /// Export `artifact_path` as a tarball.
    Static,
}

/// Ephemeral work description sent from the coordinator to workers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub build_id: String,
    pub application_id: String,
    pub source: BuildSource,
    pub options: BuildOptions,
    pub target: BuildTarget,
}

impl Task {
    pub fn is_static(&self) -> bool {
        matches!(self.target, BuildTarget::Static)
    }

    /// `name:tag` for image builds.
    pub fn image_ref(&self) -> Option<String> {
        match &self.target {
            BuildTarget::Image { name, tag } => Some(format!("{}:{}", name, tag)),
            BuildTarget::Static => None,
        }
    }
}
