use serde::{Deserialize, Serialize};

use crate::task::BuildOptions;

/// How to authenticate against a git remote.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum RepositoryAuth {
    #[default]
    None,
    Basic {
        username: String,
        password: String,
    },
    /// `private_key` falls back to the worker's configured key when absent.
    Ssh {
        #[serde(default)]
        private_key: Option<String>,
    },
}

impl RepositoryAuth {
    pub fn method(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Basic { .. } => "basic",
            Self::Ssh { .. } => "ssh",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Repository {
    pub id: String,
    pub url: String,
    #[serde(default)]
    pub auth: RepositoryAuth,
}

/// Per-application build settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ApplicationBuildConfig {
    #[serde(default)]
    pub static_build: bool,
    #[serde(default)]
    pub base_image_name: Option<String>,
    #[serde(default)]
    pub dockerfile_name: Option<String>,
    #[serde(default)]
    pub build_cmd: String,
    #[serde(default)]
    pub entrypoint_cmd: String,
    #[serde(default)]
    pub artifact_path: String,
}

/// A hosted application tracking one branch of one repository.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Application {
    pub id: String,
    pub name: String,
    pub repository_id: String,
    pub ref_name: String,
    /// Latest known commit on `ref_name`.
    pub commit: Option<String>,
    /// Deploy target; `None` for applications that are only built.
    pub environment_id: Option<String>,
    pub build: ApplicationBuildConfig,
}

impl Application {
    pub fn build_options(&self) -> BuildOptions {
        BuildOptions {
            base_image_name: self.build.base_image_name.clone(),
            dockerfile_name: self.build.dockerfile_name.clone(),
            build_cmd: self.build.build_cmd.clone(),
            entrypoint_cmd: self.build.entrypoint_cmd.clone(),
            artifact_path: self.build.artifact_path.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_serialization_is_tagged() {
        let auth = RepositoryAuth::Basic {
            username: "bot".into(),
            password: "hunter2".into(),
        };
        let json = serde_json::to_value(&auth).unwrap();
        assert_eq!(json["method"], "basic");
        assert_eq!(json["username"], "bot");

        let ssh: RepositoryAuth = serde_json::from_str(r#"{"method": "ssh"}"#).unwrap();
        assert_eq!(ssh, RepositoryAuth::Ssh { private_key: None });
        assert_eq!(ssh.method(), "ssh");
    }

    #[test]
    fn test_build_options_copied_from_config() {
        let app = Application {
            id: "app1".into(),
            name: "blog".into(),
            repository_id: "r1".into(),
            ref_name: "main".into(),
            commit: None,
            environment_id: None,
            build: ApplicationBuildConfig {
                static_build: true,
                base_image_name: Some("node:22".into()),
                build_cmd: "npm ci && npm run build".into(),
                artifact_path: "/srv/dist".into(),
                ..Default::default()
            },
        };
        let opts = app.build_options();
        assert_eq!(opts.base_image_name.as_deref(), Some("node:22"));
        assert_eq!(opts.artifact_path, "/srv/dist");
        assert!(opts.dockerfile_name.is_none());
    }
}
