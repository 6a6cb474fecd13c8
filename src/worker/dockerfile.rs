//! Build-context preparation for repositories without their own Dockerfile.

use std::path::Path;

use kiln_common::BuildOptions;

use crate::errors::PipelineError;

pub const BUILD_SCRIPT: &str = "kiln-build.sh";
pub const ENTRYPOINT_SCRIPT: &str = "kiln-entrypoint.sh";
pub const GENERATED_DOCKERFILE: &str = "kiln.Dockerfile";

/// Working directory of generated images; relative artifact paths resolve here.
pub const WORKDIR: &str = "/srv";

fn script(cmd: &str) -> String {
    format!("#!/bin/sh\nset -eux\n{}\n", cmd.trim_end())
}

/// Dockerfile layering the generated scripts on the base image.
pub fn render(options: &BuildOptions, static_build: bool) -> String {
    let base = options
        .base_image_name
        .as_deref()
        .filter(|b| !b.trim().is_empty())
        .unwrap_or("scratch");

    let mut out = format!("FROM {}\nWORKDIR {}\nCOPY . .\n", base, WORKDIR);
    if !options.build_cmd.trim().is_empty() {
        out.push_str(&format!(
            "RUN chmod +x ./{0} && ./{0}\n",
            BUILD_SCRIPT
        ));
    }
    if !static_build && !options.entrypoint_cmd.trim().is_empty() {
        out.push_str(&format!(
            "RUN chmod +x ./{0}\nENTRYPOINT [\"./{0}\"]\n",
            ENTRYPOINT_SCRIPT
        ));
    }
    out
}

/// Resolve which Dockerfile to build with, writing generated files into
/// `context` when the repository doesn't bring its own.
pub async fn prepare(
    context: &Path,
    options: &BuildOptions,
    static_build: bool,
) -> Result<String, PipelineError> {
    if let Some(name) = options.dockerfile_name.as_deref().filter(|n| !n.is_empty()) {
        let rel = Path::new(name);
        if rel.is_absolute() || rel.components().any(|c| c.as_os_str() == "..") {
            return Err(PipelineError::InvalidOptions(format!(
                "dockerfile '{}' must stay inside the repository",
                name
            )));
        }
        if !tokio::fs::try_exists(context.join(rel))
            .await
            .map_err(PipelineError::Workspace)?
        {
            return Err(PipelineError::InvalidOptions(format!(
                "dockerfile '{}' not found in repository",
                name
            )));
        }
        return Ok(name.to_string());
    }

    if !options.build_cmd.trim().is_empty() {
        tokio::fs::write(context.join(BUILD_SCRIPT), script(&options.build_cmd))
            .await
            .map_err(PipelineError::Workspace)?;
    }
    if !static_build && !options.entrypoint_cmd.trim().is_empty() {
        tokio::fs::write(
            context.join(ENTRYPOINT_SCRIPT),
            script(&options.entrypoint_cmd),
        )
        .await
        .map_err(PipelineError::Workspace)?;
    }
    tokio::fs::write(
        context.join(GENERATED_DOCKERFILE),
        render(options, static_build),
    )
    .await
    .map_err(PipelineError::Workspace)?;
    Ok(GENERATED_DOCKERFILE.to_string())
}

/// Absolute in-image path of the static artifact.
pub fn artifact_path(options: &BuildOptions) -> Result<String, PipelineError> {
    let path = options.artifact_path.trim();
    if path.is_empty() {
        return Err(PipelineError::InvalidOptions(
            "static builds need an artifact path".into(),
        ));
    }
    if path.starts_with('/') {
        Ok(path.to_string())
    } else {
        Ok(format!("{}/{}", WORKDIR, path.trim_start_matches("./")))
    }
}
