//! Isolated build service adapter.
//!
//! The build itself is an opaque container image invoked with declared
//! inputs and a writable output mount. On success the image populates a
//! predictable artifact directory keyed by the running kernel's release;
//! the artifact being absent is a valid outcome, not a service error.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::info;

use super::run_command;
use crate::domain::ports::BuildService;
use crate::error::{Error, Result};
use crate::version::ModuleVersion;

/// Path inside the container where the output directory is mounted.
const CONTAINER_OUTPUT_MOUNT: &str = "/out";

/// Build service backed by a container runtime.
pub struct ContainerBuildService {
    /// Container runtime binary, normally `docker`.
    pub runtime: PathBuf,
    /// Build image reference.
    pub image: String,
}

impl ContainerBuildService {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            runtime: PathBuf::from("docker"),
            image: image.into(),
        }
    }
}

#[async_trait]
impl BuildService for ContainerBuildService {
    async fn build(
        &self,
        required: &ModuleVersion,
        build_mode: &str,
        output_dir: &Path,
    ) -> Result<()> {
        tokio::fs::create_dir_all(output_dir).await?;

        let version_env = format!("ZFS_VERSION={}", required.base());
        let mode_env = format!("BUILD_MODE={build_mode}");
        let volume = format!("{}:{}", output_dir.display(), CONTAINER_OUTPUT_MOUNT);

        info!(image = %self.image, version = %required, mode = build_mode, "invoking build service");
        let output = run_command(
            &self.runtime,
            &[
                "run", "--rm", "-e", &version_env, "-e", &mode_env, "-v", &volume, &self.image,
            ],
            None,
        )
        .await?;

        if !output.status.success() {
            return Err(Error::BuildService(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(())
    }

    fn artifact_path(&self, output_dir: &Path, kernel_release: &str) -> PathBuf {
        output_dir.join(kernel_release)
    }
}
