//! Kernel Build Driver
//!
//! Remediation path for kernel families that cannot load modules
//! dynamically: builds a complete replacement kernel with the filesystem
//! compiled in. Stages run strictly in order and every failure aborts the
//! whole build; a partially built kernel is never published. The long
//! compilation stage emits a liveness signal at a fixed interval from a
//! background task that is cancelled and awaited the moment compilation
//! returns, on every exit path.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::adapters::run_checked;
use crate::domain::ports::KernelBuilder;
use crate::error::{Error, Result};
use crate::kernel::KernelIdentity;
use crate::version::{exact_match, ModuleVersion};

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the replacement-kernel build.
#[derive(Debug, Clone)]
pub struct KernelBuildConfig {
    /// Release index listing upstream kernel source tags.
    pub release_index_url: String,
    /// Kernel source repository.
    pub kernel_repo_url: String,
    /// Filesystem source repository.
    pub zfs_repo_url: String,
    /// Working directory holding both source trees.
    pub workspace_dir: PathBuf,
    /// Primary output directory for the built image.
    pub output_dir: PathBuf,
    /// Host staging directory; receives a copy when mounted, ignored when
    /// absent.
    pub staging_dir: PathBuf,
    /// Kernel configuration of the running kernel, used to seed the build.
    pub running_config: PathBuf,
    /// Liveness signal interval during compilation.
    pub heartbeat_interval: Duration,
    /// Parallel make jobs.
    pub jobs: usize,
}

impl Default for KernelBuildConfig {
    fn default() -> Self {
        Self {
            release_index_url:
                "https://api.github.com/repos/microsoft/WSL2-Linux-Kernel/releases".to_string(),
            kernel_repo_url: "https://github.com/microsoft/WSL2-Linux-Kernel.git".to_string(),
            zfs_repo_url: "https://github.com/openzfs/zfs.git".to_string(),
            workspace_dir: PathBuf::from("/var/lib/poolstrap/kbuild"),
            output_dir: PathBuf::from("/var/lib/poolstrap/kernel"),
            staging_dir: PathBuf::from("/mnt/c/poolstrap/kernel"),
            running_config: PathBuf::from("/proc/config.gz"),
            heartbeat_interval: Duration::from_secs(30),
            jobs: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
        }
    }
}

// =============================================================================
// Release Index
// =============================================================================

/// One published release in the source index.
#[derive(Debug, Clone, Deserialize)]
pub struct ReleaseEntry {
    pub tag_name: String,
    #[serde(default)]
    pub name: String,
}

/// Pick the first tag containing the host's upstream version substring,
/// falling back to the latest published entry.
pub(crate) fn select_tag<'a>(
    entries: &'a [ReleaseEntry],
    upstream_version: &str,
) -> Option<&'a ReleaseEntry> {
    if !upstream_version.is_empty() {
        if let Some(matched) = entries.iter().find(|entry| {
            entry.tag_name.contains(upstream_version) || entry.name.contains(upstream_version)
        }) {
            return Some(matched);
        }
    }
    entries.first()
}

// =============================================================================
// Heartbeat
// =============================================================================

/// Periodic liveness signal emitted while a long-running stage blocks.
/// The token is cancelled on drop, so no exit path leaks the task.
pub struct Heartbeat {
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl Heartbeat {
    pub fn start(interval: Duration, message: &'static str) -> Self {
        let token = CancellationToken::new();
        let child = token.clone();
        let handle = tokio::spawn(async move {
            let mut elapsed = Duration::ZERO;
            loop {
                tokio::select! {
                    _ = child.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        elapsed += interval;
                        info!(elapsed_secs = elapsed.as_secs(), "{message}");
                    }
                }
            }
        });
        Self {
            token,
            handle: Some(handle),
        }
    }

    #[cfg(test)]
    pub(crate) fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Cancel the signal and wait for the task to finish.
    pub async fn stop(mut self) {
        self.token.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

// =============================================================================
// Driver
// =============================================================================

/// Builds and publishes a replacement kernel with built-in filesystem
/// support.
pub struct KernelBuildDriver {
    config: KernelBuildConfig,
    http: reqwest::Client,
}

impl KernelBuildDriver {
    pub fn new(config: KernelBuildConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
        }
    }

    fn kernel_tree(&self) -> PathBuf {
        self.config.workspace_dir.join("linux")
    }

    fn zfs_tree(&self) -> PathBuf {
        self.config.workspace_dir.join("zfs")
    }

    /// Resolve the kernel source tag matching the host's upstream version.
    async fn resolve_source_tag(&self, kernel: &KernelIdentity) -> Result<String> {
        let response = self
            .http
            .get(&self.config.release_index_url)
            .header("User-Agent", "poolstrap")
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| Error::Network {
                context: "querying kernel release index".to_string(),
                detail: e.to_string(),
            })?;
        let body = response.text().await.map_err(|e| Error::Network {
            context: "reading kernel release index".to_string(),
            detail: e.to_string(),
        })?;
        let entries: Vec<ReleaseEntry> =
            serde_json::from_str(&body).map_err(|e| Error::KernelBuild {
                stage: "resolve-tag".to_string(),
                detail: format!("unparsable release index: {e}"),
            })?;

        let entry = select_tag(&entries, &kernel.version).ok_or_else(|| Error::KernelBuild {
            stage: "resolve-tag".to_string(),
            detail: "release index is empty".to_string(),
        })?;
        if entry.tag_name.contains(&kernel.version) || entry.name.contains(&kernel.version) {
            info!(tag = %entry.tag_name, "matched kernel source tag");
        } else {
            warn!(
                tag = %entry.tag_name,
                version = %kernel.version,
                "no tag matches running kernel, falling back to latest release"
            );
        }
        Ok(entry.tag_name.clone())
    }

    /// Clone the repository at `tag`, or reset-and-update an existing tree.
    /// Safe to re-run against a previously populated checkout.
    async fn sync_repo(&self, url: &str, dest: &Path, tag: &str) -> Result<()> {
        let stage = "sync-source";
        if dest.join(".git").is_dir() {
            debug!(dest = %dest.display(), %tag, "updating existing source tree");
            git(dest, &["fetch", "--depth", "1", "origin", tag]).await.map_err(|e| build_err(stage, e))?;
            git(dest, &["reset", "--hard", "FETCH_HEAD"]).await.map_err(|e| build_err(stage, e))?;
            return Ok(());
        }

        tokio::fs::create_dir_all(&self.config.workspace_dir).await?;
        let dest_str = dest.display().to_string();
        debug!(dest = %dest_str, %tag, "cloning source tree");
        run_checked(
            Path::new("git"),
            &["clone", "--depth", "1", "--branch", tag, url, &dest_str],
            None,
        )
        .await
        .map_err(|e| build_err(stage, e))?;
        Ok(())
    }

    /// Seed the build configuration from the running kernel when available,
    /// else a generic default, then generate build scaffolding.
    async fn seed_kernel_config(&self, ktree: &Path) -> Result<()> {
        let stage = "seed-config";
        if self.config.running_config.is_file() {
            let seed = format!(
                "zcat {} > .config",
                self.config.running_config.display()
            );
            sh(ktree, &seed).await.map_err(|e| build_err(stage, e))?;
            info!("seeded kernel configuration from the running kernel");
        } else {
            make(ktree, &["defconfig"], self.config.jobs).await.map_err(|e| build_err(stage, e))?;
            info!("seeded kernel configuration from defconfig");
        }
        make(ktree, &["olddefconfig"], self.config.jobs).await.map_err(|e| build_err(stage, e))?;
        make(ktree, &["prepare"], self.config.jobs).await.map_err(|e| build_err(stage, e))?;
        Ok(())
    }

    /// Configure the filesystem source against the kernel tree in built-in
    /// mode, graft it into the tree, and install the userspace tools.
    async fn prepare_filesystem(&self, required: &ModuleVersion, ktree: &Path) -> Result<()> {
        let stage = "prepare-filesystem";
        let ztree = self.zfs_tree();
        let tag = format!("zfs-{}", required.base());
        self.sync_repo(&self.config.zfs_repo_url, &ztree, &tag).await?;

        // The checked-out source must be exactly the version that was
        // requested; a near miss would bake the wrong module into the image.
        let meta_version = read_meta_version(&ztree).await;
        match meta_version {
            Some(found) if exact_match(&required.base(), &found) => {}
            Some(found) => {
                return Err(Error::KernelBuild {
                    stage: stage.to_string(),
                    detail: format!(
                        "source tree reports version {found}, requested {}",
                        required.base()
                    ),
                })
            }
            None => warn!("filesystem source has no readable version metadata"),
        }

        let ktree_str = ktree.display().to_string();
        sh(&ztree, "./autogen.sh").await.map_err(|e| build_err(stage, e))?;
        sh(
            &ztree,
            &format!("./configure --enable-linux-builtin --with-linux={ktree_str}"),
        )
        .await
        .map_err(|e| build_err(stage, e))?;
        sh(&ztree, &format!("./copy-builtin {ktree_str}")).await.map_err(|e| build_err(stage, e))?;

        make(&ztree, &[], self.config.jobs).await.map_err(|e| build_err(stage, e))?;
        make(&ztree, &["install"], self.config.jobs).await.map_err(|e| build_err(stage, e))?;
        info!(version = %required, "filesystem source grafted and userspace tools installed");
        Ok(())
    }

    /// Force the filesystem on in the kernel configuration and compile.
    async fn compile_kernel(&self, ktree: &Path) -> Result<()> {
        let stage = "compile";
        let config_path = ktree.join(".config");
        let mut contents = tokio::fs::read_to_string(&config_path).await?;
        if !contents.lines().any(|line| line == "CONFIG_ZFS=y") {
            contents.push_str("CONFIG_ZFS=y\n");
            tokio::fs::write(&config_path, contents).await?;
        }
        make(ktree, &["olddefconfig"], self.config.jobs).await.map_err(|e| build_err(stage, e))?;

        info!(jobs = self.config.jobs, "compiling replacement kernel");
        let heartbeat = Heartbeat::start(
            self.config.heartbeat_interval,
            "kernel compilation in progress",
        );
        let result = make(ktree, &[], self.config.jobs).await;
        heartbeat.stop().await;
        result.map_err(|e| build_err(stage, e))?;
        Ok(())
    }

    /// Copy the built image to the primary output directory, plus the host
    /// staging directory when one is mounted.
    async fn publish_image(&self, ktree: &Path) -> Result<PathBuf> {
        let stage = "publish";
        let image = ktree.join("arch/x86/boot/bzImage");
        if !image.is_file() {
            return Err(Error::KernelBuild {
                stage: stage.to_string(),
                detail: format!("expected image at {} not found", image.display()),
            });
        }

        tokio::fs::create_dir_all(&self.config.output_dir).await?;
        let published = self.config.output_dir.join("bzImage");
        tokio::fs::copy(&image, &published).await?;
        info!(image = %published.display(), "published kernel image");

        if self.config.staging_dir.is_dir() {
            let staged = self.config.staging_dir.join("bzImage");
            tokio::fs::copy(&image, &staged).await?;
            info!(image = %staged.display(), "copied kernel image to staging");
        }

        Ok(published)
    }
}

#[async_trait]
impl KernelBuilder for KernelBuildDriver {
    async fn build(&self, required: &ModuleVersion, kernel: &KernelIdentity) -> Result<PathBuf> {
        info!(
            release = %kernel.release,
            version = %kernel.version,
            %required,
            "starting replacement kernel build"
        );

        let tag = self.resolve_source_tag(kernel).await?;
        let ktree = self.kernel_tree();
        self.sync_repo(&self.config.kernel_repo_url, &ktree, &tag).await?;
        self.seed_kernel_config(&ktree).await?;
        self.prepare_filesystem(required, &ktree).await?;
        self.compile_kernel(&ktree).await?;
        self.publish_image(&ktree).await
    }
}

// =============================================================================
// Command Helpers
// =============================================================================

fn build_err(stage: &str, e: Error) -> Error {
    Error::KernelBuild {
        stage: stage.to_string(),
        detail: e.to_string(),
    }
}

/// Version declared in the filesystem source tree's `META` file.
async fn read_meta_version(ztree: &Path) -> Option<String> {
    let contents = tokio::fs::read_to_string(ztree.join("META")).await.ok()?;
    contents.lines().find_map(|line| {
        line.strip_prefix("Version:")
            .map(|value| value.trim().to_string())
    })
}

async fn git(dir: &Path, args: &[&str]) -> Result<String> {
    run_checked(Path::new("git"), args, Some(dir)).await
}

async fn sh(dir: &Path, script: &str) -> Result<String> {
    run_checked(Path::new("sh"), &["-c", script], Some(dir)).await
}

async fn make(dir: &Path, targets: &[&str], jobs: usize) -> Result<String> {
    let jobs = jobs.to_string();
    let mut args = vec!["-j", jobs.as_str()];
    args.extend_from_slice(targets);
    run_checked(Path::new("make"), &args, Some(dir)).await
}

// =============================================================================
// Tests
// =============================================================================
