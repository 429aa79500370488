//! Pool Lifecycle Manager
//!
//! Creates, imports, migrates, and destroys the managed pool and its fixed
//! two-dataset layout (`data` with compression, `db`, both legacy-mounted so
//! the owning service controls mount timing). Every operation is an
//! idempotent transition issued through the pool control port; failures are
//! reported verbatim and never self-healed.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use crate::domain::ports::{CommandOutput, MountNamespace, ZfsRuntime};
use crate::error::{Error, Result};

// =============================================================================
// Pool Description
// =============================================================================

/// Dataset holding service data; created with compression enabled.
pub const DATA_DATASET: &str = "data";
/// Dataset holding the service database.
pub const DB_DATASET: &str = "db";
/// Deprecated dataset removed by `update`.
pub const REPO_DATASET: &str = "repo";
/// Deprecated dataset removed by `update`.
pub const DEATHROW_DATASET: &str = "deathrow";

/// The managed storage pool.
#[derive(Debug, Clone, Serialize)]
pub struct StoragePool {
    pub name: String,
    pub device: String,
    pub mountpoint: PathBuf,
    pub cachefile: PathBuf,
}

// =============================================================================
// Manager
// =============================================================================

/// Issues pool and dataset transitions against the filesystem.
pub struct PoolLifecycleManager {
    runtime: Arc<dyn ZfsRuntime>,
    mounts: Arc<dyn MountNamespace>,
}

impl PoolLifecycleManager {
    pub fn new(runtime: Arc<dyn ZfsRuntime>, mounts: Arc<dyn MountNamespace>) -> Self {
        Self { runtime, mounts }
    }

    /// Whether a pool with this name is currently active.
    pub async fn exists(&self, name: &str) -> Result<bool> {
        let output = self
            .runtime
            .zpool(&["list", "-H", "-o", "name", name])
            .await?;
        Ok(output.success)
    }

    /// Create the pool and its dataset layout. Fails if the pool already
    /// exists. The pool is created before its datasets; `data` before `db`.
    pub async fn create(&self, pool: &StoragePool) -> Result<()> {
        if self.exists(&pool.name).await? {
            return Err(Error::Pool {
                operation: "create".to_string(),
                pool: pool.name.clone(),
                detail: "pool already exists".to_string(),
            });
        }

        let mountpoint = pool.mountpoint.display().to_string();
        let cachefile = format!("cachefile={}", pool.cachefile.display());
        let output = self
            .runtime
            .zpool(&[
                "create",
                "-f",
                "-m",
                &mountpoint,
                "-o",
                &cachefile,
                &pool.name,
                &pool.device,
            ])
            .await?;
        check(output, "create", &pool.name)?;
        info!(pool = %pool.name, device = %pool.device, "created pool");

        self.create_dataset(&pool.name, DATA_DATASET, true).await?;
        self.create_dataset(&pool.name, DB_DATASET, false).await?;
        Ok(())
    }

    /// Re-attach a previously created pool from its cache descriptor.
    /// Forced, so a pool last touched by another host still imports.
    pub async fn import(&self, cachefile: &Path, name: &str) -> Result<()> {
        let cachefile = cachefile.display().to_string();
        let output = self
            .runtime
            .zpool(&["import", "-f", "-c", &cachefile, name])
            .await?;
        check(output, "import", name)?;
        info!(pool = %name, "imported pool");
        Ok(())
    }

    /// Converge the dataset layout: drop the deprecated `deathrow` and
    /// `repo` datasets and create whichever of `data`/`db` is missing.
    /// Safe to call repeatedly; a current layout is left untouched.
    pub async fn update(&self, name: &str) -> Result<()> {
        let datasets = self.datasets(name).await?;

        let deathrow = format!("{name}/{DEATHROW_DATASET}");
        if datasets.iter().any(|d| d == &deathrow) {
            let output = self.runtime.zfs(&["destroy", &deathrow]).await?;
            check(output, "update", name)?;
            info!(dataset = %deathrow, "destroyed deprecated dataset");
        }

        let repo = format!("{name}/{REPO_DATASET}");
        if datasets.iter().any(|d| d == &repo) {
            let output = self.runtime.zfs(&["destroy", "-r", &repo]).await?;
            check(output, "update", name)?;
            info!(dataset = %repo, "destroyed deprecated dataset recursively");
        }

        let data = format!("{name}/{DATA_DATASET}");
        if !datasets.iter().any(|d| d == &data) {
            self.create_dataset(name, DATA_DATASET, true).await?;
        }
        let db = format!("{name}/{DB_DATASET}");
        if !datasets.iter().any(|d| d == &db) {
            self.create_dataset(name, DB_DATASET, false).await?;
        }

        debug!(pool = %name, "dataset layout is current");
        Ok(())
    }

    /// Destroy the pool. Irreversible; only valid once no dependent mounts
    /// remain.
    pub async fn destroy(&self, name: &str) -> Result<()> {
        let output = self.runtime.zpool(&["destroy", name]).await?;
        check(output, "destroy", name)?;
        info!(pool = %name, "destroyed pool");
        Ok(())
    }

    /// Unmount every active mount under the pool, deepest path first, in the
    /// host's root mount namespace.
    pub async fn unmount_all(&self, name: &str) -> Result<()> {
        let mut mounts = self.mounts.mounts_under(name).await?;
        // Children extend their parents' paths, so descending order puts
        // the deepest mounts first.
        mounts.sort_by(|a, b| b.mountpoint.cmp(&a.mountpoint));
        for entry in mounts {
            debug!(mountpoint = %entry.mountpoint.display(), "unmounting");
            self.mounts.unmount(&entry.mountpoint).await?;
        }
        Ok(())
    }

    /// Names of the pool's datasets (the pool itself excluded).
    async fn datasets(&self, name: &str) -> Result<Vec<String>> {
        let output = self
            .runtime
            .zfs(&["list", "-H", "-o", "name", "-r", name])
            .await?;
        let output = check(output, "list", name)?;
        Ok(output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && *line != name)
            .map(str::to_string)
            .collect())
    }

    async fn create_dataset(&self, pool: &str, dataset: &str, compression: bool) -> Result<()> {
        let full = format!("{pool}/{dataset}");
        let output = if compression {
            self.runtime
                .zfs(&[
                    "create",
                    "-o",
                    "compression=on",
                    "-o",
                    "mountpoint=legacy",
                    &full,
                ])
                .await?
        } else {
            self.runtime
                .zfs(&["create", "-o", "mountpoint=legacy", &full])
                .await?
        };
        check(output, "create-dataset", pool)?;
        info!(dataset = %full, compression, "created dataset");
        Ok(())
    }
}

/// Promote an unsuccessful tool invocation to a verbatim pool error.
fn check(output: CommandOutput, operation: &str, pool: &str) -> Result<CommandOutput> {
    if output.success {
        Ok(output)
    } else {
        Err(Error::Pool {
            operation: operation.to_string(),
            pool: pool.to_string(),
            detail: output.stderr.trim().to_string(),
        })
    }
}
