//! Pool control tool adapter.
//!
//! Drives the `zpool`/`zfs` binaries resolved from their well-known install
//! locations. Exit status interpretation is left to the caller; only an
//! unspawnable binary is an error here.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::trace;

use super::run_command;
use crate::domain::ports::{CommandOutput, ZfsRuntime};
use crate::error::Result;
use crate::probe::{first_existing, KNOWN_ZFS_PATHS, KNOWN_ZPOOL_PATHS};

/// `ZfsRuntime` over the host control binaries.
pub struct CommandZfsRuntime {
    zpool: PathBuf,
    zfs: PathBuf,
}

impl CommandZfsRuntime {
    pub fn new(zpool: impl Into<PathBuf>, zfs: impl Into<PathBuf>) -> Self {
        Self {
            zpool: zpool.into(),
            zfs: zfs.into(),
        }
    }

    /// Resolve the binaries from their well-known locations, falling back to
    /// the conventional sbin paths.
    pub fn detect() -> Self {
        let zpool_candidates: Vec<PathBuf> = KNOWN_ZPOOL_PATHS.iter().map(PathBuf::from).collect();
        let zfs_candidates: Vec<PathBuf> = KNOWN_ZFS_PATHS.iter().map(PathBuf::from).collect();
        Self {
            zpool: first_existing(&zpool_candidates)
                .cloned()
                .unwrap_or_else(|| PathBuf::from("/usr/sbin/zpool")),
            zfs: first_existing(&zfs_candidates)
                .cloned()
                .unwrap_or_else(|| PathBuf::from("/usr/sbin/zfs")),
        }
    }

    async fn invoke(&self, binary: &Path, args: &[&str]) -> Result<CommandOutput> {
        trace!(binary = %binary.display(), ?args, "invoking pool control tool");
        let output = run_command(binary, args, None).await?;
        Ok(CommandOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

#[async_trait]
impl ZfsRuntime for CommandZfsRuntime {
    async fn zpool(&self, args: &[&str]) -> Result<CommandOutput> {
        self.invoke(&self.zpool, args).await
    }

    async fn zfs(&self, args: &[&str]) -> Result<CommandOutput> {
        self.invoke(&self.zfs, args).await
    }
}
