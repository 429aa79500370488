//! Host-global state adapters: the install marker file and the root mount
//! namespace.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use super::run_checked;
use crate::domain::ports::{MarkerStore, MountEntry, MountNamespace};
use crate::domain::InstalledLocation;
use crate::error::Result;

// =============================================================================
// Install Marker
// =============================================================================

/// Single-line marker file recording which remediation artifact is live.
pub struct FileMarkerStore {
    pub path: PathBuf,
}

impl FileMarkerStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Default for FileMarkerStore {
    fn default() -> Self {
        Self::new("/var/lib/poolstrap/installed-module")
    }
}

impl MarkerStore for FileMarkerStore {
    fn write(&self, location: &InstalledLocation) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, format!("{}\n", location.as_marker_line()))?;
        debug!(path = %self.path.display(), marker = %location.as_marker_line(), "wrote install marker");
        Ok(())
    }

    fn read(&self) -> Result<Option<InstalledLocation>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(&self.path)?;
        Ok(InstalledLocation::parse_marker_line(&contents))
    }
}

// =============================================================================
// Mount Namespace
// =============================================================================

/// Mount namespace adapter reading `/proc/mounts` and unmounting through the
/// host's root namespace, so pool mounts can be released even when we run
/// inside a nested or containerized context.
pub struct ProcMountNamespace {
    /// Normally `/proc/mounts`.
    pub proc_mounts: PathBuf,
    /// Enter the init mount namespace for unmounts.
    pub use_host_namespace: bool,
}

impl Default for ProcMountNamespace {
    fn default() -> Self {
        Self {
            proc_mounts: PathBuf::from("/proc/mounts"),
            use_host_namespace: true,
        }
    }
}

/// Parse `/proc/mounts` content down to the entries sourced from `pool` or
/// one of its datasets. Octal escapes in mountpoints are left as-is; pool
/// dataset paths do not contain spaces.
pub(crate) fn parse_pool_mounts(contents: &str, pool: &str) -> Vec<MountEntry> {
    let prefix = format!("{pool}/");
    contents
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let source = fields.next()?;
            let mountpoint = fields.next()?;
            if source == pool || source.starts_with(&prefix) {
                Some(MountEntry {
                    source: source.to_string(),
                    mountpoint: PathBuf::from(mountpoint),
                })
            } else {
                None
            }
        })
        .collect()
}

#[async_trait]
impl MountNamespace for ProcMountNamespace {
    async fn mounts_under(&self, pool: &str) -> Result<Vec<MountEntry>> {
        let contents = tokio::fs::read_to_string(&self.proc_mounts).await?;
        Ok(parse_pool_mounts(&contents, pool))
    }

    async fn unmount(&self, mountpoint: &Path) -> Result<()> {
        let target = mountpoint.display().to_string();
        if self.use_host_namespace {
            run_checked(
                Path::new("nsenter"),
                &["-t", "1", "-m", "umount", &target],
                None,
            )
            .await?;
        } else {
            run_checked(Path::new("umount"), &[&target], None).await?;
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn marker_store_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = FileMarkerStore::new(dir.path().join("state/installed-module"));

        assert_eq!(store.read().unwrap(), None);

        let location = InstalledLocation::ModuleDir(PathBuf::from("/lib/modules/x/extra/zfs"));
        store.write(&location).unwrap();
        assert_eq!(store.read().unwrap(), Some(location));

        store.write(&InstalledLocation::Builtin).unwrap();
        assert_eq!(store.read().unwrap(), Some(InstalledLocation::Builtin));
    }

    #[test]
    fn parses_only_pool_sourced_mounts() {
        let contents = "\
/dev/sda1 / ext4 rw,relatime 0 0
tank /mnt/tank zfs rw,xattr 0 0
tank/data /mnt/tank/data zfs rw,xattr 0 0
tankette/data /mnt/other zfs rw 0 0
proc /proc proc rw 0 0
";
        let mounts = parse_pool_mounts(contents, "tank");
        assert_eq!(mounts.len(), 2);
        assert_eq!(mounts[0].source, "tank");
        assert_eq!(mounts[1].mountpoint, PathBuf::from("/mnt/tank/data"));
    }
}
