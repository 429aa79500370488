//! Kernel module tooling adapter.
//!
//! Locates module directories under the modules root, reads module versions
//! through `modinfo`, and attaches/detaches modules with the standard module
//! tools. Modules living outside the modules root (e.g. a freshly built
//! artifact directory) are attached object-by-object with `insmod`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{run_checked, run_command};
use crate::domain::ports::ModuleHost;
use crate::error::{Error, Result};
use crate::probe;

/// Module object names in dependency order. The modern stack ships the first
/// two; the legacy 0.8 stack splits further. Absent objects are skipped.
const MODULE_OBJECTS: &[&str] = &[
    "spl.ko",
    "znvpair.ko",
    "zcommon.ko",
    "zavl.ko",
    "icp.ko",
    "zlua.ko",
    "zunicode.ko",
    "zfs.ko",
];

/// Subdirectories of a release tree that may hold the module.
const MODULE_SUBDIRS: &[&str] = &["extra", "extra/zfs", "kernel/fs/zfs", "updates/dkms"];

/// Host adapter over the kernel module tools.
pub struct KernelModuleHost {
    /// Normally `/lib/modules`.
    pub modules_root: PathBuf,
    /// Kernel filesystem registry, re-probed for built-in support.
    pub proc_filesystems: PathBuf,
}

impl Default for KernelModuleHost {
    fn default() -> Self {
        Self {
            modules_root: PathBuf::from("/lib/modules"),
            proc_filesystems: PathBuf::from("/proc/filesystems"),
        }
    }
}

impl KernelModuleHost {
    fn release_dir(&self, release: &str) -> PathBuf {
        self.modules_root.join(release)
    }
}

#[async_trait]
impl ModuleHost for KernelModuleHost {
    async fn find_module_dir(&self, release: &str) -> Option<PathBuf> {
        let release_dir = self.release_dir(release);
        for subdir in MODULE_SUBDIRS {
            let candidate = release_dir.join(subdir);
            if candidate.join("zfs.ko").is_file() {
                debug!(dir = %candidate.display(), "found module directory");
                return Some(candidate);
            }
        }
        None
    }

    async fn module_version(&self, module_dir: &Path) -> Option<String> {
        let object = module_dir.join("zfs.ko");
        let output = run_command(Path::new("modinfo"), &["-F", "version", object.to_str()?], None)
            .await
            .ok()?;
        if !output.status.success() {
            return None;
        }
        let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if version.is_empty() {
            None
        } else {
            Some(version)
        }
    }

    async fn load(&self, module_dir: &Path) -> Result<()> {
        if module_dir.starts_with(&self.modules_root) {
            // Registered location: refresh dependency metadata and let
            // modprobe resolve the object chain.
            run_checked(Path::new("depmod"), &["-a"], None).await?;
            run_checked(Path::new("modprobe"), &["zfs"], None)
                .await
                .map_err(|e| Error::ModuleLoad {
                    module_dir: module_dir.display().to_string(),
                    detail: e.to_string(),
                })?;
            return Ok(());
        }

        // Unregistered artifact directory: insert present objects in
        // dependency order.
        let mut inserted = 0usize;
        for name in MODULE_OBJECTS {
            let object = module_dir.join(name);
            if !object.is_file() {
                continue;
            }
            let object_str = object.display().to_string();
            let output = run_command(Path::new("insmod"), &[&object_str], None).await?;
            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                // An object that is already resident is not a failure.
                if stderr.contains("File exists") {
                    continue;
                }
                return Err(Error::ModuleLoad {
                    module_dir: module_dir.display().to_string(),
                    detail: format!("insmod {name}: {}", stderr.trim()),
                });
            }
            inserted += 1;
        }
        if inserted == 0 {
            return Err(Error::ModuleLoad {
                module_dir: module_dir.display().to_string(),
                detail: "no module objects found".to_string(),
            });
        }
        Ok(())
    }

    async fn unload(&self) -> Result<()> {
        match run_checked(Path::new("modprobe"), &["-r", "zfs"], None).await {
            Ok(_) => Ok(()),
            Err(e) => {
                warn!(error = %e, "module unload failed");
                Err(e)
            }
        }
    }

    async fn builtin_support(&self) -> bool {
        probe::filesystem_registered(&self.proc_filesystems)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[tokio::test]
    async fn finds_module_dir_in_known_subdirs() {
        let dir = TempDir::new().unwrap();
        let host = KernelModuleHost {
            modules_root: dir.path().to_path_buf(),
            proc_filesystems: dir.path().join("filesystems"),
        };

        assert!(host.find_module_dir("5.15.0-86-generic").await.is_none());

        let extra = dir.path().join("5.15.0-86-generic/extra/zfs");
        fs::create_dir_all(&extra).unwrap();
        fs::write(extra.join("zfs.ko"), "").unwrap();

        assert_eq!(host.find_module_dir("5.15.0-86-generic").await, Some(extra));
    }

    #[tokio::test]
    async fn builtin_support_reads_registry() {
        let dir = TempDir::new().unwrap();
        let host = KernelModuleHost {
            modules_root: dir.path().to_path_buf(),
            proc_filesystems: dir.path().join("filesystems"),
        };
        assert!(!host.builtin_support().await);

        fs::write(dir.path().join("filesystems"), "\tzfs\n").unwrap();
        assert!(host.builtin_support().await);
    }
}
