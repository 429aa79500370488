//! Pool Lifecycle Tests
//!
//! Exercises the pool manager against an in-memory zfs runtime that
//! simulates pool and dataset state, plus a recording mount namespace for
//! unmount ordering.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use assert_matches::assert_matches;
use async_trait::async_trait;

use poolstrap::domain::ports::{CommandOutput, MountEntry, MountNamespace, ZfsRuntime};
use poolstrap::pool::{PoolLifecycleManager, StoragePool};

// =============================================================================
// Mock Runtime
// =============================================================================

/// In-memory pool/dataset state driven through the same argument shapes the
/// real control tools receive.
#[derive(Default)]
struct MockZfsRuntime {
    pools: Mutex<BTreeSet<String>>,
    datasets: Mutex<BTreeSet<String>>,
    destroy_calls: Mutex<Vec<String>>,
}

impl MockZfsRuntime {
    fn with_state(pools: &[&str], datasets: &[&str]) -> Arc<Self> {
        let runtime = Self::default();
        *runtime.pools.lock().unwrap() = pools.iter().map(|s| s.to_string()).collect();
        *runtime.datasets.lock().unwrap() = datasets.iter().map(|s| s.to_string()).collect();
        Arc::new(runtime)
    }

    fn dataset_names(&self) -> Vec<String> {
        self.datasets.lock().unwrap().iter().cloned().collect()
    }
}

#[async_trait]
impl ZfsRuntime for MockZfsRuntime {
    async fn zpool(&self, args: &[&str]) -> poolstrap::Result<CommandOutput> {
        match args.first() {
            Some(&"list") => {
                let name = args.last().unwrap().to_string();
                if self.pools.lock().unwrap().contains(&name) {
                    Ok(CommandOutput::ok(format!("{name}\n")))
                } else {
                    Ok(CommandOutput::err(format!(
                        "cannot open '{name}': no such pool"
                    )))
                }
            }
            Some(&"create") => {
                let name = args[args.len() - 2].to_string();
                let mut pools = self.pools.lock().unwrap();
                if pools.contains(&name) {
                    return Ok(CommandOutput::err(format!("pool '{name}' already exists")));
                }
                pools.insert(name);
                Ok(CommandOutput::ok(""))
            }
            Some(&"import") => {
                let name = args.last().unwrap().to_string();
                self.pools.lock().unwrap().insert(name);
                Ok(CommandOutput::ok(""))
            }
            Some(&"destroy") => {
                let name = args.last().unwrap().to_string();
                self.pools.lock().unwrap().remove(&name);
                let prefix = format!("{name}/");
                self.datasets
                    .lock()
                    .unwrap()
                    .retain(|d| !d.starts_with(&prefix));
                Ok(CommandOutput::ok(""))
            }
            _ => Ok(CommandOutput::err("unsupported zpool invocation")),
        }
    }

    async fn zfs(&self, args: &[&str]) -> poolstrap::Result<CommandOutput> {
        match args.first() {
            Some(&"create") => {
                let name = args.last().unwrap().to_string();
                self.datasets.lock().unwrap().insert(name);
                Ok(CommandOutput::ok(""))
            }
            Some(&"destroy") => {
                let recursive = args.contains(&"-r");
                let name = args.last().unwrap().to_string();
                self.destroy_calls.lock().unwrap().push(name.clone());
                let mut datasets = self.datasets.lock().unwrap();
                if recursive {
                    let prefix = format!("{name}/");
                    datasets.retain(|d| d != &name && !d.starts_with(&prefix));
                } else {
                    datasets.remove(&name);
                }
                Ok(CommandOutput::ok(""))
            }
            Some(&"list") => {
                let name = args.last().unwrap().to_string();
                if !self.pools.lock().unwrap().contains(&name) {
                    return Ok(CommandOutput::err(format!(
                        "cannot open '{name}': dataset does not exist"
                    )));
                }
                let prefix = format!("{name}/");
                let mut lines = vec![name.clone()];
                lines.extend(
                    self.datasets
                        .lock()
                        .unwrap()
                        .iter()
                        .filter(|d| d.starts_with(&prefix))
                        .cloned(),
                );
                Ok(CommandOutput::ok(lines.join("\n")))
            }
            _ => Ok(CommandOutput::err("unsupported zfs invocation")),
        }
    }
}

/// Mount namespace that records unmount order instead of touching the host.
#[derive(Default)]
struct RecordingMounts {
    entries: Mutex<Vec<MountEntry>>,
    unmounted: Mutex<Vec<PathBuf>>,
}

#[async_trait]
impl MountNamespace for RecordingMounts {
    async fn mounts_under(&self, _pool: &str) -> poolstrap::Result<Vec<MountEntry>> {
        Ok(self.entries.lock().unwrap().clone())
    }

    async fn unmount(&self, mountpoint: &Path) -> poolstrap::Result<()> {
        self.unmounted.lock().unwrap().push(mountpoint.to_path_buf());
        Ok(())
    }
}

// =============================================================================
// Fixture
// =============================================================================

fn manager(runtime: Arc<MockZfsRuntime>) -> (PoolLifecycleManager, Arc<RecordingMounts>) {
    let mounts = Arc::new(RecordingMounts::default());
    (
        PoolLifecycleManager::new(runtime, mounts.clone()),
        mounts,
    )
}

fn pool(name: &str) -> StoragePool {
    StoragePool {
        name: name.to_string(),
        device: "/dev/sdb".to_string(),
        mountpoint: PathBuf::from(format!("/mnt/{name}")),
        cachefile: PathBuf::from(format!("/etc/{name}.cache")),
    }
}

// =============================================================================
// Create / Exists
// =============================================================================

mod create_tests {
    use super::*;

    #[tokio::test]
    async fn create_then_exists_with_exact_layout() {
        let runtime = MockZfsRuntime::with_state(&[], &[]);
        let (manager, _) = manager(runtime.clone());

        assert!(!manager.exists("pool1").await.unwrap());
        manager.create(&pool("pool1")).await.unwrap();

        assert!(manager.exists("pool1").await.unwrap());
        assert_eq!(
            runtime.dataset_names(),
            vec!["pool1/data".to_string(), "pool1/db".to_string()]
        );
    }

    #[tokio::test]
    async fn create_rejects_existing_pool() {
        let runtime = MockZfsRuntime::with_state(&["pool1"], &[]);
        let (manager, _) = manager(runtime);

        let err = manager.create(&pool("pool1")).await.unwrap_err();
        assert_matches!(err, poolstrap::Error::Pool { .. });
    }
}

// =============================================================================
// Import
// =============================================================================

mod import_tests {
    use super::*;

    #[tokio::test]
    async fn import_reattaches_pool() {
        let runtime = MockZfsRuntime::with_state(&[], &[]);
        let (manager, _) = manager(runtime.clone());

        manager
            .import(&PathBuf::from("/etc/pool1.cache"), "pool1")
            .await
            .unwrap();
        assert!(manager.exists("pool1").await.unwrap());
    }
}

// =============================================================================
// Update Convergence
// =============================================================================

mod update_tests {
    use super::*;

    #[tokio::test]
    async fn update_removes_deprecated_datasets_and_creates_layout() {
        let runtime = MockZfsRuntime::with_state(
            &["tank"],
            &[
                "tank/deathrow",
                "tank/repo",
                "tank/repo/github.com",
                "tank/repo/github.com/example",
            ],
        );
        let (manager, _) = manager(runtime.clone());

        manager.update("tank").await.unwrap();

        assert_eq!(
            runtime.dataset_names(),
            vec!["tank/data".to_string(), "tank/db".to_string()]
        );
    }

    #[tokio::test]
    async fn update_twice_is_idempotent() {
        let runtime = MockZfsRuntime::with_state(&["tank"], &["tank/deathrow", "tank/repo"]);
        let (manager, _) = manager(runtime.clone());

        manager.update("tank").await.unwrap();
        let after_first = runtime.dataset_names();
        let destroys_after_first = runtime.destroy_calls.lock().unwrap().len();

        manager.update("tank").await.unwrap();
        let after_second = runtime.dataset_names();
        let destroys_after_second = runtime.destroy_calls.lock().unwrap().len();

        assert_eq!(after_first, after_second);
        assert_eq!(after_first, vec!["tank/data".to_string(), "tank/db".to_string()]);
        // Nothing left to destroy on the second pass.
        assert_eq!(destroys_after_first, destroys_after_second);
    }

    #[tokio::test]
    async fn update_on_current_layout_changes_nothing() {
        let runtime = MockZfsRuntime::with_state(&["tank"], &["tank/data", "tank/db"]);
        let (manager, _) = manager(runtime.clone());

        manager.update("tank").await.unwrap();

        assert_eq!(
            runtime.dataset_names(),
            vec!["tank/data".to_string(), "tank/db".to_string()]
        );
        assert!(runtime.destroy_calls.lock().unwrap().is_empty());
    }
}

// =============================================================================
// Destroy / Unmount
// =============================================================================

mod teardown_tests {
    use super::*;

    #[tokio::test]
    async fn destroy_removes_pool_and_datasets() {
        let runtime = MockZfsRuntime::with_state(&["tank"], &["tank/data", "tank/db"]);
        let (manager, _) = manager(runtime.clone());

        manager.destroy("tank").await.unwrap();

        assert!(!manager.exists("tank").await.unwrap());
        assert!(runtime.dataset_names().is_empty());
    }

    #[tokio::test]
    async fn unmount_all_releases_deepest_paths_first() {
        let runtime = MockZfsRuntime::with_state(&["tank"], &[]);
        let (manager, mounts) = manager(runtime);
        *mounts.entries.lock().unwrap() = vec![
            MountEntry {
                source: "tank".to_string(),
                mountpoint: PathBuf::from("/mnt/tank"),
            },
            MountEntry {
                source: "tank/data".to_string(),
                mountpoint: PathBuf::from("/mnt/tank/data"),
            },
            MountEntry {
                source: "tank/db".to_string(),
                mountpoint: PathBuf::from("/mnt/tank/db"),
            },
        ];

        manager.unmount_all("tank").await.unwrap();

        let unmounted = mounts.unmounted.lock().unwrap().clone();
        assert_eq!(
            unmounted,
            vec![
                PathBuf::from("/mnt/tank/db"),
                PathBuf::from("/mnt/tank/data"),
                PathBuf::from("/mnt/tank"),
            ]
        );
    }
}
