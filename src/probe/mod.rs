//! Availability probing for the ZFS stack.
//!
//! Answers one question with no side effects: is a compatible filesystem
//! already usable right now? Three independent signals are inspected:
//! kernel-reported filesystem support, the control device node, and the
//! userspace tools. A resource that cannot be read counts as absent, never
//! as an error.

use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::debug;

// =============================================================================
// Configuration
// =============================================================================

/// Well-known install locations for the userspace control tools.
pub const KNOWN_ZPOOL_PATHS: &[&str] = &[
    "/sbin/zpool",
    "/usr/sbin/zpool",
    "/usr/local/sbin/zpool",
    "/usr/bin/zpool",
];
pub const KNOWN_ZFS_PATHS: &[&str] = &[
    "/sbin/zfs",
    "/usr/sbin/zfs",
    "/usr/local/sbin/zfs",
    "/usr/bin/zfs",
];

/// Probed host locations, overridable for tests.
#[derive(Debug, Clone)]
pub struct ProberConfig {
    /// Kernel filesystem registry, normally `/proc/filesystems`.
    pub proc_filesystems: PathBuf,
    /// Module sysfs directory, normally `/sys/module/zfs`.
    pub module_sysfs: PathBuf,
    /// Control device node, normally `/dev/zfs`.
    pub device_node: PathBuf,
    /// Candidate locations of the `zpool` binary.
    pub zpool_paths: Vec<PathBuf>,
    /// Candidate locations of the `zfs` binary.
    pub zfs_paths: Vec<PathBuf>,
}

impl Default for ProberConfig {
    fn default() -> Self {
        Self {
            proc_filesystems: PathBuf::from("/proc/filesystems"),
            module_sysfs: PathBuf::from("/sys/module/zfs"),
            device_node: PathBuf::from("/dev/zfs"),
            zpool_paths: KNOWN_ZPOOL_PATHS.iter().map(PathBuf::from).collect(),
            zfs_paths: KNOWN_ZFS_PATHS.iter().map(PathBuf::from).collect(),
        }
    }
}

// =============================================================================
// Snapshot
// =============================================================================

/// Point-in-time availability of the three probed signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AvailabilitySnapshot {
    /// Kernel reports the filesystem (loaded module or built-in).
    pub kernel_support: bool,
    /// The control device node exists.
    pub device_node: bool,
    /// Both userspace control tools are installed.
    pub userspace_tools: bool,
}

impl AvailabilitySnapshot {
    /// The short-circuit condition that skips all remediation.
    pub fn is_fully_available(&self) -> bool {
        self.kernel_support && self.device_node && self.userspace_tools
    }
}

// =============================================================================
// Prober
// =============================================================================

/// Inspects host state for an already-usable filesystem stack.
pub struct AvailabilityProber {
    config: ProberConfig,
}

impl AvailabilityProber {
    pub fn new(config: ProberConfig) -> Self {
        Self { config }
    }

    /// Prober over the real host locations.
    pub fn default_prober() -> Self {
        Self::new(ProberConfig::default())
    }

    /// Take a snapshot of current availability. Read-only; never fails.
    pub fn probe(&self) -> AvailabilitySnapshot {
        let snapshot = AvailabilitySnapshot {
            kernel_support: filesystem_registered(&self.config.proc_filesystems)
                || self.config.module_sysfs.is_dir(),
            device_node: self.config.device_node.exists(),
            userspace_tools: first_existing(&self.config.zpool_paths).is_some()
                && first_existing(&self.config.zfs_paths).is_some(),
        };
        debug!(?snapshot, "probed filesystem availability");
        snapshot
    }
}

/// Whether the kernel filesystem registry lists `zfs`. Unreadable registry
/// counts as unsupported.
pub(crate) fn filesystem_registered(proc_filesystems: &Path) -> bool {
    match std::fs::read_to_string(proc_filesystems) {
        Ok(contents) => contents
            .lines()
            .any(|line| line.split_whitespace().last() == Some("zfs")),
        Err(_) => false,
    }
}

pub(crate) fn first_existing(candidates: &[PathBuf]) -> Option<&PathBuf> {
    candidates.iter().find(|path| path.exists())
}

// =============================================================================
// Tests
// =============================================================================
