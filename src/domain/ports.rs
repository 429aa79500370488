//! Domain Ports (Port/Adapter Pattern)
//!
//! Abstractions over mutable host state: kernel module tooling, the remote
//! asset store, the isolated build service, the install marker, the mount
//! namespace, and the pool control tools. Infrastructure adapters implement
//! these traits against the real host; tests swap in mocks so the decision
//! logic runs without a real kernel or filesystem present.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::error::Result;
use crate::kernel::KernelIdentity;
use crate::version::ModuleVersion;

// =============================================================================
// Module Host Port
// =============================================================================

/// Port for kernel-module discovery, loading, and unloading.
#[async_trait]
pub trait ModuleHost: Send + Sync {
    /// Locate an on-disk module directory for the given kernel release.
    async fn find_module_dir(&self, release: &str) -> Option<PathBuf>;

    /// Extract the module's version from its filesystem metadata.
    /// Unreadable metadata reads as `None`, never as an error.
    async fn module_version(&self, module_dir: &Path) -> Option<String>;

    /// Attach the module to the running kernel.
    async fn load(&self, module_dir: &Path) -> Result<()>;

    /// Detach the module from the running kernel.
    async fn unload(&self) -> Result<()>;

    /// Whether the kernel now reports built-in filesystem support.
    async fn builtin_support(&self) -> bool;
}

// =============================================================================
// Asset Store Port
// =============================================================================

/// Port for retrieving precompiled modules from the remote asset store.
#[async_trait]
pub trait AssetStore: Send + Sync {
    /// Fetch the asset addressed by `(required, kernel_release)` and extract
    /// it under `install_root`. Network and extraction failures surface as
    /// errors; the caller decides whether they are fatal.
    async fn fetch_module(
        &self,
        required: &ModuleVersion,
        kernel_release: &str,
        install_root: &Path,
    ) -> Result<()>;
}

// =============================================================================
// Build Service Port
// =============================================================================

/// Port for the external isolated build service.
#[async_trait]
pub trait BuildService: Send + Sync {
    /// Run a build with the declared inputs, populating `output_dir`.
    /// Returning `Ok` means the service ran to completion; it does not imply
    /// an artifact was produced.
    async fn build(
        &self,
        required: &ModuleVersion,
        build_mode: &str,
        output_dir: &Path,
    ) -> Result<()>;

    /// Predictable artifact location keyed by the running kernel's release.
    fn artifact_path(&self, output_dir: &Path, kernel_release: &str) -> PathBuf;
}

// =============================================================================
// Kernel Builder Port
// =============================================================================

/// Port for the full replacement-kernel build path, used only for kernel
/// families that cannot load modules dynamically.
#[async_trait]
pub trait KernelBuilder: Send + Sync {
    /// Build a kernel with the filesystem compiled in; returns the published
    /// image path.
    async fn build(&self, required: &ModuleVersion, kernel: &KernelIdentity) -> Result<PathBuf>;
}

// =============================================================================
// Install Marker Port
// =============================================================================

use super::InstalledLocation;

/// Port for the cross-run install marker. Written on provisioning success,
/// read back only by the unload operation, never consulted when deciding
/// compatibility.
pub trait MarkerStore: Send + Sync {
    fn write(&self, location: &InstalledLocation) -> Result<()>;
    fn read(&self) -> Result<Option<InstalledLocation>>;
}

// =============================================================================
// Mount Namespace Port
// =============================================================================

/// A single active mount belonging to the managed pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    /// Mount source, e.g. `tank/data`.
    pub source: String,
    /// Mount target path.
    pub mountpoint: PathBuf,
}

/// Port over the host's root mount namespace, so a nested or virtualized
/// execution context can still enumerate and release host-level mounts.
#[async_trait]
pub trait MountNamespace: Send + Sync {
    /// Active mounts whose source is the pool or one of its datasets.
    async fn mounts_under(&self, pool: &str) -> Result<Vec<MountEntry>>;

    /// Unmount a single path in the host's root namespace.
    async fn unmount(&self, mountpoint: &Path) -> Result<()>;
}

// =============================================================================
// Pool Control Port
// =============================================================================

/// Captured result of a pool control tool invocation.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            success: true,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn err(stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }
}

/// Port over the `zpool`/`zfs` control tools. Errors mean the tool could not
/// run at all; a tool that ran and reported failure comes back as an
/// unsuccessful [`CommandOutput`] for the caller to interpret.
#[async_trait]
pub trait ZfsRuntime: Send + Sync {
    async fn zpool(&self, args: &[&str]) -> Result<CommandOutput>;
    async fn zfs(&self, args: &[&str]) -> Result<CommandOutput>;
}
