//! poolstrap - ZFS Stack Provisioner and Pool Lifecycle Manager
//!
//! Ensures a host has a working, version-compatible ZFS storage stack before
//! a data-management service starts, then manages the lifecycle of the
//! storage pool that service depends on.
//!
//! # Architecture
//!
//! ```text
//! AvailabilityProber ──▶ ModuleProvisioner ──▶ PoolLifecycleManager
//!                            │
//!                            ├─ LoadExisting
//!                            ├─ FetchPrecompiled
//!                            ├─ BuildFromSource (isolated build service)
//!                            └─ KernelBuildDriver (module-incapable kernels)
//! ```
//!
//! The provisioner probes first and short-circuits when the stack is already
//! usable; otherwise it walks an ordered list of remediation strategies,
//! each swallowing its own failures into a uniform outcome. The pool manager
//! runs only after provisioning succeeds and has no knowledge of how the
//! filesystem became available.
//!
//! # Modules
//!
//! - [`adapters`] - Infrastructure adapters implementing domain ports
//! - [`domain`] - Provisioning state machine types and host ports
//! - [`error`] - Error types
//! - [`kbuild`] - Replacement-kernel build driver
//! - [`kernel`] - Kernel identity and family classification
//! - [`pool`] - Pool and dataset lifecycle operations
//! - [`probe`] - Filesystem availability probing
//! - [`provisioner`] - Remediation state machine and strategies
//! - [`version`] - Module version parsing and epoch compatibility

pub mod adapters;
pub mod domain;
pub mod error;
pub mod kbuild;
pub mod kernel;
pub mod pool;
pub mod probe;
pub mod provisioner;
pub mod version;

// Re-export commonly used types
pub use domain::{FailureReason, InstalledLocation, ProvisioningState, RemediationStage};
pub use error::{Error, Result};
pub use kbuild::{KernelBuildConfig, KernelBuildDriver};
pub use kernel::{KernelFamily, KernelIdentity};
pub use pool::{PoolLifecycleManager, StoragePool};
pub use probe::{AvailabilityProber, AvailabilitySnapshot, ProberConfig};
pub use provisioner::{ModuleProvisioner, ProvisionReport, ProvisionerConfig, ProvisionerPorts};
pub use version::{compatible, default_required_version, exact_match, ModuleVersion};
