//! Domain layer: provisioning state machine types and host ports.

pub mod ports;

use std::path::PathBuf;

use serde::Serialize;

// =============================================================================
// Remediation Stages
// =============================================================================

/// Remediation strategies in strict priority order, plus the built-in
/// acceptance outcome of a source build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RemediationStage {
    /// Load a module already present on disk.
    LoadExisting,
    /// Fetch a precompiled module matching the exact running kernel.
    FetchPrecompiled,
    /// Build from source inside the isolated build service.
    BuildFromSource,
    /// Filesystem support compiled into the kernel image itself.
    BuiltinKernel,
}

impl std::fmt::Display for RemediationStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RemediationStage::LoadExisting => write!(f, "load-existing"),
            RemediationStage::FetchPrecompiled => write!(f, "fetch-precompiled"),
            RemediationStage::BuildFromSource => write!(f, "build-from-source"),
            RemediationStage::BuiltinKernel => write!(f, "builtin-kernel"),
        }
    }
}

// =============================================================================
// Provisioning State
// =============================================================================

/// Terminal failure reasons surfaced to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FailureReason {
    /// Every remediation stage was exhausted without success.
    NoCompatibleModule,
}

/// State of a single provisioning run. Exactly one instance exists per run
/// and it is never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ProvisioningState {
    /// Initial state.
    Unknown,
    /// Probing host availability.
    Checking,
    /// Already usable; terminal success with zero side effects.
    Available,
    /// Driving a remediation stage.
    Remediating(RemediationStage),
    /// Remediation succeeded at the given stage; terminal success.
    Provisioned(RemediationStage),
    /// Terminal failure.
    Failed(FailureReason),
}

impl ProvisioningState {
    pub fn is_terminal_success(&self) -> bool {
        matches!(
            self,
            ProvisioningState::Available | ProvisioningState::Provisioned(_)
        )
    }
}

impl std::fmt::Display for ProvisioningState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProvisioningState::Unknown => write!(f, "Unknown"),
            ProvisioningState::Checking => write!(f, "Checking"),
            ProvisioningState::Available => write!(f, "Available"),
            ProvisioningState::Remediating(stage) => write!(f, "Remediating({stage})"),
            ProvisioningState::Provisioned(stage) => write!(f, "Provisioned({stage})"),
            ProvisioningState::Failed(FailureReason::NoCompatibleModule) => {
                write!(f, "Failed(no-compatible-module)")
            }
        }
    }
}

// =============================================================================
// Installed Location
// =============================================================================

/// Marker sentinel recorded when filesystem support is compiled into the
/// kernel rather than installed as a module directory.
pub const BUILTIN_SENTINEL: &str = "builtin";

/// Which remediation artifact is live on the host; recorded in the install
/// marker and read back only by the unload path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstalledLocation {
    /// Directory holding the loaded module objects.
    ModuleDir(PathBuf),
    /// Built into the kernel image; nothing to unload.
    Builtin,
}

impl InstalledLocation {
    /// Single-line marker file representation.
    pub fn as_marker_line(&self) -> String {
        match self {
            InstalledLocation::ModuleDir(dir) => dir.display().to_string(),
            InstalledLocation::Builtin => BUILTIN_SENTINEL.to_string(),
        }
    }

    /// Parse a marker line written by [`Self::as_marker_line`].
    pub fn parse_marker_line(line: &str) -> Option<Self> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return None;
        }
        if trimmed == BUILTIN_SENTINEL {
            Some(InstalledLocation::Builtin)
        } else {
            Some(InstalledLocation::ModuleDir(PathBuf::from(trimmed)))
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
