//! Kernel identity and host family classification.
//!
//! The running kernel is identified once per run from `uname` output and
//! classified into a closed set of families. Classification is an ordered
//! table of `(predicate, family)` rules evaluated top to bottom, so new host
//! types are added as data rather than as control flow.

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::debug;

use crate::error::{Error, Result};

// =============================================================================
// Kernel Family
// =============================================================================

/// Closed classification of kernel hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KernelFamily {
    /// Virtualized kernel that cannot load modules dynamically; filesystem
    /// support requires a full replacement kernel build.
    VirtualizedNoModule,
    /// Windows subsystem translation layer (no real Linux kernel).
    WindowsSubsystem,
    /// Mainstream distribution kernel (Debian, Ubuntu, Fedora, Arch, ...).
    DistributionStandard,
    /// Enterprise distribution kernel (RHEL/CentOS lineage).
    DistributionEnterprise,
    /// No rule matched.
    Unclassified,
}

impl KernelFamily {
    /// Whether this kernel can attach loadable modules at runtime.
    pub fn can_load_modules(&self) -> bool {
        !matches!(self, KernelFamily::VirtualizedNoModule)
    }
}

impl std::fmt::Display for KernelFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KernelFamily::VirtualizedNoModule => write!(f, "virtualized-no-module"),
            KernelFamily::WindowsSubsystem => write!(f, "windows-subsystem"),
            KernelFamily::DistributionStandard => write!(f, "distribution-standard"),
            KernelFamily::DistributionEnterprise => write!(f, "distribution-enterprise"),
            KernelFamily::Unclassified => write!(f, "unclassified"),
        }
    }
}

// =============================================================================
// Classification Rules
// =============================================================================

/// Predicate over `(release, uname)`.
type FamilyPredicate = fn(&str, &str) -> bool;

/// Ordered rule table; first match wins.
const FAMILY_RULES: &[(FamilyPredicate, KernelFamily)] = &[
    // WSL2 ships a Microsoft-built virtualized kernel that rejects
    // out-of-tree module loading.
    (
        |release, _| release.contains("microsoft-standard"),
        KernelFamily::VirtualizedNoModule,
    ),
    // WSL1 releases look like `4.4.0-19041-Microsoft`.
    (
        |release, uname| release.ends_with("-Microsoft") || uname.contains("Microsoft"),
        KernelFamily::WindowsSubsystem,
    ),
    // RHEL lineage embeds the el<N> marker in the release string.
    (
        |release, _| release.contains(".el"),
        KernelFamily::DistributionEnterprise,
    ),
    (
        |release, _| {
            ["-generic", "-amd64", "-arch", ".fc", "-cloud", "-azure", "-gcp", "-aws"]
                .iter()
                .any(|marker| release.contains(marker))
        },
        KernelFamily::DistributionStandard,
    ),
];

fn classify(release: &str, uname: &str) -> KernelFamily {
    for (predicate, family) in FAMILY_RULES {
        if predicate(release, uname) {
            return *family;
        }
    }
    KernelFamily::Unclassified
}

// =============================================================================
// Kernel Identity
// =============================================================================

/// Immutable record of the running kernel, computed once per run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelIdentity {
    /// `uname -r` output, e.g. `5.15.90.1-microsoft-standard-WSL2`.
    pub release: String,
    /// Full `uname -a` line.
    pub uname: String,
    /// Leading upstream version portion of the release, e.g. `5.15.90.1`.
    pub version: String,
    /// Release remainder after the upstream version, e.g.
    /// `-microsoft-standard-WSL2`.
    pub variant: String,
    /// Classified host family.
    pub family: KernelFamily,
}

impl KernelIdentity {
    /// Build an identity from raw `uname` fields.
    pub fn from_parts(release: impl Into<String>, uname: impl Into<String>) -> Self {
        let release = release.into();
        let uname = uname.into();
        let (version, variant) = split_release(&release);
        let family = classify(&release, &uname);
        Self {
            release,
            uname,
            version,
            variant,
            family,
        }
    }

    /// Query the host kernel via `uname`.
    pub async fn detect() -> Result<Self> {
        let release = uname(&["-r"]).await?;
        let uname_all = uname(&["-a"]).await?;
        let identity = Self::from_parts(release, uname_all);
        debug!(
            release = %identity.release,
            family = %identity.family,
            "classified running kernel"
        );
        Ok(identity)
    }
}

/// Split a release string into its upstream version prefix and the
/// distribution variant suffix.
fn split_release(release: &str) -> (String, String) {
    let split_at = release
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(release.len());
    let version = release[..split_at].trim_end_matches('.').to_string();
    let variant = release[split_at..].to_string();
    (version, variant)
}

async fn uname(args: &[&str]) -> Result<String> {
    let output = Command::new("uname")
        .args(args)
        .output()
        .await
        .map_err(|e| Error::Command {
            command: format!("uname {}", args.join(" ")),
            detail: e.to_string(),
        })?;
    if !output.status.success() {
        return Err(Error::Command {
            command: format!("uname {}", args.join(" ")),
            detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

// =============================================================================
// Tests
// =============================================================================
