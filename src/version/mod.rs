//! Module version parsing and epoch-aware compatibility rules.
//!
//! ZFS module versions fall into two incompatible epochs: the legacy 0.8.x
//! line shipped by enterprise distributions, and the modern 2.x line. Within
//! the legacy epoch any patch level of the same minor is acceptable; within
//! the modern epoch any minor/patch is acceptable. Versions never satisfy a
//! requirement from the other epoch.

use serde::{Deserialize, Serialize};

use crate::kernel::KernelFamily;

// =============================================================================
// ModuleVersion
// =============================================================================

/// A module version of the form `major.minor[.patch][-qualifier]`.
///
/// The qualifier (e.g. a distribution build suffix) is carried for display
/// but ignored by every comparison.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    pub qualifier: Option<String>,
}

impl ModuleVersion {
    pub fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
            qualifier: None,
        }
    }

    /// Parse `major.minor[.patch][-qualifier]`. Returns `None` on anything
    /// that does not match; callers treat that as incompatible, not as an
    /// error.
    pub fn parse(input: &str) -> Option<Self> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return None;
        }

        let (numeric, qualifier) = match trimmed.split_once('-') {
            Some((head, tail)) if !tail.is_empty() => (head, Some(tail.to_string())),
            Some((head, _)) => (head, None),
            None => (trimmed, None),
        };

        let mut parts = numeric.split('.');
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next()?.parse().ok()?;
        let patch = match parts.next() {
            Some(p) => p.parse().ok()?,
            None => 0,
        };
        if parts.next().is_some() {
            return None;
        }

        Some(Self {
            major,
            minor,
            patch,
            qualifier,
        })
    }

    /// The version with any qualifier trimmed, e.g. `2.1.5`.
    pub fn base(&self) -> String {
        format!("{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl std::fmt::Display for ModuleVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.qualifier {
            Some(q) => write!(f, "{}.{}.{}-{}", self.major, self.minor, self.patch, q),
            None => write!(f, "{}.{}.{}", self.major, self.minor, self.patch),
        }
    }
}

// =============================================================================
// Compatibility
// =============================================================================

/// Decide whether a discovered candidate version satisfies the required
/// build version. Fails closed: an empty or unparsable candidate is
/// incompatible.
pub fn compatible(required: &ModuleVersion, candidate: &str) -> bool {
    let candidate = match ModuleVersion::parse(candidate) {
        Some(v) => v,
        None => return false,
    };

    match (required.major, candidate.major) {
        // Legacy epoch: the 0.8.x family accepts any patch level, but a
        // different 0.x minor is a different epoch entirely.
        (0, 0) => candidate.minor == required.minor,
        // Modern epoch: any 2.x minor/patch satisfies any 2.x requirement.
        (2, 2) => true,
        // Same major outside the known epochs: minor acts as a floor.
        (r, c) if r == c => candidate.minor >= required.minor,
        // Mismatched epochs are never compatible.
        _ => false,
    }
}

/// Strict equality after qualifier trimming. Used only to validate a freshly
/// built artifact against the version that was requested; installed modules
/// are accepted through [`compatible`] instead.
pub fn exact_match(required: &str, candidate: &str) -> bool {
    fn trim_qualifier(v: &str) -> &str {
        v.trim().split('-').next().unwrap_or("")
    }
    let required = trim_qualifier(required);
    if required.is_empty() {
        return false;
    }
    required == trim_qualifier(candidate)
}

/// Default required build version for a kernel family, used when no
/// environment override is present. Enterprise distribution kernels stay on
/// the legacy 0.8 module line their packaged stack tracks; everything else
/// targets the modern line.
pub fn default_required_version(family: KernelFamily) -> ModuleVersion {
    match family {
        KernelFamily::DistributionEnterprise => ModuleVersion::new(0, 8, 0),
        _ => ModuleVersion::new(2, 2, 2),
    }
}

// =============================================================================
// Tests
// =============================================================================
