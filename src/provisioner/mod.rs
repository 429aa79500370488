//! Module Provisioner
//!
//! The entry-point state machine. Probes for an already-usable filesystem
//! first (cheap, no side effects) and short-circuits on success; otherwise
//! classifies the running kernel and drives the remediation strategies in
//! strict priority order, collecting per-attempt diagnostics for the final
//! report. Kernels that cannot load modules skip straight to the
//! replacement-kernel build.

pub mod strategy;

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::domain::ports::{AssetStore, BuildService, KernelBuilder, MarkerStore, ModuleHost};
use crate::domain::{FailureReason, InstalledLocation, ProvisioningState, RemediationStage};
use crate::error::Result;
use crate::kernel::KernelIdentity;
use crate::probe::AvailabilityProber;
use crate::version::ModuleVersion;

use self::strategy::{
    BuildFromSourceStrategy, FetchPrecompiledStrategy, KernelRebuildStrategy,
    LoadExistingStrategy, RemediationStrategy, StrategyOutcome,
};

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for a provisioning run.
#[derive(Debug, Clone)]
pub struct ProvisionerConfig {
    /// Root under which fetched assets are extracted, normally `/`.
    pub install_root: PathBuf,
    /// Writable output directory handed to the build service.
    pub build_output_dir: PathBuf,
    /// Kernel identity override; detected from the host when `None`.
    pub kernel: Option<KernelIdentity>,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            install_root: PathBuf::from("/"),
            build_output_dir: PathBuf::from("/var/lib/poolstrap/build"),
            kernel: None,
        }
    }
}

/// Host ports the provisioner drives.
pub struct ProvisionerPorts {
    pub modules: Arc<dyn ModuleHost>,
    pub assets: Arc<dyn AssetStore>,
    pub builder: Arc<dyn BuildService>,
    pub kernel_builder: Arc<dyn KernelBuilder>,
    pub marker: Arc<dyn MarkerStore>,
}

// =============================================================================
// Report
// =============================================================================

/// Diagnostic record of one failed strategy attempt.
#[derive(Debug, Clone, Serialize)]
pub struct AttemptRecord {
    pub stage: RemediationStage,
    pub detail: String,
    pub at: DateTime<Utc>,
}

/// Outcome of a provisioning run: the terminal state plus the diagnostics
/// collected from every failed attempt along the way.
#[derive(Debug, Clone, Serialize)]
pub struct ProvisionReport {
    pub state: ProvisioningState,
    pub attempts: Vec<AttemptRecord>,
}

impl ProvisionReport {
    pub fn is_success(&self) -> bool {
        self.state.is_terminal_success()
    }
}

// =============================================================================
// Provisioner
// =============================================================================

/// Owns the provisioning state for the duration of one run.
pub struct ModuleProvisioner {
    prober: AvailabilityProber,
    ports: ProvisionerPorts,
    config: ProvisionerConfig,
    state: ProvisioningState,
}

impl ModuleProvisioner {
    pub fn new(
        prober: AvailabilityProber,
        ports: ProvisionerPorts,
        config: ProvisionerConfig,
    ) -> Self {
        Self {
            prober,
            ports,
            config,
            state: ProvisioningState::Unknown,
        }
    }

    pub fn state(&self) -> ProvisioningState {
        self.state
    }

    /// Ensure a compatible filesystem stack is usable, remediating if needed.
    ///
    /// Errors are reserved for environmental impossibilities (the kernel
    /// identity cannot be determined at all); every remediation failure is
    /// reported through the returned state instead.
    pub async fn ensure(&mut self, required: &ModuleVersion) -> Result<ProvisionReport> {
        self.state = ProvisioningState::Checking;
        if self.prober.probe().is_fully_available() {
            info!("filesystem stack already available, skipping remediation");
            self.state = ProvisioningState::Available;
            return Ok(ProvisionReport {
                state: self.state,
                attempts: Vec::new(),
            });
        }

        let kernel = match &self.config.kernel {
            Some(identity) => identity.clone(),
            None => KernelIdentity::detect().await?,
        };
        info!(
            release = %kernel.release,
            family = %kernel.family,
            %required,
            "filesystem unavailable, starting remediation"
        );

        let strategies = self.strategies_for(&kernel);
        let mut attempts = Vec::new();

        for strategy in strategies {
            let stage = strategy.stage();
            self.state = ProvisioningState::Remediating(stage);
            match strategy.attempt(required, &kernel).await {
                StrategyOutcome::Success { location, stage } => {
                    if let Err(e) = self.ports.marker.write(&location) {
                        warn!(error = %e, "failed to persist install marker");
                    }
                    info!(%stage, marker = %location.as_marker_line(), "provisioning succeeded");
                    self.state = ProvisioningState::Provisioned(stage);
                    return Ok(ProvisionReport {
                        state: self.state,
                        attempts,
                    });
                }
                StrategyOutcome::Fallthrough(detail) => {
                    warn!(%stage, %detail, "remediation stage fell through");
                    attempts.push(AttemptRecord {
                        stage,
                        detail,
                        at: Utc::now(),
                    });
                }
                StrategyOutcome::Fatal(detail) => {
                    error!(%stage, %detail, "remediation stage failed fatally");
                    attempts.push(AttemptRecord {
                        stage,
                        detail,
                        at: Utc::now(),
                    });
                    break;
                }
            }
        }

        self.state = ProvisioningState::Failed(FailureReason::NoCompatibleModule);
        Ok(ProvisionReport {
            state: self.state,
            attempts,
        })
    }

    /// Detach whatever the last successful run installed. Reads the install
    /// marker (its only reader) and is a no-op for built-in support or when
    /// no marker exists.
    pub async fn unload(&self) -> Result<()> {
        match self.ports.marker.read()? {
            None => Ok(()),
            Some(InstalledLocation::Builtin) => Ok(()),
            Some(InstalledLocation::ModuleDir(_)) => self.ports.modules.unload().await,
        }
    }

    /// Ordered strategy list for the kernel at hand. Module-incapable
    /// kernels get the replacement-kernel build and nothing else.
    fn strategies_for(&self, kernel: &KernelIdentity) -> Vec<Box<dyn RemediationStrategy>> {
        if !kernel.family.can_load_modules() {
            return vec![Box::new(KernelRebuildStrategy {
                builder: Arc::clone(&self.ports.kernel_builder),
            })];
        }
        vec![
            Box::new(LoadExistingStrategy {
                modules: Arc::clone(&self.ports.modules),
            }),
            Box::new(FetchPrecompiledStrategy {
                modules: Arc::clone(&self.ports.modules),
                assets: Arc::clone(&self.ports.assets),
                install_root: self.config.install_root.clone(),
            }),
            Box::new(BuildFromSourceStrategy {
                modules: Arc::clone(&self.ports.modules),
                builder: Arc::clone(&self.ports.builder),
                output_dir: self.config.build_output_dir.clone(),
            }),
        ]
    }
}
