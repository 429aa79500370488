//! Remediation strategies.
//!
//! Each strategy attempts one way of making the filesystem usable and
//! reports a uniform outcome: success with the installed location, a
//! fallthrough to the next strategy, or a fatal stop. Strategies swallow
//! their internal errors into the outcome; nothing propagates past the
//! provisioner except its terminal state.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::domain::ports::{AssetStore, BuildService, KernelBuilder, ModuleHost};
use crate::domain::{InstalledLocation, RemediationStage};
use crate::kernel::KernelIdentity;
use crate::version::{compatible, ModuleVersion};

// =============================================================================
// Outcome
// =============================================================================

/// Result of one strategy attempt.
#[derive(Debug)]
pub enum StrategyOutcome {
    /// Filesystem is now usable; record where it came from.
    Success {
        location: InstalledLocation,
        stage: RemediationStage,
    },
    /// This strategy cannot help; try the next one.
    Fallthrough(String),
    /// Stop the run; continuing is unsafe or pointless.
    Fatal(String),
}

/// A single remediation strategy in the provisioner's ordered list.
#[async_trait]
pub trait RemediationStrategy: Send + Sync {
    fn stage(&self) -> RemediationStage;

    async fn attempt(
        &self,
        required: &ModuleVersion,
        kernel: &KernelIdentity,
    ) -> StrategyOutcome;
}

// =============================================================================
// Load Existing
// =============================================================================

/// Load a module already present on disk, gated by version compatibility.
/// An incompatible module is left in place untouched; replacing it is the
/// job of a later stage's explicit load.
pub struct LoadExistingStrategy {
    pub modules: Arc<dyn ModuleHost>,
}

#[async_trait]
impl RemediationStrategy for LoadExistingStrategy {
    fn stage(&self) -> RemediationStage {
        RemediationStage::LoadExisting
    }

    async fn attempt(
        &self,
        required: &ModuleVersion,
        kernel: &KernelIdentity,
    ) -> StrategyOutcome {
        let module_dir = match self.modules.find_module_dir(&kernel.release).await {
            Some(dir) => dir,
            None => {
                return StrategyOutcome::Fallthrough(format!(
                    "no module directory for kernel {}",
                    kernel.release
                ))
            }
        };

        let version = match self.modules.module_version(&module_dir).await {
            Some(v) => v,
            None => {
                return StrategyOutcome::Fallthrough(format!(
                    "module at {} reports no version",
                    module_dir.display()
                ))
            }
        };

        if !compatible(required, &version) {
            return StrategyOutcome::Fallthrough(format!(
                "installed module {version} is incompatible with required {required}"
            ));
        }

        debug!(dir = %module_dir.display(), %version, "loading existing module");
        match self.modules.load(&module_dir).await {
            Ok(()) => StrategyOutcome::Success {
                location: InstalledLocation::ModuleDir(module_dir),
                stage: RemediationStage::LoadExisting,
            },
            Err(e) => StrategyOutcome::Fallthrough(format!("kernel refused module load: {e}")),
        }
    }
}

// =============================================================================
// Fetch Precompiled
// =============================================================================

/// Fetch a precompiled module keyed by `(required, kernel release)` from the
/// remote asset store, extract it under the install root, and load it.
/// Network and extraction failures fall through; they never fail the run.
pub struct FetchPrecompiledStrategy {
    pub modules: Arc<dyn ModuleHost>,
    pub assets: Arc<dyn AssetStore>,
    pub install_root: PathBuf,
}

#[async_trait]
impl RemediationStrategy for FetchPrecompiledStrategy {
    fn stage(&self) -> RemediationStage {
        RemediationStage::FetchPrecompiled
    }

    async fn attempt(
        &self,
        required: &ModuleVersion,
        kernel: &KernelIdentity,
    ) -> StrategyOutcome {
        if let Err(e) = self
            .assets
            .fetch_module(required, &kernel.release, &self.install_root)
            .await
        {
            return StrategyOutcome::Fallthrough(format!("asset retrieval failed: {e}"));
        }

        let module_dir = match self.modules.find_module_dir(&kernel.release).await {
            Some(dir) => dir,
            None => {
                return StrategyOutcome::Fallthrough(
                    "asset extracted but no module directory appeared".to_string(),
                )
            }
        };

        match self.modules.load(&module_dir).await {
            Ok(()) => StrategyOutcome::Success {
                location: InstalledLocation::ModuleDir(module_dir),
                stage: RemediationStage::FetchPrecompiled,
            },
            Err(e) => StrategyOutcome::Fallthrough(format!("kernel refused fetched module: {e}")),
        }
    }
}

// =============================================================================
// Build From Source
// =============================================================================

/// Invoke the isolated build service and load whatever it produced. The
/// build targets the required version exactly, so no version re-check is
/// needed on the artifact. A run that produces no artifact but leaves the
/// kernel reporting built-in support is accepted as builtin provisioning.
pub struct BuildFromSourceStrategy {
    pub modules: Arc<dyn ModuleHost>,
    pub builder: Arc<dyn BuildService>,
    pub output_dir: PathBuf,
}

#[async_trait]
impl RemediationStrategy for BuildFromSourceStrategy {
    fn stage(&self) -> RemediationStage {
        RemediationStage::BuildFromSource
    }

    async fn attempt(
        &self,
        required: &ModuleVersion,
        kernel: &KernelIdentity,
    ) -> StrategyOutcome {
        if let Err(e) = self
            .builder
            .build(required, "kernel", &self.output_dir)
            .await
        {
            return StrategyOutcome::Fatal(format!("build service failed: {e}"));
        }

        let artifact = self.builder.artifact_path(&self.output_dir, &kernel.release);
        if artifact.is_dir() {
            info!(artifact = %artifact.display(), "build produced a module artifact");
            return match self.modules.load(&artifact).await {
                Ok(()) => StrategyOutcome::Success {
                    location: InstalledLocation::ModuleDir(artifact),
                    stage: RemediationStage::BuildFromSource,
                },
                Err(e) => {
                    StrategyOutcome::Fallthrough(format!("kernel refused built module: {e}"))
                }
            };
        }

        if self.modules.builtin_support().await {
            info!("no module artifact, but kernel reports built-in filesystem support");
            return StrategyOutcome::Success {
                location: InstalledLocation::Builtin,
                stage: RemediationStage::BuiltinKernel,
            };
        }

        StrategyOutcome::Fallthrough(
            "build produced no module artifact and no built-in support".to_string(),
        )
    }
}

// =============================================================================
// Kernel Rebuild
// =============================================================================

/// Full replacement-kernel build for families that cannot load modules.
/// Failure here is fatal: a partially built kernel is unsafe to reuse and
/// there is no later strategy to fall through to.
pub struct KernelRebuildStrategy {
    pub builder: Arc<dyn KernelBuilder>,
}

#[async_trait]
impl RemediationStrategy for KernelRebuildStrategy {
    fn stage(&self) -> RemediationStage {
        RemediationStage::BuildFromSource
    }

    async fn attempt(
        &self,
        required: &ModuleVersion,
        kernel: &KernelIdentity,
    ) -> StrategyOutcome {
        match self.builder.build(required, kernel).await {
            Ok(image) => {
                info!(image = %image.display(), "replacement kernel published");
                StrategyOutcome::Success {
                    location: InstalledLocation::Builtin,
                    stage: RemediationStage::BuiltinKernel,
                }
            }
            Err(e) => StrategyOutcome::Fatal(format!("kernel rebuild failed: {e}")),
        }
    }
}
