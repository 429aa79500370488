//! Provisioner Integration Tests
//!
//! Drives the full remediation state machine against mock host ports: the
//! short-circuit path, the strategy priority order, builtin acceptance, the
//! module-incapable kernel route, and the terminal failure state.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use assert_matches::assert_matches;
use async_trait::async_trait;
use tempfile::TempDir;

use poolstrap::domain::ports::{
    AssetStore, BuildService, KernelBuilder, MarkerStore, ModuleHost,
};
use poolstrap::{
    AvailabilityProber, FailureReason, InstalledLocation, KernelIdentity, ModuleProvisioner,
    ModuleVersion, ProberConfig, ProvisioningState, ProvisionerConfig, ProvisionerPorts,
    RemediationStage,
};

// =============================================================================
// Mock Ports
// =============================================================================

/// Shared module-host state so the asset store mock can make a module
/// directory appear after a successful fetch.
#[derive(Default)]
struct MockHostState {
    module_dir: Mutex<Option<PathBuf>>,
    version: Mutex<Option<String>>,
    load_refused: AtomicBool,
    builtin: AtomicBool,
    load_calls: AtomicUsize,
    unload_calls: AtomicUsize,
}

struct MockModuleHost {
    state: Arc<MockHostState>,
}

#[async_trait]
impl ModuleHost for MockModuleHost {
    async fn find_module_dir(&self, _release: &str) -> Option<PathBuf> {
        self.state.module_dir.lock().unwrap().clone()
    }

    async fn module_version(&self, _module_dir: &Path) -> Option<String> {
        self.state.version.lock().unwrap().clone()
    }

    async fn load(&self, module_dir: &Path) -> poolstrap::Result<()> {
        self.state.load_calls.fetch_add(1, Ordering::SeqCst);
        if self.state.load_refused.load(Ordering::SeqCst) {
            return Err(poolstrap::Error::ModuleLoad {
                module_dir: module_dir.display().to_string(),
                detail: "simulated refusal".to_string(),
            });
        }
        Ok(())
    }

    async fn unload(&self) -> poolstrap::Result<()> {
        self.state.unload_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn builtin_support(&self) -> bool {
        self.state.builtin.load(Ordering::SeqCst)
    }
}

struct MockAssetStore {
    succeed: bool,
    installs_dir: Option<PathBuf>,
    state: Arc<MockHostState>,
    calls: AtomicUsize,
}

#[async_trait]
impl AssetStore for MockAssetStore {
    async fn fetch_module(
        &self,
        _required: &ModuleVersion,
        _kernel_release: &str,
        _install_root: &Path,
    ) -> poolstrap::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.succeed {
            return Err(poolstrap::Error::Internal(
                "simulated 404 from asset store".to_string(),
            ));
        }
        if let Some(dir) = &self.installs_dir {
            *self.state.module_dir.lock().unwrap() = Some(dir.clone());
        }
        Ok(())
    }
}

struct MockBuildService {
    succeed: bool,
    /// When set, `build` creates the artifact directory for this release.
    artifact_release: Option<String>,
    calls: AtomicUsize,
}

#[async_trait]
impl BuildService for MockBuildService {
    async fn build(
        &self,
        _required: &ModuleVersion,
        _build_mode: &str,
        output_dir: &Path,
    ) -> poolstrap::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.succeed {
            return Err(poolstrap::Error::BuildService(
                "simulated container failure".to_string(),
            ));
        }
        if let Some(release) = &self.artifact_release {
            std::fs::create_dir_all(output_dir.join(release)).unwrap();
        }
        Ok(())
    }

    fn artifact_path(&self, output_dir: &Path, kernel_release: &str) -> PathBuf {
        output_dir.join(kernel_release)
    }
}

struct MockKernelBuilder {
    succeed: bool,
    calls: AtomicUsize,
}

#[async_trait]
impl KernelBuilder for MockKernelBuilder {
    async fn build(
        &self,
        _required: &ModuleVersion,
        _kernel: &KernelIdentity,
    ) -> poolstrap::Result<PathBuf> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.succeed {
            Ok(PathBuf::from("/var/lib/poolstrap/kernel/bzImage"))
        } else {
            Err(poolstrap::Error::KernelBuild {
                stage: "compile".to_string(),
                detail: "simulated compile failure".to_string(),
            })
        }
    }
}

#[derive(Default)]
struct MockMarkerStore {
    stored: Mutex<Option<InstalledLocation>>,
}

impl MarkerStore for MockMarkerStore {
    fn write(&self, location: &InstalledLocation) -> poolstrap::Result<()> {
        *self.stored.lock().unwrap() = Some(location.clone());
        Ok(())
    }

    fn read(&self) -> poolstrap::Result<Option<InstalledLocation>> {
        Ok(self.stored.lock().unwrap().clone())
    }
}

// =============================================================================
// Fixture
// =============================================================================

const RELEASE: &str = "5.15.0-86-generic";
const WSL2_RELEASE: &str = "5.15.90.1-microsoft-standard-WSL2";

struct Fixture {
    state: Arc<MockHostState>,
    assets: Arc<MockAssetStore>,
    builder: Arc<MockBuildService>,
    kernel_builder: Arc<MockKernelBuilder>,
    marker: Arc<MockMarkerStore>,
    provisioner: ModuleProvisioner,
    _probe_dir: TempDir,
    _build_dir: TempDir,
}

struct FixtureOptions {
    available: bool,
    release: &'static str,
    fetch_succeeds: bool,
    fetch_installs_dir: Option<PathBuf>,
    build_succeeds: bool,
    build_artifact: bool,
    kernel_build_succeeds: bool,
}

impl Default for FixtureOptions {
    fn default() -> Self {
        Self {
            available: false,
            release: RELEASE,
            fetch_succeeds: false,
            fetch_installs_dir: None,
            build_succeeds: true,
            build_artifact: false,
            kernel_build_succeeds: true,
        }
    }
}

fn fixture(options: FixtureOptions) -> Fixture {
    let probe_dir = TempDir::new().unwrap();
    let probe_config = ProberConfig {
        proc_filesystems: probe_dir.path().join("filesystems"),
        module_sysfs: probe_dir.path().join("module-zfs"),
        device_node: probe_dir.path().join("dev-zfs"),
        zpool_paths: vec![probe_dir.path().join("zpool")],
        zfs_paths: vec![probe_dir.path().join("zfs")],
    };
    if options.available {
        std::fs::write(&probe_config.proc_filesystems, "\tzfs\n").unwrap();
        std::fs::write(&probe_config.device_node, "").unwrap();
        std::fs::write(&probe_config.zpool_paths[0], "").unwrap();
        std::fs::write(&probe_config.zfs_paths[0], "").unwrap();
    }

    let build_dir = TempDir::new().unwrap();
    let state = Arc::new(MockHostState::default());
    let assets = Arc::new(MockAssetStore {
        succeed: options.fetch_succeeds,
        installs_dir: options.fetch_installs_dir,
        state: Arc::clone(&state),
        calls: AtomicUsize::new(0),
    });
    let builder = Arc::new(MockBuildService {
        succeed: options.build_succeeds,
        artifact_release: options.build_artifact.then(|| options.release.to_string()),
        calls: AtomicUsize::new(0),
    });
    let kernel_builder = Arc::new(MockKernelBuilder {
        succeed: options.kernel_build_succeeds,
        calls: AtomicUsize::new(0),
    });
    let marker = Arc::new(MockMarkerStore::default());

    let ports = ProvisionerPorts {
        modules: Arc::new(MockModuleHost {
            state: Arc::clone(&state),
        }),
        assets: assets.clone(),
        builder: builder.clone(),
        kernel_builder: kernel_builder.clone(),
        marker: marker.clone(),
    };
    let config = ProvisionerConfig {
        install_root: probe_dir.path().to_path_buf(),
        build_output_dir: build_dir.path().to_path_buf(),
        kernel: Some(KernelIdentity::from_parts(
            options.release,
            format!("Linux host {} x86_64 GNU/Linux", options.release),
        )),
    };
    let provisioner =
        ModuleProvisioner::new(AvailabilityProber::new(probe_config), ports, config);

    Fixture {
        state,
        assets,
        builder,
        kernel_builder,
        marker,
        provisioner,
        _probe_dir: probe_dir,
        _build_dir: build_dir,
    }
}

fn required() -> ModuleVersion {
    ModuleVersion::new(2, 2, 2)
}

// =============================================================================
// Short-Circuit
// =============================================================================

mod short_circuit {
    use super::*;

    #[tokio::test]
    async fn available_host_skips_all_remediation() {
        let mut fx = fixture(FixtureOptions {
            available: true,
            ..Default::default()
        });

        let report = fx.provisioner.ensure(&required()).await.unwrap();

        assert_eq!(report.state, ProvisioningState::Available);
        assert!(report.attempts.is_empty());
        assert_eq!(fx.assets.calls.load(Ordering::SeqCst), 0);
        assert_eq!(fx.builder.calls.load(Ordering::SeqCst), 0);
        assert_eq!(fx.kernel_builder.calls.load(Ordering::SeqCst), 0);
        assert_eq!(fx.state.load_calls.load(Ordering::SeqCst), 0);
    }
}

// =============================================================================
// Strategy Order
// =============================================================================

mod strategy_order {
    use super::*;

    #[tokio::test]
    async fn loads_existing_compatible_module() {
        let fx_dir = PathBuf::from("/lib/modules/5.15.0-86-generic/extra/zfs");
        let mut fx = fixture(FixtureOptions::default());
        *fx.state.module_dir.lock().unwrap() = Some(fx_dir.clone());
        *fx.state.version.lock().unwrap() = Some("2.1.5".to_string());

        let report = fx.provisioner.ensure(&required()).await.unwrap();

        assert_eq!(
            report.state,
            ProvisioningState::Provisioned(RemediationStage::LoadExisting)
        );
        assert_eq!(
            fx.marker.read().unwrap(),
            Some(InstalledLocation::ModuleDir(fx_dir))
        );
        assert_eq!(fx.assets.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn incompatible_module_falls_through_to_fetch() {
        let fetched = PathBuf::from("/lib/modules/5.15.0-86-generic/extra/zfs");
        let mut fx = fixture(FixtureOptions {
            fetch_succeeds: true,
            fetch_installs_dir: Some(fetched.clone()),
            ..Default::default()
        });
        // Legacy-epoch module cannot satisfy a modern requirement.
        *fx.state.module_dir.lock().unwrap() = Some(PathBuf::from("/stale"));
        *fx.state.version.lock().unwrap() = Some("0.8.6".to_string());

        let report = fx.provisioner.ensure(&required()).await.unwrap();

        assert_eq!(
            report.state,
            ProvisioningState::Provisioned(RemediationStage::FetchPrecompiled)
        );
        assert_eq!(report.attempts.len(), 1);
        assert_eq!(report.attempts[0].stage, RemediationStage::LoadExisting);
        assert_eq!(
            fx.marker.read().unwrap(),
            Some(InstalledLocation::ModuleDir(fetched))
        );
    }

    #[tokio::test]
    async fn load_refusal_is_not_fatal() {
        let mut fx = fixture(FixtureOptions {
            fetch_succeeds: false,
            build_artifact: true,
            ..Default::default()
        });
        *fx.state.module_dir.lock().unwrap() = Some(PathBuf::from("/present"));
        *fx.state.version.lock().unwrap() = Some("2.1.5".to_string());
        fx.state.load_refused.store(true, Ordering::SeqCst);

        let report = fx.provisioner.ensure(&required()).await.unwrap();

        // Every load attempt is refused, so even the built artifact cannot
        // attach; the run exhausts all stages without erroring out.
        assert_matches!(report.state, ProvisioningState::Failed(_));
        assert!(report.attempts.len() >= 3);
    }

    #[tokio::test]
    async fn fetch_failure_falls_through_to_build() {
        let mut fx = fixture(FixtureOptions {
            fetch_succeeds: false,
            build_artifact: true,
            ..Default::default()
        });

        let report = fx.provisioner.ensure(&required()).await.unwrap();

        assert_eq!(
            report.state,
            ProvisioningState::Provisioned(RemediationStage::BuildFromSource)
        );
        assert_eq!(report.attempts.len(), 2);
        assert_eq!(fx.builder.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn builtin_support_accepted_without_artifact() {
        let mut fx = fixture(FixtureOptions {
            build_artifact: false,
            ..Default::default()
        });
        fx.state.builtin.store(true, Ordering::SeqCst);

        let report = fx.provisioner.ensure(&required()).await.unwrap();

        assert_eq!(
            report.state,
            ProvisioningState::Provisioned(RemediationStage::BuiltinKernel)
        );
        assert_eq!(fx.marker.read().unwrap(), Some(InstalledLocation::Builtin));
    }
}

// =============================================================================
// Terminal Failure
// =============================================================================

mod terminal_failure {
    use super::*;

    #[tokio::test]
    async fn all_stages_failing_reports_no_compatible_module() {
        let mut fx = fixture(FixtureOptions::default());

        let report = fx.provisioner.ensure(&required()).await.unwrap();

        assert_eq!(
            report.state,
            ProvisioningState::Failed(FailureReason::NoCompatibleModule)
        );
        assert_eq!(report.attempts.len(), 3);
        assert_eq!(report.attempts[0].stage, RemediationStage::LoadExisting);
        assert_eq!(report.attempts[1].stage, RemediationStage::FetchPrecompiled);
        assert_eq!(report.attempts[2].stage, RemediationStage::BuildFromSource);
        assert_eq!(fx.marker.read().unwrap(), None);
    }

    #[tokio::test]
    async fn build_service_error_is_fatal() {
        let mut fx = fixture(FixtureOptions {
            build_succeeds: false,
            ..Default::default()
        });

        let report = fx.provisioner.ensure(&required()).await.unwrap();

        assert_matches!(report.state, ProvisioningState::Failed(_));
    }
}

// =============================================================================
// Module-Incapable Kernels
// =============================================================================

mod no_module_kernels {
    use super::*;

    #[tokio::test]
    async fn routes_straight_to_kernel_rebuild() {
        let mut fx = fixture(FixtureOptions {
            release: WSL2_RELEASE,
            ..Default::default()
        });

        let report = fx.provisioner.ensure(&required()).await.unwrap();

        assert_eq!(
            report.state,
            ProvisioningState::Provisioned(RemediationStage::BuiltinKernel)
        );
        assert_eq!(fx.kernel_builder.calls.load(Ordering::SeqCst), 1);
        // LoadExisting and FetchPrecompiled are skipped entirely.
        assert_eq!(fx.state.load_calls.load(Ordering::SeqCst), 0);
        assert_eq!(fx.assets.calls.load(Ordering::SeqCst), 0);
        assert_eq!(fx.marker.read().unwrap(), Some(InstalledLocation::Builtin));
    }

    #[tokio::test]
    async fn rebuild_failure_is_terminal() {
        let mut fx = fixture(FixtureOptions {
            release: WSL2_RELEASE,
            kernel_build_succeeds: false,
            ..Default::default()
        });

        let report = fx.provisioner.ensure(&required()).await.unwrap();

        assert_eq!(
            report.state,
            ProvisioningState::Failed(FailureReason::NoCompatibleModule)
        );
        assert_eq!(report.attempts.len(), 1);
    }
}

// =============================================================================
// Unload
// =============================================================================

mod unload {
    use super::*;

    #[tokio::test]
    async fn unload_without_marker_is_a_noop() {
        let fx = fixture(FixtureOptions::default());
        fx.provisioner.unload().await.unwrap();
        assert_eq!(fx.state.unload_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn builtin_marker_skips_module_unload() {
        let fx = fixture(FixtureOptions::default());
        fx.marker.write(&InstalledLocation::Builtin).unwrap();
        fx.provisioner.unload().await.unwrap();
        assert_eq!(fx.state.unload_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn module_marker_detaches_module() {
        let fx = fixture(FixtureOptions::default());
        fx.marker
            .write(&InstalledLocation::ModuleDir(PathBuf::from("/somewhere")))
            .unwrap();
        fx.provisioner.unload().await.unwrap();
        assert_eq!(fx.state.unload_calls.load(Ordering::SeqCst), 1);
    }
}
