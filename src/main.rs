//! poolstrap binary
//!
//! Thin CLI over the library: `ensure` provisions the filesystem stack,
//! `pool` drives the lifecycle of the managed storage pool. Exit codes
//! distinguish an unusable environment (no compatible filesystem
//! obtainable, exit 2) from a pool operation failing on an otherwise
//! healthy filesystem (exit 1).

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use poolstrap::adapters::{
    CommandZfsRuntime, ContainerBuildService, FileMarkerStore, HttpAssetStore, KernelModuleHost,
    ProcMountNamespace,
};
use poolstrap::{
    default_required_version, AvailabilityProber, KernelBuildConfig, KernelBuildDriver,
    KernelIdentity, ModuleProvisioner, ModuleVersion, PoolLifecycleManager, ProvisionerConfig,
    ProvisionerPorts, StoragePool,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// poolstrap - ZFS stack provisioner and pool lifecycle manager
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info", global = true)]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON", global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Ensure a compatible filesystem stack is usable, remediating if needed
    Ensure {
        /// Required module version; overrides the per-kernel-family default
        #[arg(long, env = "POOLSTRAP_ZFS_VERSION")]
        zfs_version: Option<String>,

        /// Root under which fetched assets are extracted
        #[arg(long, default_value = "/")]
        install_root: PathBuf,

        /// Writable output directory handed to the build service
        #[arg(long, default_value = "/var/lib/poolstrap/build")]
        build_output_dir: PathBuf,

        /// Build service container image
        #[arg(long, env = "POOLSTRAP_BUILD_IMAGE", default_value = "poolstrap/zfs-builder:latest")]
        build_image: String,

        /// Base URL of the precompiled module asset store
        #[arg(
            long,
            env = "POOLSTRAP_ASSET_URL",
            default_value = "https://assets.poolstrap.dev/zfs"
        )]
        asset_base_url: String,

        /// Install marker file path
        #[arg(long, default_value = "/var/lib/poolstrap/installed-module")]
        marker_path: PathBuf,
    },

    /// Manage the storage pool
    Pool {
        #[command(subcommand)]
        operation: PoolCommand,
    },
}

#[derive(Subcommand, Debug)]
enum PoolCommand {
    /// Create the pool and its dataset layout
    Create {
        name: String,
        device: String,
        #[arg(long, default_value = "/var/lib/poolstrap/mnt")]
        mountpoint: PathBuf,
        #[arg(long, default_value = "/var/lib/poolstrap/pool.cachefile")]
        cachefile: PathBuf,
    },
    /// Re-attach a previously created pool from its cache descriptor
    Import {
        name: String,
        #[arg(long, default_value = "/var/lib/poolstrap/pool.cachefile")]
        cachefile: PathBuf,
    },
    /// Converge the dataset layout, removing deprecated datasets
    Update { name: String },
    /// Destroy the pool (irreversible)
    Destroy { name: String },
    /// Unmount everything under the pool, deepest first
    Unmount { name: String },
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(&cli);

    match cli.command {
        Command::Ensure {
            zfs_version,
            install_root,
            build_output_dir,
            build_image,
            asset_base_url,
            marker_path,
        } => {
            let kernel = KernelIdentity::detect()
                .await
                .context("unable to identify the running kernel")?;
            let required = match zfs_version {
                Some(raw) => ModuleVersion::parse(&raw)
                    .with_context(|| format!("unparsable version override `{raw}`"))?,
                None => default_required_version(kernel.family),
            };
            info!(
                release = %kernel.release,
                family = %kernel.family,
                %required,
                "ensuring filesystem stack"
            );

            let scratch = build_output_dir.join("assets");
            let ports = ProvisionerPorts {
                modules: Arc::new(KernelModuleHost::default()),
                assets: Arc::new(HttpAssetStore::new(asset_base_url, scratch)),
                builder: Arc::new(ContainerBuildService::new(build_image)),
                kernel_builder: Arc::new(KernelBuildDriver::new(KernelBuildConfig::default())),
                marker: Arc::new(FileMarkerStore::new(marker_path)),
            };
            let config = ProvisionerConfig {
                install_root,
                build_output_dir,
                kernel: Some(kernel),
            };

            let mut provisioner =
                ModuleProvisioner::new(AvailabilityProber::default_prober(), ports, config);
            let report = provisioner.ensure(&required).await?;

            if report.is_success() {
                info!(state = %report.state, "filesystem stack ready");
                return Ok(());
            }
            error!(state = %report.state, "provisioning failed");
            for attempt in &report.attempts {
                error!(stage = %attempt.stage, detail = %attempt.detail, "attempt failed");
            }
            // Environment unusable: no compatible filesystem available.
            std::process::exit(2);
        }

        Command::Pool { operation } => {
            let manager = PoolLifecycleManager::new(
                Arc::new(CommandZfsRuntime::detect()),
                Arc::new(ProcMountNamespace::default()),
            );
            run_pool_command(&manager, operation).await?;
            Ok(())
        }
    }
}

async fn run_pool_command(
    manager: &PoolLifecycleManager,
    operation: PoolCommand,
) -> anyhow::Result<()> {
    match operation {
        PoolCommand::Create {
            name,
            device,
            mountpoint,
            cachefile,
        } => {
            let pool = StoragePool {
                name: name.clone(),
                device,
                mountpoint,
                cachefile,
            };
            manager.create(&pool).await?;
            info!(pool = %name, "pool created");
        }
        PoolCommand::Import { name, cachefile } => {
            manager.import(&cachefile, &name).await?;
            info!(pool = %name, "pool imported");
        }
        PoolCommand::Update { name } => {
            manager.update(&name).await?;
            info!(pool = %name, "pool layout updated");
        }
        PoolCommand::Destroy { name } => {
            manager.destroy(&name).await?;
            info!(pool = %name, "pool destroyed");
        }
        PoolCommand::Unmount { name } => {
            manager.unmount_all(&name).await?;
            info!(pool = %name, "pool unmounted");
        }
    }
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(cli: &Cli) {
    let level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("hyper=warn".parse().unwrap())
        .add_directive("reqwest=warn".parse().unwrap());

    if cli.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}
