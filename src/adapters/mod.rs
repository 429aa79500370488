//! Infrastructure adapters implementing the domain ports against the real
//! host: kernel module tooling, the HTTP asset store, the container build
//! service, the pool control tools, and host-global state (install marker,
//! mount namespace).

pub mod assets;
pub mod buildsvc;
pub mod host;
pub mod kmod;
pub mod zfs_cli;

pub use assets::HttpAssetStore;
pub use buildsvc::ContainerBuildService;
pub use host::{FileMarkerStore, ProcMountNamespace};
pub use kmod::KernelModuleHost;
pub use zfs_cli::CommandZfsRuntime;

use std::path::Path;
use std::process::Output;

use tokio::process::Command;

use crate::error::{Error, Result};

/// Run an external program, capturing output. An unspawnable program is an
/// error; a nonzero exit is returned to the caller for interpretation.
pub(crate) async fn run_command(
    program: &Path,
    args: &[&str],
    cwd: Option<&Path>,
) -> Result<Output> {
    let mut command = Command::new(program);
    command.args(args);
    if let Some(dir) = cwd {
        command.current_dir(dir);
    }
    command.output().await.map_err(|e| Error::Command {
        command: format!("{} {}", program.display(), args.join(" ")),
        detail: e.to_string(),
    })
}

/// Like [`run_command`] but a nonzero exit is promoted to an error carrying
/// trimmed stderr.
pub(crate) async fn run_checked(program: &Path, args: &[&str], cwd: Option<&Path>) -> Result<String> {
    let output = run_command(program, args, cwd).await?;
    if !output.status.success() {
        return Err(Error::Command {
            command: format!("{} {}", program.display(), args.join(" ")),
            detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}
