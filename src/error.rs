//! Error types for poolstrap

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while provisioning the filesystem stack or
/// managing the storage pool
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP transport error
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// External command could not be spawned or exited nonzero
    #[error("command `{command}` failed: {detail}")]
    Command { command: String, detail: String },

    /// Network failure inside a build-critical path
    #[error("network failure while {context}: {detail}")]
    Network { context: String, detail: String },

    /// Kernel build stage failed
    #[error("kernel build failed during {stage}: {detail}")]
    KernelBuild { stage: String, detail: String },

    /// Isolated build service invocation failed
    #[error("build service failed: {0}")]
    BuildService(String),

    /// Module present but the kernel refused to attach it
    #[error("module load refused for {module_dir}: {detail}")]
    ModuleLoad { module_dir: String, detail: String },

    /// Pool operation failed on an otherwise healthy filesystem
    #[error("pool operation {operation} failed for {pool}: {detail}")]
    Pool {
        operation: String,
        pool: String,
        detail: String,
    },

    /// Terminal provisioning failure: every remediation stage exhausted
    #[error("no compatible filesystem module or kernel could be provisioned")]
    NoCompatibleModule,

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}
