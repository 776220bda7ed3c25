use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SupervisorError {
    // Transport
    #[error("socket unavailable at {path}: {reason}")]
    Unavailable { path: PathBuf, reason: String },

    #[error("'{method}' call timed out after {timeout:?}")]
    Timeout { method: String, timeout: Duration },

    #[error("protocol error: {0}")]
    Protocol(String),

    /// The daemon answered, but with `ok: false`.
    #[error("daemon returned error: {message}")]
    Rpc { code: Option<String>, message: String },

    // Start preconditions
    #[error("service '{0}' is not installed")]
    NotInstalled(String),

    #[error("invalid entrypoint for '{service}': {reason}")]
    InvalidEntrypoint { service: String, reason: String },

    #[error("service '{service}' did not become ready within {timeout:?}")]
    StartTimeout { service: String, timeout: Duration },

    // Stop
    #[error("service '{0}' is not running")]
    NotRunning(String),

    #[error("refusing to signal pid {pid}: running '{actual}', expected '{expected}'")]
    ProcessMismatch {
        pid: u32,
        expected: String,
        actual: String,
    },

    #[error("an operation on '{0}' is already in progress")]
    OperationInProgress(String),

    #[error("invalid service name '{0}'")]
    InvalidServiceName(String),

    // Install
    #[error("package '{0}' not found in registry")]
    PackageNotFound(String),

    #[error("checksum mismatch for '{package}': expected {expected}, got {actual}")]
    ChecksumMismatch {
        package: String,
        expected: String,
        actual: String,
    },

    #[error("network failure fetching '{url}': {reason}")]
    NetworkFailure { url: String, reason: String },

    #[error("build of '{package}' failed ({status}): {stderr}")]
    BuildFailed {
        package: String,
        status: String,
        stderr: String,
    },

    #[error("installation of '{package}' failed: {reason}")]
    InstallFailed { package: String, reason: String },

    #[error("registry error: {0}")]
    Registry(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SupervisorError {
    /// Stable identifier for consumers that branch on the failure kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unavailable { .. } => "unavailable",
            Self::Timeout { .. } | Self::StartTimeout { .. } => "timeout",
            Self::Protocol(_) => "protocol",
            Self::Rpc { .. } => "rpc",
            Self::NotInstalled(_) => "not_installed",
            Self::InvalidEntrypoint { .. } => "invalid_entrypoint",
            Self::NotRunning(_) => "not_running",
            Self::ProcessMismatch { .. } => "process_mismatch",
            Self::OperationInProgress(_) => "operation_in_progress",
            Self::InvalidServiceName(_) => "invalid_service_name",
            Self::PackageNotFound(_) => "package_not_found",
            Self::ChecksumMismatch { .. } => "checksum_mismatch",
            Self::NetworkFailure { .. } => "network_failure",
            Self::BuildFailed { .. } => "build_failed",
            Self::InstallFailed { .. } => "install_failed",
            Self::Registry(_) => "registry",
            Self::Config(_) => "config",
            Self::Io(_) => "io",
            Self::Serialization(_) => "serialization",
        }
    }

    /// Transport-level failures: the daemon could not be reached or did not speak the protocol.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Unavailable { .. } | Self::Timeout { .. } | Self::Protocol(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, SupervisorError>;
