use std::io;
use std::time::Duration;

/// Failures surfaced by the sandbox core.
///
/// A command that runs and exits non-zero is not an error; its status is
/// reported on the [`CommandHandle`](crate::sandbox::CommandHandle).
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("container runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    #[error("failed to spawn {program}: {source}")]
    SpawnFailed {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("sandbox {name} is not running")]
    NotRunning { name: String },

    #[error("sandbox {name} exited before becoming ready")]
    LaunchFailed { name: String },

    #[error("sandbox {name} not ready after {}s", timeout.as_secs())]
    LaunchTimeout { name: String, timeout: Duration },

    #[error("failed to build image {image}: {stderr}")]
    BuildFailed { image: String, stderr: String },

    #[error("transfer failed while {step}: {reason}")]
    TransferFailed { step: String, reason: String },

    #[error("command on {name} timed out after {}s: {line}", timeout.as_secs())]
    TimedOut {
        name: String,
        line: String,
        timeout: Duration,
    },

    #[error("runtime {operation} failed: {stderr}")]
    RuntimeFailed { operation: String, stderr: String },

    #[error("invalid command options: {0}")]
    InvalidOptions(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl SandboxError {
    /// Short stable name of the variant, for machine-readable output.
    pub fn kind(&self) -> &'static str {
        match self {
            SandboxError::RuntimeUnavailable(_) => "runtime_unavailable",
            SandboxError::SpawnFailed { .. } => "spawn_failed",
            SandboxError::NotRunning { .. } => "not_running",
            SandboxError::LaunchFailed { .. } => "launch_failed",
            SandboxError::LaunchTimeout { .. } => "launch_timeout",
            SandboxError::BuildFailed { .. } => "build_failed",
            SandboxError::TransferFailed { .. } => "transfer_failed",
            SandboxError::TimedOut { .. } => "timed_out",
            SandboxError::RuntimeFailed { .. } => "runtime_failed",
            SandboxError::InvalidOptions(_) => "invalid_options",
            SandboxError::Io(_) => "io",
        }
    }

    pub(crate) fn transfer(step: impl Into<String>, reason: impl ToString) -> Self {
        SandboxError::TransferFailed {
            step: step.into(),
            reason: reason.to_string(),
        }
    }
}

pub type Result<T, E = SandboxError> = std::result::Result<T, E>;
