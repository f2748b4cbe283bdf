use thiserror::Error;

use crate::models::{LifecycleState, SandboxRuntimeType};

#[derive(Error, Debug)]
pub enum CorralError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The backing daemon could not be reached. Retryable.
    #[error("Runtime {runtime} unavailable for sandbox {id}: {reason}")]
    RuntimeUnavailable {
        runtime: SandboxRuntimeType,
        id: String,
        reason: String,
    },

    #[error("Sandbox {id} is already running")]
    AlreadyRunning { id: String },

    #[error("Sandbox {id} is already stopped")]
    AlreadyStopped { id: String },

    #[error("Runtime {runtime} rejected allocation for sandbox {id}: {reason}")]
    ResourceExhausted {
        runtime: SandboxRuntimeType,
        id: String,
        reason: String,
    },

    #[error("Sandbox {0} is already registered")]
    DuplicateIdentity(String),

    #[error("Sandbox not found: {0}")]
    NotFound(String),

    #[error("Cannot {operation} sandbox {id} while it is {state}")]
    InvalidTransition {
        id: String,
        state: LifecycleState,
        operation: &'static str,
    },

    #[error("Sandbox {id} did not report running after {probes} probes")]
    HealthCheckFailed { id: String, probes: u32 },

    #[error("{operation} of sandbox {id} was cancelled")]
    Cancelled { id: String, operation: &'static str },

    #[error("Cannot connect to {runtime} at {endpoint}: {reason}")]
    Connect {
        runtime: SandboxRuntimeType,
        endpoint: String,
        reason: String,
    },

    #[error("Runtime {0} is not configured")]
    UnsupportedRuntime(SandboxRuntimeType),

    #[error("No free host ports in range {start}-{end}")]
    PortsExhausted { start: u16, end: u16 },

    /// The in-sandbox tool server could not run the request.
    #[error("Execution in sandbox {id} failed: {reason}")]
    Execution { id: String, reason: String },

    #[error("Runtime {runtime} failed for sandbox {id}: {reason}")]
    Runtime {
        runtime: SandboxRuntimeType,
        id: String,
        reason: String,
    },
}

impl CorralError {
    /// Worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, CorralError::RuntimeUnavailable { .. })
    }

    /// Outcomes that mean the runtime is already where we wanted it.
    pub fn is_benign(&self) -> bool {
        matches!(
            self,
            CorralError::AlreadyRunning { .. } | CorralError::AlreadyStopped { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, CorralError>;
