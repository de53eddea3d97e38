//! Domain-specific error types for sandbox operations.
//!
//! Typed errors enable callers to match on specific failure modes
//! rather than parsing error message strings.

/// Errors that can occur during sandbox operations.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// Docker daemon is not running or not accessible.
    #[error("Docker is not available: {message}")]
    DockerUnavailable { message: String },

    /// No sandbox with the given id exists.
    #[error("Sandbox not found: {id}")]
    NotFound { id: String },

    /// The sandbox exists but is not running.
    #[error("Sandbox {id} is not running (state: {state})")]
    NotRunning { id: String, state: String },

    /// A lifecycle operation (create, start, exec, remove) failed.
    #[error("Sandbox operation '{operation}' failed on {id}: {message}")]
    OperationFailed {
        operation: &'static str,
        id: String,
        message: String,
    },

    /// No externally reachable address could be derived for a port.
    #[error("Cannot resolve a reachable URL for port {port} on sandbox {id}: {message}")]
    HostResolution { id: String, port: u16, message: String },
}

impl SandboxError {
    /// Creates a `DockerUnavailable` error.
    pub fn docker_unavailable(message: impl Into<String>) -> Self {
        Self::DockerUnavailable {
            message: message.into(),
        }
    }

    /// Creates a `NotFound` error.
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound { id: id.into() }
    }

    /// Creates a `NotRunning` error.
    pub fn not_running(id: impl Into<String>, state: impl Into<String>) -> Self {
        Self::NotRunning {
            id: id.into(),
            state: state.into(),
        }
    }

    /// Creates an `OperationFailed` error.
    pub fn operation_failed(
        operation: &'static str,
        id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::OperationFailed {
            operation,
            id: id.into(),
            message: message.into(),
        }
    }

    /// Creates a `HostResolution` error.
    pub fn host_resolution(id: impl Into<String>, port: u16, message: impl Into<String>) -> Self {
        Self::HostResolution {
            id: id.into(),
            port,
            message: message.into(),
        }
    }

    /// Returns true if this is a Docker unavailability error.
    #[cfg(test)]
    pub fn is_docker_unavailable(&self) -> bool {
        matches!(self, Self::DockerUnavailable { .. })
    }

    /// Returns true if the sandbox does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}
