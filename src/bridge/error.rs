//! Errors raised while preparing, attaching to or tearing down a session.

/// Errors from the interactive session bridge.
///
/// Every variant names the sandbox or local path involved plus the
/// underlying cause, so a failure is actionable without re-running verbosely.
#[derive(Debug, thiserror::Error)]
pub(crate) enum BridgeError {
    /// Installing sshd / websockify / ssh-keygen failed.
    #[error("Failed to install session dependencies on sandbox {sandbox}: {cause}")]
    DependencyInstall { sandbox: String, cause: String },

    /// The install command succeeded but the tools are still missing.
    #[error("Session dependencies still missing on sandbox {sandbox} after install: {}", .missing.join(", "))]
    DependenciesUnavailable {
        sandbox: String,
        missing: Vec<String>,
    },

    /// A local filesystem or key-generation step failed.
    #[error("Local session step '{operation}' failed for {path}: {cause}")]
    Local {
        operation: &'static str,
        path: String,
        cause: String,
    },

    /// `ssh-keygen` produced an empty public key.
    #[error("Generated public key {path} is empty")]
    EmptyPublicKey { path: String },

    /// The remote user's home directory could not be determined.
    #[error("Cannot resolve the home directory of the remote user on sandbox {sandbox}")]
    HomeNotFound { sandbox: String },

    /// Every probed port pair was occupied.
    #[error("No free port pair in {start}-{end} on sandbox {sandbox} after {attempts} attempts")]
    PortsExhausted {
        sandbox: String,
        attempts: u32,
        start: u16,
        end: u16,
    },

    /// A remote preparation step failed.
    #[error("Session step '{step}' failed on sandbox {sandbox}: {cause}")]
    Remote {
        step: &'static str,
        sandbox: String,
        cause: String,
    },

    /// The local ssh client could not be started.
    #[error("Failed to start ssh client '{program}': {cause}")]
    ClientSpawn { program: String, cause: String },

    /// The ssh client exited unsuccessfully.
    #[error("ssh session to sandbox {sandbox} exited with code {code}")]
    ClientExit { sandbox: String, code: i32 },

    /// The ssh client was killed by a signal.
    #[error("ssh session to sandbox {sandbox} was terminated by signal {signal}")]
    ClientSignal { sandbox: String, signal: i32 },
}

impl BridgeError {
    /// Creates a `Remote` error.
    pub fn remote(step: &'static str, sandbox: &str, cause: impl Into<String>) -> Self {
        Self::Remote {
            step,
            sandbox: sandbox.to_string(),
            cause: cause.into(),
        }
    }

    /// Creates a `Local` error.
    pub fn local(operation: &'static str, path: impl AsRef<std::path::Path>, cause: impl ToString) -> Self {
        Self::Local {
            operation,
            path: path.as_ref().display().to_string(),
            cause: cause.to_string(),
        }
    }

    /// Returns true if the failure came from the interactive client.
    pub fn is_client_failure(&self) -> bool {
        matches!(
            self,
            Self::ClientSpawn { .. } | Self::ClientExit { .. } | Self::ClientSignal { .. }
        )
    }
}
