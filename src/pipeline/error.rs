//! Pipeline error types.

use super::{PipelineResult, StepKind};

/// Why a single attempt of a step failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub(crate) enum StepError {
    /// The command ran and exited non-zero.
    #[error("Command `{command}` exited with code {exit_code}{}", stderr_suffix(.stderr))]
    NonZeroExit {
        command: String,
        exit_code: i64,
        stderr: String,
    },

    /// The executor could not run the command at all (spawn failure, timeout, lost sandbox).
    #[error("Command `{command}` could not be run: {cause}")]
    Execution { command: String, cause: String },
}

fn stderr_suffix(stderr: &str) -> String {
    if stderr.is_empty() {
        String::new()
    } else {
        format!(": {stderr}")
    }
}

/// The run was aborted by fail-fast policy.
#[derive(Debug, thiserror::Error)]
pub(crate) enum PipelineError {
    /// A step exhausted its attempts with `continue_on_error` off.
    ///
    /// `result` holds every repository attempted so far, including the
    /// failing one.
    #[error("Setup failed for repository '{repo}' at step '{step}': {error}")]
    StepFailed {
        repo: String,
        step: StepKind,
        error: String,
        result: PipelineResult,
    },
}

impl PipelineError {
    /// The partial result recorded before the abort.
    pub fn result(&self) -> &PipelineResult {
        match self {
            Self::StepFailed { result, .. } => result,
        }
    }
}
