//! Typed progress events emitted while the pipeline runs.

use serde::Serialize;

use super::StepKind;

/// One progress event. [`name`](Self::name) gives the stable wire name
/// (`step:start`, `step:stdout`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event")]
pub(crate) enum PipelineEvent {
    #[serde(rename = "step:start")]
    StepStart {
        repo: String,
        step: StepKind,
        command: String,
        attempt: u32,
    },
    #[serde(rename = "step:stdout")]
    StepStdout {
        repo: String,
        step: StepKind,
        line: String,
    },
    #[serde(rename = "step:stderr")]
    StepStderr {
        repo: String,
        step: StepKind,
        line: String,
    },
    #[serde(rename = "step:retry", rename_all = "camelCase")]
    StepRetry {
        repo: String,
        step: StepKind,
        command: String,
        attempt: u32,
        next_attempt: u32,
        error: String,
    },
    #[serde(rename = "step:success")]
    StepSuccess {
        repo: String,
        step: StepKind,
        command: String,
        attempts: u32,
    },
    #[serde(rename = "step:failure")]
    StepFailure {
        repo: String,
        step: StepKind,
        command: String,
        attempts: u32,
        error: String,
    },
}

impl PipelineEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::StepStart { .. } => "step:start",
            Self::StepStdout { .. } => "step:stdout",
            Self::StepStderr { .. } => "step:stderr",
            Self::StepRetry { .. } => "step:retry",
            Self::StepSuccess { .. } => "step:success",
            Self::StepFailure { .. } => "step:failure",
        }
    }

    pub fn repo(&self) -> &str {
        match self {
            Self::StepStart { repo, .. }
            | Self::StepStdout { repo, .. }
            | Self::StepStderr { repo, .. }
            | Self::StepRetry { repo, .. }
            | Self::StepSuccess { repo, .. }
            | Self::StepFailure { repo, .. } => repo,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_names() {
        let retry = PipelineEvent::StepRetry {
            repo: "api".to_string(),
            step: StepKind::Setup,
            command: "make".to_string(),
            attempt: 1,
            next_attempt: 2,
            error: "boom".to_string(),
        };
        assert_eq!(retry.name(), "step:retry");
        assert_eq!(retry.repo(), "api");

        let line = PipelineEvent::StepStderr {
            repo: "web".to_string(),
            step: StepKind::Setup,
            line: "warning".to_string(),
        };
        assert_eq!(line.name(), "step:stderr");
        assert_eq!(line.repo(), "web");
    }

    #[test]
    fn test_event_json_uses_wire_names() {
        let retry = PipelineEvent::StepRetry {
            repo: "api".to_string(),
            step: StepKind::Setup,
            command: "make".to_string(),
            attempt: 1,
            next_attempt: 2,
            error: "boom".to_string(),
        };
        let json = serde_json::to_value(&retry).unwrap();
        assert_eq!(json["event"], "step:retry");
        assert_eq!(json["step"], "setup");
        assert_eq!(json["nextAttempt"], 2);
        assert_eq!(json["attempt"], 1);
    }
}
