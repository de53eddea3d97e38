//! Setup pipeline: runs each repository's init command with bounded retries.
//!
//! Repositories run in order. Each has an explicit list of [`Step`]s (only
//! [`Step::Setup`] today); a step is retried per the [`RetryPolicy`], its
//! output is streamed as [`PipelineEvent`]s, and a failed step either aborts
//! the whole run (the default) or only its own repository when
//! `continue_on_error` is set.

mod error;
mod event;
pub(crate) mod format;

pub(crate) use error::{PipelineError, StepError};
pub(crate) use event::PipelineEvent;

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

use crate::exec::{CommandExecutor, ExecError, ExecOptions, LineCallback, OutputStream};
use crate::retry::{Delay, RetryPolicy, TokioDelay};

/// A repository to set up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RepoSetup {
    pub name: String,
    /// Working directory for the repository's steps.
    pub path: String,
    /// Init command; blank means the step is skipped.
    pub command: String,
    /// Overrides applied on top of the pipeline's base environment.
    pub env: BTreeMap<String, String>,
}

impl RepoSetup {
    /// The steps to run for this repository, in order.
    pub fn steps(&self) -> Vec<Step> {
        vec![Step::Setup {
            command: self.command.clone(),
        }]
    }
}

/// One unit of work within a repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Step {
    /// The repository's init command.
    Setup { command: String },
}

impl Step {
    pub fn kind(&self) -> StepKind {
        match self {
            Self::Setup { .. } => StepKind::Setup,
        }
    }

    pub fn command(&self) -> &str {
        match self {
            Self::Setup { command } => command,
        }
    }
}

/// Identifies a step in events, results and errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum StepKind {
    Setup,
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Setup => write!(f, "setup"),
        }
    }
}

/// What happened to one step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct StepOutcome {
    pub step: StepKind,
    pub command: String,
    pub success: bool,
    pub attempts: u32,
    pub skipped: bool,
    pub error: Option<String>,
}

impl StepOutcome {
    fn skipped(step: StepKind) -> Self {
        Self {
            step,
            command: String::new(),
            success: true,
            attempts: 0,
            skipped: true,
            error: None,
        }
    }
}

/// Outcome of every step attempted for one repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RepoResult {
    pub name: String,
    pub path: String,
    pub success: bool,
    pub steps: Vec<StepOutcome>,
}

/// Result of a whole run. Repositories never attempted (after a fail-fast
/// abort) are absent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PipelineResult {
    pub success: bool,
    pub repos: Vec<RepoResult>,
}

impl PipelineResult {
    pub fn from_repos(repos: Vec<RepoResult>) -> Self {
        Self {
            success: repos.iter().all(|r| r.success),
            repos,
        }
    }

    pub fn failed(&self) -> impl Iterator<Item = &RepoResult> {
        self.repos.iter().filter(|r| !r.success)
    }
}

/// How a run behaves.
#[derive(Clone)]
pub(crate) struct PipelineOptions {
    pub retry: RetryPolicy,
    pub continue_on_error: bool,
    /// Shared environment for every repository.
    pub base_env: BTreeMap<String, String>,
    /// Per-attempt timeout passed to the executor.
    pub timeout: Option<Duration>,
    /// Receives progress events; `None` discards them.
    pub events: Option<UnboundedSender<PipelineEvent>>,
    pub delay: Arc<dyn Delay>,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            continue_on_error: false,
            base_env: BTreeMap::new(),
            timeout: None,
            events: None,
            delay: Arc::new(TokioDelay),
        }
    }
}

impl fmt::Debug for PipelineOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineOptions")
            .field("retry", &self.retry)
            .field("continue_on_error", &self.continue_on_error)
            .field("base_env", &self.base_env.keys().collect::<Vec<_>>())
            .field("timeout", &self.timeout)
            .field("events", &self.events.is_some())
            .finish_non_exhaustive()
    }
}

impl PipelineOptions {
    fn emit(&self, event: PipelineEvent) {
        if let Some(ref tx) = self.events {
            // A dropped receiver only means nobody is watching.
            let _ = tx.send(event);
        }
    }

    fn line_forwarder(&self, repo: &str, step: StepKind) -> Option<LineCallback> {
        let tx = self.events.clone()?;
        let repo = repo.to_string();
        Some(Arc::new(move |stream, line| {
            let line = line.to_string();
            let repo = repo.clone();
            let event = match stream {
                OutputStream::Stdout => PipelineEvent::StepStdout { repo, step, line },
                OutputStream::Stderr => PipelineEvent::StepStderr { repo, step, line },
            };
            let _ = tx.send(event);
        }))
    }
}

/// Base environment overlaid with the repository's overrides.
pub(crate) fn merge_env(
    base: &BTreeMap<String, String>,
    overrides: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut env = base.clone();
    env.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
    env
}

/// Runs every repository's steps.
///
/// Returns the full result when the run completes (even with failures under
/// `continue_on_error`). Under fail-fast, the first failed step aborts with
/// [`PipelineError::StepFailed`] carrying the partial result.
pub(crate) async fn run<E>(
    repos: &[RepoSetup],
    executor: &E,
    options: &PipelineOptions,
) -> Result<PipelineResult, PipelineError>
where
    E: CommandExecutor + ?Sized,
{
    let mut results = Vec::with_capacity(repos.len());

    for repo in repos {
        let mut result = RepoResult {
            name: repo.name.clone(),
            path: repo.path.clone(),
            success: true,
            steps: Vec::new(),
        };
        let env = merge_env(&options.base_env, &repo.env);

        for step in repo.steps() {
            let outcome = run_step(repo, &step, &env, executor, options).await;
            let failed = !outcome.success;
            let error = outcome.error.clone();
            result.steps.push(outcome);

            if failed {
                result.success = false;
                if !options.continue_on_error {
                    results.push(result);
                    return Err(PipelineError::StepFailed {
                        repo: repo.name.clone(),
                        step: step.kind(),
                        error: error.unwrap_or_default(),
                        result: PipelineResult::from_repos(results),
                    });
                }
                break;
            }
        }

        results.push(result);
    }

    Ok(PipelineResult::from_repos(results))
}

async fn run_step<E>(
    repo: &RepoSetup,
    step: &Step,
    env: &BTreeMap<String, String>,
    executor: &E,
    options: &PipelineOptions,
) -> StepOutcome
where
    E: CommandExecutor + ?Sized,
{
    let kind = step.kind();
    let command = step.command();
    if command.trim().is_empty() {
        debug!("No {} command for {}, skipping", kind, repo.name);
        return StepOutcome::skipped(kind);
    }

    let mut attempt = 1;
    loop {
        options.emit(PipelineEvent::StepStart {
            repo: repo.name.clone(),
            step: kind,
            command: command.to_string(),
            attempt,
        });

        match run_attempt(repo, kind, command, env, executor, options).await {
            Ok(()) => {
                options.emit(PipelineEvent::StepSuccess {
                    repo: repo.name.clone(),
                    step: kind,
                    command: command.to_string(),
                    attempts: attempt,
                });
                return StepOutcome {
                    step: kind,
                    command: command.to_string(),
                    success: true,
                    attempts: attempt,
                    skipped: false,
                    error: None,
                };
            }
            Err(e) if options.retry.has_next(attempt) => {
                options.emit(PipelineEvent::StepRetry {
                    repo: repo.name.clone(),
                    step: kind,
                    command: command.to_string(),
                    attempt,
                    next_attempt: attempt + 1,
                    error: e.to_string(),
                });
                options.delay.wait(options.retry.delay).await;
                attempt += 1;
            }
            Err(e) => {
                let error = e.to_string();
                options.emit(PipelineEvent::StepFailure {
                    repo: repo.name.clone(),
                    step: kind,
                    command: command.to_string(),
                    attempts: attempt,
                    error: error.clone(),
                });
                return StepOutcome {
                    step: kind,
                    command: command.to_string(),
                    success: false,
                    attempts: attempt,
                    skipped: false,
                    error: Some(error),
                };
            }
        }
    }
}

async fn run_attempt<E>(
    repo: &RepoSetup,
    kind: StepKind,
    command: &str,
    env: &BTreeMap<String, String>,
    executor: &E,
    options: &PipelineOptions,
) -> Result<(), StepError>
where
    E: CommandExecutor + ?Sized,
{
    let mut exec_options = ExecOptions::default()
        .with_cwd(repo.path.clone())
        .with_env(env.clone())
        .with_timeout(options.timeout);
    if let Some(forward) = options.line_forwarder(&repo.name, kind) {
        exec_options = exec_options.with_line_callback(forward);
    }

    let output = executor
        .run(command, exec_options)
        .await
        .map_err(|e| {
            if e.downcast_ref::<ExecError>().is_some_and(ExecError::is_timeout) {
                debug!(repo = %repo.name, step = %kind, "Attempt timed out");
            }
            StepError::Execution {
                command: command.to_string(),
                cause: format!("{e:#}"),
            }
        })?;

    if !output.success() {
        return Err(StepError::NonZeroExit {
            command: command.to_string(),
            exit_code: output.exit_code,
            stderr: output.stderr.trim().to_string(),
        });
    }
    Ok(())
}
