//! Console rendering of pipeline progress.
//!
//! Pure formatting functions return strings; [`spawn_reporter`] is the only
//! part that prints.

use colored::Colorize;
use std::fmt::Write;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{PipelineEvent, PipelineResult};

fn plural(n: u32) -> &'static str {
    if n == 1 {
        "attempt"
    } else {
        "attempts"
    }
}

/// Formats one event as a console line.
pub(crate) fn format_event(event: &PipelineEvent) -> String {
    match event {
        PipelineEvent::StepStart {
            repo,
            step,
            command,
            attempt,
        } => {
            let attempt = if *attempt > 1 {
                format!(" (attempt {attempt})")
            } else {
                String::new()
            };
            format!(
                "{} {} {}{}: {}",
                "▶".cyan(),
                repo.cyan().bold(),
                step,
                attempt,
                command.dimmed()
            )
        }
        PipelineEvent::StepStdout { repo, line, .. } => {
            format!("  {} {}", format!("{repo} │").dimmed(), line)
        }
        PipelineEvent::StepStderr { repo, line, .. } => {
            format!("  {} {}", format!("{repo} │").dimmed(), line.yellow())
        }
        PipelineEvent::StepRetry {
            repo,
            step,
            attempt,
            next_attempt,
            error,
            ..
        } => format!(
            "{} {} {} failed on attempt {}, retrying as attempt {}: {}",
            "↻".yellow(),
            repo.yellow().bold(),
            step,
            attempt,
            next_attempt,
            error.dimmed()
        ),
        PipelineEvent::StepSuccess {
            repo,
            step,
            attempts,
            ..
        } => format!(
            "{} {} {} succeeded after {} {}",
            "✓".green(),
            repo.green().bold(),
            step,
            attempts,
            plural(*attempts)
        ),
        PipelineEvent::StepFailure {
            repo,
            step,
            attempts,
            error,
            ..
        } => format!(
            "{} {} {} failed after {} {}: {}",
            "✗".red(),
            repo.red().bold(),
            step,
            attempts,
            plural(*attempts),
            error
        ),
    }
}

/// Formats the end-of-run table. `planned` lists every repository that was
/// scheduled so the ones a fail-fast abort never reached can be shown.
pub(crate) fn format_summary(result: &PipelineResult, planned: &[String]) -> String {
    let mut out = String::new();
    let width = planned
        .iter()
        .map(String::len)
        .chain(result.repos.iter().map(|r| r.name.len()))
        .max()
        .unwrap_or(0);

    writeln!(&mut out, "\n{}", "━".repeat(50).dimmed()).unwrap();
    writeln!(&mut out, "{}", "  Setup summary".bold()).unwrap();
    writeln!(&mut out, "{}", "━".repeat(50).dimmed()).unwrap();

    for repo in &result.repos {
        for step in &repo.steps {
            let name = format!("{:width$}", repo.name);
            if step.skipped {
                writeln!(
                    &mut out,
                    "  {} {}  {} skipped (no command)",
                    "-".dimmed(),
                    name.dimmed(),
                    step.step
                )
                .unwrap();
            } else if step.success {
                writeln!(
                    &mut out,
                    "  {} {}  {} ok ({} {})",
                    "✓".green(),
                    name.green(),
                    step.step,
                    step.attempts,
                    plural(step.attempts)
                )
                .unwrap();
            } else {
                writeln!(
                    &mut out,
                    "  {} {}  {} failed ({} {}): {}",
                    "✗".red(),
                    name.red(),
                    step.step,
                    step.attempts,
                    plural(step.attempts),
                    step.error.as_deref().unwrap_or("unknown error")
                )
                .unwrap();
            }
        }
    }

    for name in planned
        .iter()
        .filter(|name| !result.repos.iter().any(|r| &r.name == *name))
    {
        writeln!(
            &mut out,
            "  {} {}  not attempted",
            "·".dimmed(),
            format!("{name:width$}").dimmed()
        )
        .unwrap();
    }

    writeln!(&mut out, "{}", "━".repeat(50).dimmed()).unwrap();
    let verdict = if result.success {
        "All repositories set up".green().bold()
    } else {
        "Setup finished with failures".red().bold()
    };
    writeln!(&mut out, "  {verdict}").unwrap();

    out
}

/// Prints and logs every event until the sender side is dropped.
pub(crate) fn spawn_reporter(mut events: UnboundedReceiver<PipelineEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let repo = event.repo();
            match event {
                PipelineEvent::StepStdout { ref line, .. }
                | PipelineEvent::StepStderr { ref line, .. } => {
                    debug!(event = event.name(), repo = %repo, "{}", line);
                }
                PipelineEvent::StepRetry { ref error, .. }
                | PipelineEvent::StepFailure { ref error, .. } => {
                    warn!(event = event.name(), repo = %repo, "{}", error);
                }
                PipelineEvent::StepStart { .. } | PipelineEvent::StepSuccess { .. } => {
                    info!(event = event.name(), repo = %repo);
                }
            }
            println!("{}", format_event(&event));
        }
    })
}
