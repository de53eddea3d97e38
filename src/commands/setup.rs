//! `burrow setup`: run the setup pipeline against local checkouts, plus the
//! pipeline wiring shared with `burrow up`.

use anyhow::{bail, Context, Result};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::{Config, RepoConfig};
use crate::exec::{CommandExecutor, LocalExecutor};
use crate::notifications::Notifier;
use crate::pipeline::format::{format_summary, spawn_reporter};
use crate::pipeline::{self, PipelineOptions, PipelineResult, RepoSetup};
use crate::retry::TokioDelay;

/// Runs setup for the selected repositories relative to the current directory.
pub(crate) async fn run(only: Vec<String>, continue_on_error: bool) -> Result<()> {
    let cwd = std::env::current_dir().context("Failed to get current directory")?;
    let mut config = Config::load(&cwd)?;
    if continue_on_error {
        config.setup.continue_on_error = true;
    }

    let repos = config.selected_repos(&only)?;
    if repos.is_empty() {
        println!("No repositories configured in {}", crate::config::CONFIG_FILE);
        return Ok(());
    }

    let root = cwd.display().to_string();
    let setups: Vec<RepoSetup> = repos
        .iter()
        .map(|repo| repo_setup(repo, join_path(&root, repo.relative_path())))
        .collect();

    info!("Running setup for {} repositories in {}", setups.len(), root);
    run_pipeline(&setups, &LocalExecutor, &config, None).await?;
    Ok(())
}

/// The pipeline input for `repo` checked out at `path`.
pub(crate) fn repo_setup(repo: &RepoConfig, path: String) -> RepoSetup {
    RepoSetup {
        name: repo.name.clone(),
        path,
        command: repo.setup.clone(),
        env: repo.env.clone(),
    }
}

/// Resolves `relative` against `root`; absolute paths are kept.
pub(crate) fn join_path(root: &str, relative: &str) -> String {
    if relative.starts_with('/') {
        relative.to_string()
    } else {
        format!("{}/{}", root.trim_end_matches('/'), relative)
    }
}

/// Runs the pipeline with console progress, prints the summary and sends
/// notifications. Fails when any repository failed.
pub(crate) async fn run_pipeline<E>(
    setups: &[RepoSetup],
    executor: &E,
    config: &Config,
    sandbox: Option<&str>,
) -> Result<PipelineResult>
where
    E: CommandExecutor + ?Sized,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let reporter = spawn_reporter(rx);

    let options = PipelineOptions {
        retry: config.setup.retry_policy(),
        continue_on_error: config.setup.continue_on_error,
        base_env: config.setup.env.clone(),
        timeout: config.setup.timeout(),
        events: Some(tx),
        delay: Arc::new(TokioDelay),
    };

    let outcome = pipeline::run(setups, executor, &options).await;
    // Closing the channel lets the reporter drain and exit.
    drop(options);
    if let Err(e) = reporter.await {
        warn!("Progress reporter stopped early: {}", e);
    }

    let planned: Vec<String> = setups.iter().map(|s| s.name.clone()).collect();
    let result = match outcome {
        Ok(ref result) => result,
        Err(ref e) => e.result(),
    };
    print!("{}", format_summary(result, &planned));
    Notifier::new(config.notifications.clone())
        .notify_result(result, sandbox)
        .await;

    match outcome {
        Ok(result) if result.success => Ok(result),
        Ok(result) => {
            let failed: Vec<&str> = result.failed().map(|r| r.name.as_str()).collect();
            bail!("Setup failed for {}", failed.join(", "))
        }
        Err(e) => Err(e.into()),
    }
}
