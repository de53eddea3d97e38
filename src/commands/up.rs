//! `burrow up`: bootstrap a sandbox workspace.
//!
//! Connects to (or creates) a sandbox, provisions the configured
//! repositories, runs their setup commands and optionally attaches an
//! interactive shell. A sandbox created by this command is removed at the
//! end unless `--keep` is given.

use anyhow::{Context, Result};
use colored::Colorize;
use tracing::{info, warn};

use super::attach::{open_session, parse_env_pairs};
use super::setup::{join_path, repo_setup, run_pipeline};
use crate::config::{Config, RepoConfig};
use crate::provision::{GitProvisioner, ProvisionedRepo};
use crate::sandbox::{DockerSandbox, Sandbox};

/// Where the provisioning manifest is written, relative to the workdir.
const MANIFEST_PATH: &str = ".burrow/repos.json";

/// Options for `burrow up`.
#[derive(Debug, Clone, Default)]
pub(crate) struct UpOptions {
    /// Existing sandbox to use instead of creating one.
    pub sandbox: Option<String>,
    /// Restrict to these repositories.
    pub repos: Vec<String>,
    pub attach: bool,
    pub env: Vec<String>,
    pub keep: bool,
    pub continue_on_error: bool,
}

pub(crate) async fn run(options: UpOptions) -> Result<()> {
    let cwd = std::env::current_dir().context("Failed to get current directory")?;
    let mut config = Config::load(&cwd)?;
    if options.continue_on_error {
        config.setup.continue_on_error = true;
    }
    let repos = config.selected_repos(&options.repos)?;
    let env = parse_env_pairs(&options.env)?;

    let (sandbox, created) = match options.sandbox {
        Some(ref id) => (DockerSandbox::connect(id, &config.sandbox).await?, false),
        None => (DockerSandbox::create(&config.sandbox).await?, true),
    };
    info!(event = "sandbox:ready", sandbox = %sandbox.id(), created);

    let outcome = async {
        let provisioned = bootstrap(&sandbox, sandbox.workdir(), &config, &repos).await?;
        if options.attach {
            let dir = provisioned
                .first()
                .map_or_else(|| sandbox.workdir().to_string(), |r| r.path.clone());
            open_session(&sandbox, &config, Some(&dir), &env).await?;
        }
        Ok::<_, anyhow::Error>(())
    }
    .await;

    let id = sandbox.id().to_string();
    if created && !options.keep {
        info!("Removing sandbox {}", id);
        if let Err(e) = sandbox.destroy().await {
            warn!("Failed to remove sandbox {}: {}", id, e);
        }
    } else {
        println!(
            "\nSandbox {} is still running. Attach with {}",
            id.cyan(),
            format!("burrow attach {id}").green()
        );
    }

    outcome
}

/// Provisions `repos` under `workdir`, records the manifest and runs setup.
pub(crate) async fn bootstrap(
    sandbox: &dyn Sandbox,
    workdir: &str,
    config: &Config,
    repos: &[RepoConfig],
) -> Result<Vec<ProvisionedRepo>> {
    let provisioned = provision_all(sandbox, workdir, config, repos).await?;

    let manifest =
        serde_json::to_vec_pretty(&provisioned).context("Failed to serialize repository manifest")?;
    sandbox
        .write_file(&join_path(workdir, MANIFEST_PATH), &manifest)
        .await
        .context("Failed to write repository manifest")?;

    let setups: Vec<_> = repos
        .iter()
        .zip(&provisioned)
        .map(|(repo, result)| repo_setup(repo, result.path.clone()))
        .collect();
    run_pipeline(&setups, sandbox, config, Some(sandbox.id())).await?;

    Ok(provisioned)
}

async fn provision_all(
    sandbox: &dyn Sandbox,
    workdir: &str,
    config: &Config,
    repos: &[RepoConfig],
) -> Result<Vec<ProvisionedRepo>> {
    let git = GitProvisioner::new(sandbox, config.sandbox.command_timeout());
    let mut provisioned = Vec::with_capacity(repos.len());
    for repo in repos {
        let path = join_path(workdir, repo.relative_path());
        let result = git
            .provision(repo, &path)
            .await
            .with_context(|| format!("Failed to provision repository '{}'", repo.name))?;
        info!(
            event = "repo:provisioned",
            repo = %result.name,
            cloned = result.cloned,
            reused = result.reused,
            branch_switched = result.branch_switched,
        );
        provisioned.push(result);
    }
    Ok(provisioned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::mock::{failed, ok, MockSandbox};
    use std::collections::BTreeMap;

    fn repo(name: &str, setup: &str) -> RepoConfig {
        RepoConfig {
            name: name.to_string(),
            url: Some(format!("https://example.com/{name}.git")),
            path: None,
            branch: None,
            setup: setup.to_string(),
            env: BTreeMap::new(),
        }
    }

    fn fresh_sandbox() -> MockSandbox {
        MockSandbox::new(|command, _| {
            if command.starts_with("test -e") {
                return Ok(failed(1, ""));
            }
            Ok(ok(""))
        })
    }

    #[tokio::test]
    async fn test_bootstrap_provisions_then_sets_up() {
        let sandbox = fresh_sandbox();
        let repos = vec![repo("api", "make bootstrap"), repo("web", "")];

        let provisioned = bootstrap(&sandbox, "/workspace", &Config::default(), &repos)
            .await
            .unwrap();

        assert_eq!(provisioned.len(), 2);
        assert!(provisioned.iter().all(|r| r.cloned));
        assert_eq!(provisioned[1].path, "/workspace/web");

        let calls = sandbox.calls();
        let setup = calls
            .iter()
            .find(|c| c.command == "make bootstrap")
            .unwrap();
        assert_eq!(setup.cwd.as_deref(), Some("/workspace/api"));
        // Provisioning finishes before any setup command runs.
        let last_clone = calls.iter().rposition(|c| c.command.contains("git clone")).unwrap();
        let first_setup = calls.iter().position(|c| c.command == "make bootstrap").unwrap();
        assert!(last_clone < first_setup);

        let files = sandbox.files();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].0, "/workspace/.burrow/repos.json");
        let manifest: serde_json::Value = serde_json::from_slice(&files[0].1).unwrap();
        assert_eq!(manifest[0]["name"], "api");
        assert_eq!(manifest[0]["cloned"], true);
    }

    #[tokio::test]
    async fn test_bootstrap_stops_on_provisioning_failure() {
        let sandbox = MockSandbox::new(|command, _| {
            if command.starts_with("test -e") {
                return Ok(failed(1, ""));
            }
            if command.contains("git clone") {
                return Ok(failed(128, "repository not found"));
            }
            Ok(ok(""))
        });
        let repos = vec![repo("api", "make")];

        let err = bootstrap(&sandbox, "/workspace", &Config::default(), &repos)
            .await
            .unwrap_err();

        assert!(format!("{err:#}").contains("'api'"));
        assert!(!sandbox.commands().iter().any(|c| c == "make"));
        assert!(sandbox.files().is_empty());
    }
}
