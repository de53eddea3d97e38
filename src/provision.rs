//! Repository provisioning: clone what is missing, reuse what is there and
//! switch to the requested branch.
//!
//! All git operations go through a [`CommandExecutor`], so the same code
//! provisions checkouts inside a sandbox or on the local machine.

use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::RepoConfig;
use crate::exec::{CommandExecutor, CommandOutput, ExecOptions};

/// What provisioning did for one repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub(crate) struct ProvisionedRepo {
    pub name: String,
    pub path: String,
    pub cloned: bool,
    pub reused: bool,
    pub branch_switched: bool,
}

/// Git operations over an executor.
pub(crate) struct GitProvisioner<'a, E: CommandExecutor + ?Sized> {
    executor: &'a E,
    timeout: Option<Duration>,
}

fn q(s: &str) -> String {
    shell_words::quote(s).into_owned()
}

impl<'a, E: CommandExecutor + ?Sized> GitProvisioner<'a, E> {
    pub fn new(executor: &'a E, timeout: Option<Duration>) -> Self {
        Self { executor, timeout }
    }

    async fn exec(&self, command: &str) -> Result<CommandOutput> {
        // Never let git block on a credential prompt.
        let env = BTreeMap::from([("GIT_TERMINAL_PROMPT".to_string(), "0".to_string())]);
        self.executor
            .run(
                command,
                ExecOptions::default()
                    .with_env(env)
                    .with_timeout(self.timeout),
            )
            .await
    }

    pub async fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.exec(&format!("test -e {}", q(path))).await?.success())
    }

    pub async fn is_git_repo(&self, path: &str) -> Result<bool> {
        let output = self
            .exec(&format!(
                "git -C {} rev-parse --is-inside-work-tree",
                q(path)
            ))
            .await?;
        Ok(output.success() && output.stdout.trim() == "true")
    }

    pub async fn clone(&self, url: &str, path: &str) -> Result<()> {
        info!("Cloning {} into {}", url, path);
        let output = self
            .exec(&format!(
                "mkdir -p \"$(dirname {path})\" && git clone {} {path}",
                q(url),
                path = q(path)
            ))
            .await
            .with_context(|| format!("Failed to run git clone for {url}"))?;
        if !output.success() {
            bail!("git clone {} failed: {}", url, output.failure_text());
        }
        Ok(())
    }

    pub async fn current_branch(&self, path: &str) -> Result<String> {
        let output = self
            .exec(&format!("git -C {} branch --show-current", q(path)))
            .await?;
        if !output.success() {
            bail!(
                "Failed to read current branch of {}: {}",
                path,
                output.failure_text()
            );
        }
        Ok(output.stdout.trim().to_string())
    }

    /// Checks out `branch`, falling back to fetching it from `origin` and
    /// creating a tracking branch when it does not exist locally.
    pub async fn checkout_branch(&self, path: &str, branch: &str) -> Result<()> {
        let dir = q(path);
        let name = q(branch);

        let local = self
            .exec(&format!("git -C {dir} checkout {name}"))
            .await?;
        if local.success() {
            return Ok(());
        }
        debug!(
            "Local checkout of {} failed in {}, fetching from origin",
            branch, path
        );

        let fetch = self
            .exec(&format!("git -C {dir} fetch origin {name}"))
            .await?;
        if !fetch.success() {
            bail!(
                "Branch '{}' not found locally or on origin for {}: {}",
                branch,
                path,
                fetch.failure_text()
            );
        }

        let tracking = self
            .exec(&format!(
                "git -C {dir} checkout -B {name} --track {}",
                q(&format!("origin/{branch}"))
            ))
            .await?;
        if !tracking.success() {
            bail!(
                "Failed to check out '{}' in {}: {}",
                branch,
                path,
                tracking.failure_text()
            );
        }
        Ok(())
    }

    /// Makes `repo` available at `path` on its configured branch.
    pub async fn provision(&self, repo: &RepoConfig, path: &str) -> Result<ProvisionedRepo> {
        let mut result = ProvisionedRepo {
            name: repo.name.clone(),
            path: path.to_string(),
            cloned: false,
            reused: false,
            branch_switched: false,
        };

        if self.exists(path).await? {
            if !self.is_git_repo(path).await? {
                bail!(
                    "{} exists but is not a git repository (repository '{}')",
                    path,
                    repo.name
                );
            }
            debug!("Reusing existing checkout {}", path);
            result.reused = true;
        } else {
            let Some(ref url) = repo.url else {
                bail!(
                    "Repository '{}' has no url and {} does not exist",
                    repo.name,
                    path
                );
            };
            self.clone(url, path).await?;
            result.cloned = true;
        }

        if let Some(ref branch) = repo.branch {
            let current = self.current_branch(path).await?;
            if &current != branch {
                info!("Switching {} from '{}' to '{}'", repo.name, current, branch);
                self.checkout_branch(path, branch)
                    .await
                    .with_context(|| format!("Failed to switch branch for '{}'", repo.name))?;
                result.branch_switched = true;
            }
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::LocalExecutor;
    use crate::sandbox::mock::{failed, ok, MockSandbox};

    fn repo(url: Option<&str>, branch: Option<&str>) -> RepoConfig {
        RepoConfig {
            name: "api".to_string(),
            url: url.map(String::from),
            path: None,
            branch: branch.map(String::from),
            setup: String::new(),
            env: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_clone_when_missing() {
        let sandbox = MockSandbox::new(|command, _| {
            if command.starts_with("test -e") {
                return Ok(failed(1, ""));
            }
            Ok(ok(""))
        });
        let git = GitProvisioner::new(&sandbox, None);

        let result = git
            .provision(&repo(Some("https://example.com/api.git"), None), "/workspace/api")
            .await
            .unwrap();

        assert!(result.cloned);
        assert!(!result.reused);
        assert!(!result.branch_switched);
        assert!(sandbox
            .commands()
            .iter()
            .any(|c| c.contains("git clone ") && c.contains("example.com/api.git") && c.ends_with(" /workspace/api")));
        assert!(sandbox
            .calls()
            .iter()
            .all(|c| c.env.get("GIT_TERMINAL_PROMPT").map(String::as_str) == Some("0")));
    }

    #[tokio::test]
    async fn test_missing_without_url_fails() {
        let sandbox = MockSandbox::new(|_, _| Ok(failed(1, "")));
        let git = GitProvisioner::new(&sandbox, None);

        let err = git.provision(&repo(None, None), "/workspace/api").await.unwrap_err();
        assert!(err.to_string().contains("has no url"));
    }

    #[tokio::test]
    async fn test_non_git_directory_is_refused() {
        let sandbox = MockSandbox::new(|command, _| {
            if command.contains("rev-parse") {
                return Ok(failed(128, "fatal: not a git repository"));
            }
            Ok(ok(""))
        });
        let git = GitProvisioner::new(&sandbox, None);

        let err = git
            .provision(&repo(Some("https://example.com/api.git"), None), "/workspace/api")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not a git repository"));
        assert!(!sandbox.commands().iter().any(|c| c.contains("git clone")));
    }

    #[tokio::test]
    async fn test_reuse_and_fetch_fallback() {
        let sandbox = MockSandbox::new(|command, _| {
            if command.contains("rev-parse") {
                return Ok(ok("true\n"));
            }
            if command.contains("branch --show-current") {
                return Ok(ok("main\n"));
            }
            if command.ends_with("checkout feature/x") {
                return Ok(failed(1, "error: pathspec 'feature/x' did not match"));
            }
            Ok(ok(""))
        });
        let git = GitProvisioner::new(&sandbox, None);

        let result = git
            .provision(&repo(None, Some("feature/x")), "/workspace/api")
            .await
            .unwrap();

        assert!(result.reused);
        assert!(result.branch_switched);
        let commands = sandbox.commands();
        assert!(commands.contains(&"git -C /workspace/api fetch origin feature/x".to_string()));
        assert!(commands.contains(
            &"git -C /workspace/api checkout -B feature/x --track origin/feature/x".to_string()
        ));
    }

    #[tokio::test]
    async fn test_already_on_branch_is_untouched() {
        let sandbox = MockSandbox::new(|command, _| {
            if command.contains("rev-parse") {
                return Ok(ok("true\n"));
            }
            if command.contains("branch --show-current") {
                return Ok(ok("main\n"));
            }
            Ok(ok(""))
        });
        let git = GitProvisioner::new(&sandbox, None);

        let result = git
            .provision(&repo(None, Some("main")), "/workspace/api")
            .await
            .unwrap();
        assert!(!result.branch_switched);
        assert!(!sandbox.commands().iter().any(|c| c.contains("checkout")));
    }

    #[tokio::test]
    async fn test_unknown_branch_fails() {
        let sandbox = MockSandbox::new(|command, _| {
            if command.contains("checkout") || command.contains("fetch") {
                return Ok(failed(1, "couldn't find remote ref nope"));
            }
            Ok(ok(""))
        });
        let git = GitProvisioner::new(&sandbox, None);

        let err = git.checkout_branch("/w/api", "nope").await.unwrap_err();
        assert!(err.to_string().contains("not found locally or on origin"));
    }

    #[tokio::test]
    async fn test_exists_on_local_filesystem() {
        let dir = tempfile::tempdir().unwrap();
        let git = GitProvisioner::new(&LocalExecutor, None);
        assert!(git.exists(&dir.path().display().to_string()).await.unwrap());
        assert!(!git
            .exists(&dir.path().join("missing").display().to_string())
            .await
            .unwrap());
        assert!(!git
            .is_git_repo(&dir.path().display().to_string())
            .await
            .unwrap_or(false));
    }
}
