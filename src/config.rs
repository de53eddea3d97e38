use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::retry::RetryPolicy;

pub(crate) const CONFIG_FILE: &str = "burrow.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub setup: SetupConfig,
    #[serde(default)]
    pub repos: Vec<RepoConfig>,
    #[serde(default)]
    pub notifications: NotificationConfig,
}

/// Sandbox (container) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Container image the sandbox is created from
    #[serde(default = "default_image")]
    pub image: String,

    /// Directory inside the sandbox that repositories are cloned under
    #[serde(default = "default_workdir")]
    pub workdir: String,

    /// User commands run as (image default when unset)
    #[serde(default)]
    pub user: Option<String>,

    /// Public URL template for exposed ports, e.g. "https://{port}-{id}.sandbox.example.dev".
    /// When unset the container's bridge IP is used.
    #[serde(default)]
    pub host_template: Option<String>,

    /// Extra labels applied to created sandboxes
    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    /// Per-command timeout for bridge and provisioning commands
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image: default_image(),
            workdir: default_workdir(),
            user: None,
            host_template: None,
            labels: BTreeMap::new(),
            command_timeout_secs: default_command_timeout(),
        }
    }
}

impl SandboxConfig {
    pub fn command_timeout(&self) -> Option<Duration> {
        (self.command_timeout_secs > 0).then(|| Duration::from_secs(self.command_timeout_secs))
    }
}

/// Interactive session bridge configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Attempts for dependency installation while the package manager is locked
    #[serde(default = "default_install_attempts")]
    pub install_attempts: u32,

    /// Seconds between installation attempts
    #[serde(default = "default_install_delay")]
    pub install_delay_secs: u64,

    /// First port considered for the server/relay pair
    #[serde(default = "default_port_range_start")]
    pub port_range_start: u16,

    /// Number of candidate ports (rounded down to a power of two)
    #[serde(default = "default_port_range_size")]
    pub port_range_size: u16,

    /// Candidate pairs probed before giving up
    #[serde(default = "default_port_attempts")]
    pub port_attempts: u32,

    /// Local WebSocket-to-stdio proxy, invoked with the URL as its only argument.
    /// Defaults to `burrow proxy`.
    #[serde(default)]
    pub proxy_command: Option<String>,

    /// Command run in the remote interactive session
    #[serde(default = "default_shell")]
    pub shell: String,

    /// Hostname the pinned host key is recorded under
    #[serde(default = "default_host_alias")]
    pub host_alias: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            install_attempts: default_install_attempts(),
            install_delay_secs: default_install_delay(),
            port_range_start: default_port_range_start(),
            port_range_size: default_port_range_size(),
            port_attempts: default_port_attempts(),
            proxy_command: None,
            shell: default_shell(),
            host_alias: default_host_alias(),
        }
    }
}

/// Setup pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetupConfig {
    /// Keep going with the next repository when one fails
    #[serde(default)]
    pub continue_on_error: bool,

    /// Total attempts per setup command
    #[serde(default = "default_setup_attempts")]
    pub attempts: u32,

    /// Seconds between attempts
    #[serde(default = "default_setup_delay")]
    pub delay_secs: u64,

    /// Per-attempt timeout in seconds (0 = none)
    #[serde(default = "default_setup_timeout")]
    pub timeout_secs: u64,

    /// Environment shared by every repository's setup command
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl Default for SetupConfig {
    fn default() -> Self {
        Self {
            continue_on_error: false,
            attempts: default_setup_attempts(),
            delay_secs: default_setup_delay(),
            timeout_secs: default_setup_timeout(),
            env: BTreeMap::new(),
        }
    }
}

impl SetupConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.attempts, Duration::from_secs(self.delay_secs))
    }

    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs))
    }
}

/// A repository to provision and initialize
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoConfig {
    pub name: String,

    /// Clone URL; required when the checkout does not exist yet
    #[serde(default)]
    pub url: Option<String>,

    /// Checkout path, relative to the workspace root (defaults to `name`)
    #[serde(default)]
    pub path: Option<String>,

    /// Branch to switch to after provisioning
    #[serde(default)]
    pub branch: Option<String>,

    /// Initialization command; blank means nothing to run
    #[serde(default)]
    pub setup: String,

    /// Environment overrides for this repository's setup command
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl RepoConfig {
    /// Checkout path relative to the workspace root.
    pub fn relative_path(&self) -> &str {
        self.path.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotificationConfig {
    /// Sent when a setup run succeeds: "webhook:<url>", a bare URL, "desktop" or "none"
    #[serde(default)]
    pub on_complete: Option<String>,

    /// Sent when a setup run fails
    #[serde(default)]
    pub on_error: Option<String>,
}

// Default value functions
fn default_image() -> String {
    "ubuntu:24.04".to_string()
}

fn default_workdir() -> String {
    "/workspace".to_string()
}

fn default_command_timeout() -> u64 {
    600
}

fn default_install_attempts() -> u32 {
    24
}

fn default_install_delay() -> u64 {
    5
}

fn default_port_range_start() -> u16 {
    40000
}

fn default_port_range_size() -> u16 {
    16384
}

fn default_port_attempts() -> u32 {
    96
}

fn default_shell() -> String {
    "bash -l".to_string()
}

fn default_host_alias() -> String {
    "burrow-sandbox".to_string()
}

fn default_setup_attempts() -> u32 {
    1
}

fn default_setup_delay() -> u64 {
    2
}

fn default_setup_timeout() -> u64 {
    1800
}

impl Config {
    /// Load configuration from file, using defaults if not found
    pub fn load(project_dir: &Path) -> Result<Self> {
        let config_path = project_dir.join(CONFIG_FILE);

        if !config_path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        Ok(config)
    }

    /// Repositories selected by name; all of them when `only` is empty.
    pub fn selected_repos(&self, only: &[String]) -> Result<Vec<RepoConfig>> {
        if only.is_empty() {
            return Ok(self.repos.clone());
        }
        only.iter()
            .map(|name| {
                self.repos
                    .iter()
                    .find(|r| &r.name == name)
                    .cloned()
                    .with_context(|| format!("Repository '{name}' is not defined in {CONFIG_FILE}"))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.bridge.install_attempts, 24);
        assert_eq!(config.bridge.install_delay_secs, 5);
        assert_eq!(config.bridge.port_attempts, 96);
        assert!(!config.setup.continue_on_error);
        assert_eq!(config.setup.attempts, 1);
        assert!(config.repos.is_empty());
        assert!(config.bridge.proxy_command.is_none());
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[sandbox]
image = "ghcr.io/acme/dev:latest"
host_template = "https://{port}-{id}.sandbox.example.dev"

[bridge]
shell = "zsh -l"

[setup]
continue_on_error = true
attempts = 3
delay_secs = 10

[setup.env]
CI = "1"

[[repos]]
name = "api"
url = "https://github.com/acme/api.git"
branch = "develop"
setup = "make bootstrap"

[repos.env]
NODE_ENV = "development"

[[repos]]
name = "web"
path = "frontend/web"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.sandbox.image, "ghcr.io/acme/dev:latest");
        assert_eq!(config.bridge.shell, "zsh -l");
        assert!(config.setup.continue_on_error);
        assert_eq!(config.setup.retry_policy().attempts, 3);
        assert_eq!(config.setup.env.get("CI").map(String::as_str), Some("1"));
        assert_eq!(config.repos.len(), 2);
        assert_eq!(config.repos[0].relative_path(), "api");
        assert_eq!(config.repos[0].branch.as_deref(), Some("develop"));
        assert_eq!(
            config.repos[0].env.get("NODE_ENV").map(String::as_str),
            Some("development")
        );
        assert_eq!(config.repos[1].relative_path(), "frontend/web");
        assert!(config.repos[1].setup.is_empty());
    }

    #[test]
    fn test_zero_timeouts_disable_limits() {
        let toml = r"
[sandbox]
command_timeout_secs = 0

[setup]
timeout_secs = 0
";
        let config: Config = toml::from_str(toml).unwrap();
        assert!(config.sandbox.command_timeout().is_none());
        assert!(config.setup.timeout().is_none());
    }

    #[test]
    fn test_selected_repos() {
        let toml = r#"
[[repos]]
name = "a"

[[repos]]
name = "b"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.selected_repos(&[]).unwrap().len(), 2);

        let only = config.selected_repos(&["b".to_string()]).unwrap();
        assert_eq!(only.len(), 1);
        assert_eq!(only[0].name, "b");

        let err = config.selected_repos(&["c".to_string()]).unwrap_err();
        assert!(err.to_string().contains("'c'"));
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(dir.path()).unwrap();
        assert_eq!(config.sandbox.workdir, "/workspace");
    }
}
