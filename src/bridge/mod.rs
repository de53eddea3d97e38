//! Interactive shell sessions into sandboxes that only expose HTTP(S) ports.
//!
//! A session runs a private sshd inside the sandbox and a
//! websockify relay on an exposed port. The local `ssh` client reaches sshd
//! through `burrow proxy`, which turns the relay's WebSocket back into a byte
//! stream. Every session has its own client key, host key, port pair and
//! remote directory, and [`SessionBridge::cleanup`] removes all of them.

mod client;
mod deps;
mod env;
mod error;
mod keys;
mod ports;
mod process;
mod sshd;

pub(crate) use env::RemoteCommand;
pub(crate) use error::BridgeError;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::{BridgeConfig, SandboxConfig};
use crate::exec::{CommandOutput, ExecOptions};
use crate::retry::{Delay, RetryPolicy, TokioDelay};
use crate::sandbox::{websocket_url, Sandbox};

use keys::ClientKeys;
use ports::{PortPair, PortRange};
use process::RemoteProcess;
use sshd::{HostKey, RemoteLayout, SshdConfig};

const ACCOUNT_COMMAND: &str = "USER_NAME=$(id -un 2>/dev/null || whoami); \
HOME_DIR=${HOME:-$(getent passwd \"$USER_NAME\" 2>/dev/null | cut -d: -f6)}; \
printf '%s\\n%s\\n' \"$USER_NAME\" \"$HOME_DIR\"";

/// Runs bridge steps in one sandbox, turning failures into [`BridgeError`]s
/// that name the step.
pub(crate) struct Remote<'a> {
    sandbox: &'a dyn Sandbox,
    timeout: Option<Duration>,
}

impl<'a> Remote<'a> {
    pub fn new(sandbox: &'a dyn Sandbox, timeout: Option<Duration>) -> Self {
        Self { sandbox, timeout }
    }

    pub fn id(&self) -> &str {
        self.sandbox.id()
    }

    /// Runs `command` and returns its output whatever the exit code.
    pub async fn output_with_env(
        &self,
        step: &'static str,
        command: &str,
        env: BTreeMap<String, String>,
    ) -> Result<CommandOutput, BridgeError> {
        let options = ExecOptions::default()
            .with_env(env)
            .with_timeout(self.timeout);
        self.sandbox
            .run(command, options)
            .await
            .map_err(|e| BridgeError::remote(step, self.id(), format!("{e:#}")))
    }

    pub async fn output(&self, step: &'static str, command: &str) -> Result<CommandOutput, BridgeError> {
        self.output_with_env(step, command, BTreeMap::new()).await
    }

    /// Runs `command` and fails unless it exits 0.
    pub async fn run_with_env(
        &self,
        step: &'static str,
        command: &str,
        env: BTreeMap<String, String>,
    ) -> Result<CommandOutput, BridgeError> {
        let output = self.output_with_env(step, command, env).await?;
        if !output.success() {
            return Err(BridgeError::remote(
                step,
                self.id(),
                format!("exit code {}: {}", output.exit_code, output.failure_text()),
            ));
        }
        Ok(output)
    }

    pub async fn run(&self, step: &'static str, command: &str) -> Result<CommandOutput, BridgeError> {
        self.run_with_env(step, command, BTreeMap::new()).await
    }
}

/// Tunables for session preparation.
#[derive(Debug, Clone)]
pub(crate) struct BridgeSettings {
    pub install: RetryPolicy,
    pub port_range: PortRange,
    pub port_attempts: u32,
    /// Overrides the `ProxyCommand` program (defaults to `burrow proxy`).
    pub proxy_command: Option<String>,
    pub shell: String,
    pub host_alias: String,
    pub command_timeout: Option<Duration>,
}

impl BridgeSettings {
    pub fn from_config(bridge: &BridgeConfig, sandbox: &SandboxConfig) -> Self {
        Self {
            install: RetryPolicy::new(
                bridge.install_attempts,
                Duration::from_secs(bridge.install_delay_secs),
            ),
            port_range: PortRange::new(bridge.port_range_start, bridge.port_range_size),
            port_attempts: bridge.port_attempts,
            proxy_command: bridge.proxy_command.clone(),
            shell: bridge.shell.clone(),
            host_alias: bridge.host_alias.clone(),
            command_timeout: sandbox.command_timeout(),
        }
    }
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self::from_config(&BridgeConfig::default(), &SandboxConfig::default())
    }
}

/// A prepared session: sshd and the relay are running and the local key
/// material is in place. Must be passed to [`SessionBridge::cleanup`].
#[derive(Debug)]
pub(crate) struct Session {
    sandbox_id: String,
    session_id: String,
    keys: ClientKeys,
    remote_user: String,
    layout: RemoteLayout,
    ports: PortPair,
    websocket_url: String,
    host_alias: String,
    env_script: Option<String>,
}

impl Session {
    pub fn id(&self) -> &str {
        &self.session_id
    }

    pub fn websocket_url(&self) -> &str {
        &self.websocket_url
    }

    #[cfg(test)]
    pub fn local_dir(&self) -> &std::path::Path {
        self.keys.dir()
    }

    /// Path of the staged startup script, once [`SessionBridge::stage_env`] wrote one.
    #[cfg(test)]
    pub fn env_script(&self) -> Option<&str> {
        self.env_script.as_deref()
    }
}

struct RemoteAccount {
    user: String,
    home: String,
}

/// Prepares, attaches to and tears down sessions.
pub(crate) struct SessionBridge {
    settings: BridgeSettings,
    delay: Arc<dyn Delay>,
}

impl SessionBridge {
    pub fn new(settings: BridgeSettings) -> Self {
        Self {
            settings,
            delay: Arc::new(TokioDelay),
        }
    }

    /// Replaces the wait used between dependency install attempts.
    #[cfg(test)]
    pub fn with_delay(mut self, delay: Arc<dyn Delay>) -> Self {
        self.delay = delay;
        self
    }

    /// Shell started by [`attach`](Self::attach) when no command is given.
    pub fn shell(&self) -> &str {
        &self.settings.shell
    }

    fn remote<'a>(&self, sandbox: &'a dyn Sandbox) -> Remote<'a> {
        Remote::new(sandbox, self.settings.command_timeout)
    }

    /// Installs dependencies, generates keys and starts sshd plus the relay.
    ///
    /// On failure everything created so far is removed before returning.
    pub async fn prepare(&self, sandbox: &dyn Sandbox) -> Result<Session, BridgeError> {
        deps::ensure_dependencies(&self.remote(sandbox), self.settings.install, self.delay.as_ref())
            .await?;
        let keys = ClientKeys::generate().await?;
        self.prepare_with_keys(sandbox, keys).await
    }

    async fn prepare_with_keys(
        &self,
        sandbox: &dyn Sandbox,
        keys: ClientKeys,
    ) -> Result<Session, BridgeError> {
        let remote = self.remote(sandbox);

        let account = match discover_account(&remote).await {
            Ok(account) => account,
            Err(e) => {
                remove_local(keys);
                return Err(e);
            }
        };

        let session_id = keys.session_id();
        let layout = RemoteLayout::new(&account.home, &session_id);
        info!("Preparing session {} on {}", session_id, remote.id());

        match self.launch(&remote, &keys, &account, &layout).await {
            Ok((ports, websocket_url)) => {
                info!("Session {} ready at {}", session_id, websocket_url);
                Ok(Session {
                    sandbox_id: remote.id().to_string(),
                    session_id,
                    keys,
                    remote_user: account.user,
                    layout,
                    ports,
                    websocket_url,
                    host_alias: self.settings.host_alias.clone(),
                    env_script: None,
                })
            }
            Err(e) => {
                warn!("Session setup on {} failed, cleaning up: {}", remote.id(), e);
                teardown(&remote, &layout, keys).await;
                Err(e)
            }
        }
    }

    async fn launch(
        &self,
        remote: &Remote<'_>,
        keys: &ClientKeys,
        account: &RemoteAccount,
        layout: &RemoteLayout,
    ) -> Result<(PortPair, String), BridgeError> {
        let ports = ports::allocate(
            remote,
            &keys.session_id(),
            self.settings.port_range,
            self.settings.port_attempts,
        )
        .await?;

        let config = SshdConfig {
            layout,
            ports,
            user: &account.user,
        };
        remote
            .run_with_env(
                "write-session-files",
                &layout.install_command(),
                config.install_env(keys.public_key()),
            )
            .await?;

        let host_pub = remote
            .run(
                "read-host-key",
                &format!("cat {}", shell_words::quote(&layout.host_public_key())),
            )
            .await?;
        let host_key = HostKey::parse(&host_pub.stdout).ok_or_else(|| {
            BridgeError::remote(
                "read-host-key",
                remote.id(),
                format!("not an ed25519 public key: '{}'", host_pub.stdout.trim()),
            )
        })?;
        host_key
            .write_known_hosts(&keys.known_hosts(), &self.settings.host_alias)
            .await?;

        remote
            .run("start-sshd", &process::sshd_start_command(layout))
            .await?;
        remote
            .run(
                "start-relay",
                &process::relay_start_command(layout, ports),
            )
            .await?;
        remote
            .run(
                "await-listeners",
                &process::wait_for_listener_command(
                    &[ports.server, ports.relay],
                    &layout.relay_log(),
                ),
            )
            .await?;

        let url = remote
            .sandbox
            .host_url(ports.relay)
            .await
            .map_err(|e| BridgeError::remote("resolve-host", remote.id(), format!("{e:#}")))?;
        debug!("Relay port {} is exposed as {}", ports.relay, url);
        Ok((ports, websocket_url(&url)))
    }

    /// Writes `vars` to an owner-only startup script sourced by [`attach`](Self::attach).
    ///
    /// Invalid names are skipped; returns `None` (and writes nothing) when no
    /// valid names remain.
    pub async fn stage_env(
        &self,
        sandbox: &dyn Sandbox,
        session: &mut Session,
        vars: &BTreeMap<String, String>,
    ) -> Result<Option<String>, BridgeError> {
        let path = session.layout.env_script();
        let Some(staged) = env::staging(&path, vars) else {
            return Ok(None);
        };

        let count = staged.env.len();
        self.remote(sandbox)
            .run_with_env("stage-env", &staged.command, staged.env)
            .await?;
        debug!("Staged {} environment variables in {}", count, path);
        session.env_script = Some(path.clone());
        Ok(Some(path))
    }

    /// Runs the interactive client until the remote command exits.
    pub async fn attach(&self, session: &Session, command: &RemoteCommand) -> Result<(), BridgeError> {
        let proxy = match self.settings.proxy_command {
            Some(ref proxy) => proxy.clone(),
            None => client::default_proxy_program()?,
        };
        let args = client::client_args(session, &proxy, &command.render());
        info!(
            "Attaching to sandbox {} (session {})",
            session.sandbox_id, session.session_id
        );
        client::run_client(client::CLIENT_PROGRAM, &session.sandbox_id, &args).await
    }

    /// Stops the relay and sshd, removes remote artifacts and deletes the
    /// local key directory. Failures are logged and never returned.
    pub async fn cleanup(&self, sandbox: &dyn Sandbox, session: Session) {
        debug!(
            "Cleaning up session {} (ports {}/{})",
            session.session_id, session.ports.server, session.ports.relay
        );
        teardown(&self.remote(sandbox), &session.layout, session.keys).await;
    }
}

async fn discover_account(remote: &Remote<'_>) -> Result<RemoteAccount, BridgeError> {
    let output = remote.run("discover-account", ACCOUNT_COMMAND).await?;
    let mut lines = output.stdout.lines().map(str::trim);
    let user = lines.next().unwrap_or_default().to_string();
    let home = lines.next().unwrap_or_default().to_string();

    if user.is_empty() {
        return Err(BridgeError::remote(
            "discover-account",
            remote.id(),
            "could not determine remote user",
        ));
    }
    if !home.starts_with('/') {
        return Err(BridgeError::HomeNotFound {
            sandbox: remote.id().to_string(),
        });
    }
    Ok(RemoteAccount { user, home })
}

/// Best-effort removal of everything a session created.
async fn teardown(remote: &Remote<'_>, layout: &RemoteLayout, keys: ClientKeys) {
    for process in [RemoteProcess::relay(layout), RemoteProcess::sshd(layout)] {
        if let Err(e) = process.terminate(remote).await {
            warn!("Failed to stop {}: {}", process.name(), e);
        }
    }
    if let Err(e) = remote
        .run("remove-session-files", &layout.removal_command())
        .await
    {
        warn!("Failed to remove remote session files: {}", e);
    }
    remove_local(keys);
}

fn remove_local(keys: ClientKeys) {
    if let Err(e) = keys.remove() {
        warn!("{}", e);
    }
}

#[cfg(test)]
pub(crate) fn test_session() -> Session {
    let keys = ClientKeys::fake();
    let session_id = keys.session_id();
    Session {
        sandbox_id: "mock-sandbox".to_string(),
        layout: RemoteLayout::new("/home/dev", &session_id),
        session_id,
        keys,
        remote_user: "dev".to_string(),
        ports: PortPair {
            server: 40000,
            relay: 40001,
        },
        websocket_url: "wss://40001-mock.sandbox.test".to_string(),
        host_alias: "burrow-sandbox".to_string(),
        env_script: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RecordingDelay;
    use crate::sandbox::mock::{failed, ok, MockSandbox};

    const HOST_PUB: &str = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIHostKey burrow-host\n";

    fn probe_reply(command: &str) -> String {
        command
            .split("for p in ")
            .nth(1)
            .and_then(|rest| rest.split(';').next())
            .unwrap_or("")
            .split_whitespace()
            .map(|p| format!("free {p}\n"))
            .collect()
    }

    /// A sandbox where every step succeeds, except commands containing `fail_on`.
    fn healthy_sandbox(fail_on: Option<&'static str>) -> MockSandbox {
        MockSandbox::new(move |command, _| {
            if fail_on.is_some_and(|needle| command.contains(needle)) {
                return Ok(failed(1, "simulated failure"));
            }
            if command.contains("id -un") {
                return Ok(ok("dev\n/home/dev\n"));
            }
            if command.contains("busy $p") {
                return Ok(ok(&probe_reply(command)));
            }
            if command.starts_with("cat ") && command.contains("ssh_host_ed25519_key.pub") {
                return Ok(ok(HOST_PUB));
            }
            Ok(ok(""))
        })
    }

    fn bridge() -> SessionBridge {
        SessionBridge::new(BridgeSettings::default()).with_delay(Arc::new(RecordingDelay::new()))
    }

    #[tokio::test]
    async fn test_prepare_starts_session_and_pins_host_key() {
        let sandbox = healthy_sandbox(None);
        let keys = ClientKeys::fake();
        let public_key = keys.public_key().to_string();

        let session = bridge().prepare_with_keys(&sandbox, keys).await.unwrap();

        assert_eq!(
            session.websocket_url(),
            format!("wss://{}-mock.sandbox.test", session.ports.relay)
        );
        assert_eq!(session.ports.relay, session.ports.server + 1);
        assert!(session.local_dir().exists());

        let known_hosts = std::fs::read_to_string(session.keys.known_hosts()).unwrap();
        assert_eq!(
            known_hosts,
            "burrow-sandbox ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIHostKey\n"
        );

        let install = sandbox
            .calls()
            .into_iter()
            .find(|c| c.command.contains("umask 077"))
            .unwrap();
        assert_eq!(install.env[sshd::AUTHORIZED_KEY_ENV], public_key);
        assert!(!install.command.contains(&public_key));
        assert!(install.command.contains(session.layout.dir()));

        let commands = sandbox.commands();
        assert!(commands.iter().any(|c| c.contains("websockify 0.0.0.0:")));
        assert!(commands.iter().any(|c| c.contains("-f /home/dev/.burrow/sessions/")));
    }

    #[tokio::test]
    async fn test_cleanup_removes_remote_and_local_state() {
        let sandbox = healthy_sandbox(None);
        let bridge = bridge();
        let session = bridge
            .prepare_with_keys(&sandbox, ClientKeys::fake())
            .await
            .unwrap();
        let local = session.local_dir().to_path_buf();
        let remote_dir = session.layout.dir().to_string();

        bridge.cleanup(&sandbox, session).await;

        assert!(!local.exists());
        let commands = sandbox.commands();
        assert!(commands.iter().any(|c| c.contains("relay.pid") && c.contains("kill -TERM")));
        assert!(commands.iter().any(|c| c.contains("sshd.pid") && c.contains("kill -TERM")));
        assert_eq!(
            commands.last().unwrap(),
            &format!("rm -rf {remote_dir}")
        );
    }

    #[tokio::test]
    async fn test_cleanup_never_fails_when_sandbox_is_gone() {
        let sandbox = MockSandbox::unreachable();
        let session = test_session();
        let local = session.local_dir().to_path_buf();

        bridge().cleanup(&sandbox, session).await;

        assert!(!local.exists());
        assert_eq!(sandbox.commands().len(), 3);
    }

    #[tokio::test]
    async fn test_failed_prepare_cleans_up_partial_state() {
        let sandbox = healthy_sandbox(Some("nohup websockify"));
        let keys = ClientKeys::fake();
        let local = keys.dir().to_path_buf();

        let err = bridge().prepare_with_keys(&sandbox, keys).await.unwrap_err();

        assert!(err.to_string().contains("'start-relay'"));
        assert!(err.to_string().contains("simulated failure"));
        assert!(!local.exists());
        let commands = sandbox.commands();
        assert!(commands.iter().any(|c| c.contains("sshd.pid") && c.contains("kill -TERM")));
        assert!(commands.last().unwrap().starts_with("rm -rf /home/dev/.burrow/sessions/"));
    }

    #[tokio::test]
    async fn test_unexpected_host_key_aborts() {
        let sandbox = MockSandbox::new(|command, _| {
            if command.contains("id -un") {
                return Ok(ok("dev\n/home/dev\n"));
            }
            if command.contains("busy $p") {
                return Ok(ok(&probe_reply(command)));
            }
            if command.starts_with("cat ") {
                return Ok(ok("ssh-rsa AAAAB3Nza\n"));
            }
            Ok(ok(""))
        });
        let keys = ClientKeys::fake();
        let local = keys.dir().to_path_buf();

        let err = bridge().prepare_with_keys(&sandbox, keys).await.unwrap_err();
        assert!(err.to_string().contains("'read-host-key'"));
        assert!(!local.exists());
        assert!(!sandbox.commands().iter().any(|c| c.contains("websockify")));
    }

    #[tokio::test]
    async fn test_missing_home_is_reported() {
        let sandbox = MockSandbox::new(|command, _| {
            if command.contains("id -un") {
                return Ok(ok("dev\n\n"));
            }
            Ok(ok(""))
        });
        let keys = ClientKeys::fake();
        let local = keys.dir().to_path_buf();

        let err = bridge().prepare_with_keys(&sandbox, keys).await.unwrap_err();
        assert!(matches!(err, BridgeError::HomeNotFound { .. }));
        assert!(!local.exists());
    }

    #[tokio::test]
    async fn test_stage_env_writes_script_through_env() {
        let sandbox = MockSandbox::succeeding();
        let mut session = test_session();
        let vars = BTreeMap::from([
            ("API_TOKEN".to_string(), "secret value".to_string()),
            ("NOT-VALID".to_string(), "x".to_string()),
        ]);

        let path = bridge()
            .stage_env(&sandbox, &mut session, &vars)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(path, session.layout.env_script());
        assert_eq!(session.env_script(), Some(path.as_str()));
        let calls = sandbox.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].env["BURROW_ENV_0"], "secret value");
        assert!(!calls[0].command.contains("secret value"));
        assert!(!calls[0].command.contains("NOT-VALID"));
    }

    #[tokio::test]
    async fn test_stage_env_without_valid_names_is_noop() {
        let sandbox = MockSandbox::succeeding();
        let mut session = test_session();
        let vars = BTreeMap::from([("BAD NAME".to_string(), "x".to_string())]);

        let staged = bridge()
            .stage_env(&sandbox, &mut session, &vars)
            .await
            .unwrap();
        assert!(staged.is_none());
        assert!(session.env_script().is_none());
        assert!(sandbox.commands().is_empty());
    }

    #[test]
    fn test_settings_from_config() {
        let settings = BridgeSettings::default();
        assert_eq!(settings.install.attempts, 24);
        assert_eq!(settings.install.delay, Duration::from_secs(5));
        assert_eq!(settings.port_attempts, 96);
        assert_eq!(settings.port_range.start(), 40000);
        assert_eq!(settings.host_alias, "burrow-sandbox");
    }
}
