//! `burrow attach`: open an interactive shell in a running sandbox.

use anyhow::{bail, Context, Result};
use std::collections::BTreeMap;
use tracing::{info, warn};

use crate::bridge::{BridgeError, BridgeSettings, RemoteCommand, Session, SessionBridge};
use crate::config::Config;
use crate::sandbox::{DockerSandbox, Sandbox, SandboxError};

/// Attaches to sandbox `id`, starting in `dir` when given.
pub(crate) async fn run(id: String, dir: Option<String>, env: Vec<String>) -> Result<()> {
    let cwd = std::env::current_dir().context("Failed to get current directory")?;
    let config = Config::load(&cwd)?;
    let env = parse_env_pairs(&env)?;

    let sandbox = DockerSandbox::connect(&id, &config.sandbox)
        .await
        .map_err(|e| {
            if e.downcast_ref::<SandboxError>().is_some_and(SandboxError::is_not_found) {
                e.context("Run `burrow sandboxes list` to see running sandboxes")
            } else {
                e
            }
        })?;
    let dir = dir.unwrap_or_else(|| sandbox.workdir().to_string());
    open_session(&sandbox, &config, Some(&dir), &env).await
}

/// Parses repeated `KEY=VALUE` arguments.
pub(crate) fn parse_env_pairs(pairs: &[String]) -> Result<BTreeMap<String, String>> {
    pairs
        .iter()
        .map(|pair| match pair.split_once('=') {
            Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
            _ => bail!("Invalid --env value '{pair}', expected KEY=VALUE"),
        })
        .collect()
}

/// Prepares a session, stages `env`, runs the configured shell in `dir` and
/// always cleans the session up afterwards.
pub(crate) async fn open_session(
    sandbox: &dyn Sandbox,
    config: &Config,
    dir: Option<&str>,
    env: &BTreeMap<String, String>,
) -> Result<()> {
    let bridge = SessionBridge::new(BridgeSettings::from_config(&config.bridge, &config.sandbox));
    let mut session = bridge.prepare(sandbox).await?;
    info!(
        event = "session:ready",
        session = %session.id(),
        url = %session.websocket_url()
    );

    let outcome = stage_and_attach(&bridge, sandbox, &mut session, dir, env).await;
    bridge.cleanup(sandbox, session).await;
    if let Err(ref e) = outcome {
        if e.is_client_failure() {
            warn!("Interactive session ended abnormally; remote processes were cleaned up");
        }
    }
    Ok(outcome?)
}

async fn stage_and_attach(
    bridge: &SessionBridge,
    sandbox: &dyn Sandbox,
    session: &mut Session,
    dir: Option<&str>,
    env: &BTreeMap<String, String>,
) -> Result<(), BridgeError> {
    let script = bridge.stage_env(sandbox, session, env).await?;
    let command = RemoteCommand::new(bridge.shell())
        .with_workdir(dir)
        .with_env_script(script.as_deref());
    bridge.attach(session, &command).await
}
