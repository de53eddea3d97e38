//! The local interactive ssh client.

use std::process::{ExitStatus, Stdio};
use tracing::debug;

use super::{BridgeError, Session};

/// The local ssh client binary.
pub(crate) const CLIENT_PROGRAM: &str = "ssh";

/// Builds the `ProxyCommand` value: `<proxy> <quoted url>`.
///
/// ssh expands `%` tokens in ProxyCommand, so literal percent signs are doubled.
pub(crate) fn proxy_command(proxy: &str, websocket_url: &str) -> String {
    format!("{proxy} {}", shell_words::quote(websocket_url)).replace('%', "%%")
}

/// This executable's own `proxy` subcommand.
pub(crate) fn default_proxy_program() -> Result<String, BridgeError> {
    let exe = std::env::current_exe()
        .map_err(|e| BridgeError::local("locate-proxy", "current executable", e))?;
    Ok(format!(
        "{} proxy",
        shell_words::quote(&exe.display().to_string())
    ))
}

/// Arguments for `ssh` that connect only through the relay, only with the
/// session key, and only to the pinned host key.
///
/// User and system ssh configuration are ignored (`-F /dev/null`) so nothing
/// can weaken these options.
pub(crate) fn client_args(session: &Session, proxy: &str, remote_command: &str) -> Vec<String> {
    let options = [
        "BatchMode=yes".to_string(),
        "PasswordAuthentication=no".to_string(),
        "KbdInteractiveAuthentication=no".to_string(),
        "PubkeyAuthentication=yes".to_string(),
        "IdentitiesOnly=yes".to_string(),
        format!("IdentityFile={}", session.keys.private_key().display()),
        "StrictHostKeyChecking=yes".to_string(),
        format!("UserKnownHostsFile={}", session.keys.known_hosts().display()),
        "GlobalKnownHostsFile=/dev/null".to_string(),
        "UpdateHostKeys=no".to_string(),
        "ForwardAgent=no".to_string(),
        "ForwardX11=no".to_string(),
        "ClearAllForwardings=yes".to_string(),
        "LogLevel=ERROR".to_string(),
        format!(
            "ProxyCommand={}",
            proxy_command(proxy, &session.websocket_url)
        ),
    ];

    let mut args = vec!["-F".to_string(), "/dev/null".to_string()];
    for option in options {
        args.push("-o".to_string());
        args.push(option);
    }
    args.extend([
        "-t".to_string(),
        "-l".to_string(),
        session.remote_user.clone(),
        session.host_alias.clone(),
        remote_command.to_string(),
    ]);
    args
}

/// Runs `program` (normally [`CLIENT_PROGRAM`]) with the terminal attached
/// and waits for it to exit.
pub(crate) async fn run_client(
    program: &str,
    sandbox: &str,
    args: &[String],
) -> Result<(), BridgeError> {
    debug!("Starting {} client for sandbox {}", program, sandbox);
    let status = tokio::process::Command::new(program)
        .args(args)
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .status()
        .await
        .map_err(|e| BridgeError::ClientSpawn {
            program: program.to_string(),
            cause: e.to_string(),
        })?;
    interpret_status(sandbox, status)
}

fn interpret_status(sandbox: &str, status: ExitStatus) -> Result<(), BridgeError> {
    if status.success() {
        return Ok(());
    }
    if let Some(code) = status.code() {
        return Err(BridgeError::ClientExit {
            sandbox: sandbox.to_string(),
            code,
        });
    }
    Err(BridgeError::ClientSignal {
        sandbox: sandbox.to_string(),
        signal: exit_signal(status),
    })
}

#[cfg(unix)]
fn exit_signal(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status.signal().unwrap_or(-1)
}

#[cfg(not(unix))]
fn exit_signal(_status: ExitStatus) -> i32 {
    -1
}
