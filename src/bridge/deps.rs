//! Installs the tools a session needs inside the sandbox.
//!
//! Package installs in fresh sandboxes routinely race with unattended
//! upgrades holding the dpkg lock, so lock contention is retried on a fixed
//! delay while any other failure aborts immediately.

use tracing::{debug, info, warn};

use super::{BridgeError, Remote};
use crate::retry::{Delay, RetryPolicy};

/// Tools required in the sandbox, with the shell test proving each is present.
const REQUIRED_TOOLS: &[(&str, &str)] = &[
    ("sshd", "command -v sshd >/dev/null 2>&1 || test -x /usr/sbin/sshd"),
    ("websockify", "command -v websockify >/dev/null 2>&1"),
    ("ssh-keygen", "command -v ssh-keygen >/dev/null 2>&1"),
];

const INSTALL_COMMAND: &str = "set -e; \
SUDO=''; if [ \"$(id -u)\" != 0 ]; then SUDO='sudo -n'; fi; \
$SUDO env DEBIAN_FRONTEND=noninteractive apt-get update -qq; \
$SUDO env DEBIAN_FRONTEND=noninteractive apt-get install -y -qq --no-install-recommends \
openssh-server openssh-client websockify";

/// Output fragments apt/dpkg print when another process holds the lock.
const LOCK_SIGNATURES: &[&str] = &[
    "Could not get lock",
    "Unable to acquire the dpkg frontend lock",
    "Unable to lock directory",
    "is another process using it",
    "dpkg frontend lock",
];

/// Returns true if `text` looks like package-manager lock contention.
pub(crate) fn is_lock_contention(text: &str) -> bool {
    LOCK_SIGNATURES.iter().any(|sig| text.contains(sig))
}

/// Shell command printing the name of every missing tool, one per line.
pub(crate) fn presence_command() -> String {
    REQUIRED_TOOLS
        .iter()
        .map(|(name, check)| format!("{{ {check}; }} || echo {name}"))
        .collect::<Vec<_>>()
        .join("; ")
}

fn parse_missing(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| REQUIRED_TOOLS.iter().any(|(name, _)| name == line))
        .map(String::from)
        .collect()
}

async fn missing_tools(remote: &Remote<'_>) -> Result<Vec<String>, BridgeError> {
    let output = remote
        .run("check-dependencies", &presence_command())
        .await?;
    Ok(parse_missing(&output.stdout))
}

/// Makes sure sshd, websockify and ssh-keygen are available in the sandbox.
pub(crate) async fn ensure_dependencies(
    remote: &Remote<'_>,
    policy: RetryPolicy,
    delay: &dyn Delay,
) -> Result<(), BridgeError> {
    let missing = missing_tools(remote).await?;
    if missing.is_empty() {
        debug!("Session dependencies already present on {}", remote.id());
        return Ok(());
    }

    info!(
        "Installing session dependencies on {}: {}",
        remote.id(),
        missing.join(", ")
    );

    let mut attempt = 1;
    loop {
        let (detail, cause) = match remote.output("install-dependencies", INSTALL_COMMAND).await {
            Ok(output) if output.success() => break,
            Ok(output) => (
                format!("{}\n{}", output.stdout, output.stderr),
                format!(
                    "exit code {}: {}",
                    output.exit_code,
                    output.failure_text()
                ),
            ),
            Err(e) => (e.to_string(), e.to_string()),
        };

        if !is_lock_contention(&detail) {
            return Err(BridgeError::DependencyInstall {
                sandbox: remote.id().to_string(),
                cause,
            });
        }

        if !policy.has_next(attempt) {
            return Err(BridgeError::DependencyInstall {
                sandbox: remote.id().to_string(),
                cause: format!(
                    "package manager still locked after {} attempts: {cause}",
                    policy.attempts
                ),
            });
        }

        warn!(
            "Package manager is locked on {} (attempt {}/{}). Retrying in {}s...",
            remote.id(),
            attempt,
            policy.attempts,
            policy.delay.as_secs()
        );
        delay.wait(policy.delay).await;
        attempt += 1;
    }

    let still_missing = missing_tools(remote).await?;
    if !still_missing.is_empty() {
        return Err(BridgeError::DependenciesUnavailable {
            sandbox: remote.id().to_string(),
            missing: still_missing,
        });
    }

    info!("Session dependencies installed on {}", remote.id());
    Ok(())
}
