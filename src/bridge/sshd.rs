//! Remote session layout and the hardened sshd configuration.

use std::collections::BTreeMap;
use std::path::Path;

use super::ports::PortPair;
use super::BridgeError;

/// Environment variable carrying the client public key to the sandbox.
pub(crate) const AUTHORIZED_KEY_ENV: &str = "BURROW_AUTHORIZED_KEY";
/// Environment variable carrying the rendered sshd config to the sandbox.
pub(crate) const SSHD_CONFIG_ENV: &str = "BURROW_SSHD_CONFIG";

const HOST_KEY_TYPE: &str = "ssh-ed25519";

/// Paths of every per-session artifact inside the sandbox.
///
/// Everything lives under `~/.burrow/sessions/<id>` so one `rm -rf` removes
/// the whole session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RemoteLayout {
    dir: String,
}

impl RemoteLayout {
    pub fn new(home: &str, session_id: &str) -> Self {
        Self {
            dir: format!(
                "{}/.burrow/sessions/{session_id}",
                home.trim_end_matches('/')
            ),
        }
    }

    #[cfg(test)]
    pub fn dir(&self) -> &str {
        &self.dir
    }

    fn file(&self, name: &str) -> String {
        format!("{}/{name}", self.dir)
    }

    pub fn authorized_keys(&self) -> String {
        self.file("authorized_keys")
    }

    pub fn host_key(&self) -> String {
        self.file("ssh_host_ed25519_key")
    }

    pub fn host_public_key(&self) -> String {
        self.file("ssh_host_ed25519_key.pub")
    }

    pub fn sshd_config(&self) -> String {
        self.file("sshd_config")
    }

    pub fn sshd_pid(&self) -> String {
        self.file("sshd.pid")
    }

    pub fn sshd_log(&self) -> String {
        self.file("sshd.log")
    }

    pub fn relay_pid(&self) -> String {
        self.file("relay.pid")
    }

    pub fn relay_log(&self) -> String {
        self.file("relay.log")
    }

    pub fn env_script(&self) -> String {
        self.file("startup-env.sh")
    }

    /// Writes the authorized key and sshd config (passed via env) and
    /// generates a fresh host key, all owner-only.
    pub fn install_command(&self) -> String {
        let q = |s: String| shell_words::quote(&s).into_owned();
        let dir = q(self.dir.clone());
        let keys = q(self.authorized_keys());
        let config = q(self.sshd_config());
        let host_key = q(self.host_key());
        let host_pub = q(self.host_public_key());
        format!(
            "set -e; umask 077; mkdir -p {dir}; chmod 700 {dir}; \
             printf '%s\\n' \"${AUTHORIZED_KEY_ENV}\" > {keys}; chmod 600 {keys}; \
             printf '%s' \"${SSHD_CONFIG_ENV}\" > {config}; chmod 600 {config}; \
             rm -f {host_key} {host_pub}; \
             ssh-keygen -q -t ed25519 -N '' -C burrow-host -f {host_key}"
        )
    }

    /// Removes the whole session directory.
    pub fn removal_command(&self) -> String {
        format!("rm -rf {}", shell_words::quote(&self.dir))
    }
}

/// Inputs for the session's sshd configuration.
#[derive(Debug, Clone)]
pub(crate) struct SshdConfig<'a> {
    pub layout: &'a RemoteLayout,
    pub ports: PortPair,
    pub user: &'a str,
}

impl SshdConfig<'_> {
    /// Renders an sshd_config that only accepts the session's public key,
    /// for one user, with every kind of forwarding disabled.
    pub fn render(&self) -> String {
        let l = self.layout;
        let lines = [
            format!("Port {}", self.ports.server),
            "ListenAddress 0.0.0.0".to_string(),
            format!("HostKey {}", l.host_key()),
            format!("HostKeyAlgorithms {HOST_KEY_TYPE}"),
            format!("PidFile {}", l.sshd_pid()),
            format!("AuthorizedKeysFile {}", l.authorized_keys()),
            format!("AllowUsers {}", self.user),
            "PubkeyAuthentication yes".to_string(),
            "PasswordAuthentication no".to_string(),
            "KbdInteractiveAuthentication no".to_string(),
            "ChallengeResponseAuthentication no".to_string(),
            "PermitEmptyPasswords no".to_string(),
            "UsePAM no".to_string(),
            "StrictModes yes".to_string(),
            "AllowTcpForwarding no".to_string(),
            "AllowStreamLocalForwarding no".to_string(),
            "AllowAgentForwarding no".to_string(),
            "X11Forwarding no".to_string(),
            "PermitTunnel no".to_string(),
            "PermitOpen none".to_string(),
            "GatewayPorts no".to_string(),
            "PermitUserEnvironment no".to_string(),
            "PrintMotd no".to_string(),
            "Subsystem sftp internal-sftp".to_string(),
        ];
        let mut out = lines.join("\n");
        out.push('\n');
        out
    }

    /// Env vars delivering the key and config to [`RemoteLayout::install_command`].
    pub fn install_env(&self, authorized_key: &str) -> BTreeMap<String, String> {
        BTreeMap::from([
            (AUTHORIZED_KEY_ENV.to_string(), authorized_key.to_string()),
            (SSHD_CONFIG_ENV.to_string(), self.render()),
        ])
    }
}

/// The sandbox's freshly generated host key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct HostKey {
    key: String,
}

impl HostKey {
    /// Parses an OpenSSH `.pub` line, keeping only type and key material.
    pub fn parse(text: &str) -> Option<Self> {
        let mut parts = text.split_whitespace();
        let kind = parts.next()?;
        let key = parts.next()?;
        (kind == HOST_KEY_TYPE).then(|| Self {
            key: key.to_string(),
        })
    }

    /// A `known_hosts` line pinning this key to `alias`.
    pub fn known_hosts_line(&self, alias: &str) -> String {
        format!("{alias} {HOST_KEY_TYPE} {}\n", self.key)
    }

    /// Writes the pinned `known_hosts` file (owner-only).
    pub async fn write_known_hosts(&self, path: &Path, alias: &str) -> Result<(), BridgeError> {
        tokio::fs::write(path, self.known_hosts_line(alias))
            .await
            .map_err(|e| BridgeError::local("write-known-hosts", path, e))?;
        set_owner_only(path)
            .await
            .map_err(|e| BridgeError::local("write-known-hosts", path, e))
    }
}

#[cfg(unix)]
async fn set_owner_only(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await
}

#[cfg(not(unix))]
async fn set_owner_only(_path: &Path) -> std::io::Result<()> {
    Ok(())
}
