//! Ephemeral client key material for one session.

use std::path::PathBuf;
use std::process::Stdio;
use tempfile::TempDir;

use super::BridgeError;

/// Prefix of the local per-session directory; the rest is the session id.
pub(crate) const LOCAL_DIR_PREFIX: &str = "burrow-";

const PRIVATE_KEY: &str = "id_ed25519";
const PUBLIC_KEY: &str = "id_ed25519.pub";
const KNOWN_HOSTS: &str = "known_hosts";

/// A private temporary directory holding the session's client key pair and
/// its pinned `known_hosts` file.
#[derive(Debug)]
pub(crate) struct ClientKeys {
    dir: TempDir,
    public_key: String,
}

impl ClientKeys {
    /// Creates the session directory and generates an ed25519 key pair in it.
    pub async fn generate() -> Result<Self, BridgeError> {
        let dir = tempfile::Builder::new()
            .prefix(LOCAL_DIR_PREFIX)
            .tempdir()
            .map_err(|e| BridgeError::local("create-session-dir", std::env::temp_dir(), e))?;

        let key_path = dir.path().join(PRIVATE_KEY);
        let output = tokio::process::Command::new("ssh-keygen")
            .args(["-q", "-t", "ed25519", "-N", "", "-C", "burrow-session", "-f"])
            .arg(&key_path)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| BridgeError::local("ssh-keygen", &key_path, e))?;

        if !output.status.success() {
            return Err(BridgeError::local(
                "ssh-keygen",
                &key_path,
                String::from_utf8_lossy(&output.stderr).trim(),
            ));
        }

        Self::load(dir).await
    }

    async fn load(dir: TempDir) -> Result<Self, BridgeError> {
        let path = dir.path().join(PUBLIC_KEY);
        let public_key = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| BridgeError::local("read-public-key", &path, e))?
            .trim()
            .to_string();

        if public_key.is_empty() {
            return Err(BridgeError::EmptyPublicKey {
                path: path.display().to_string(),
            });
        }

        Ok(Self { dir, public_key })
    }

    /// Identifier derived from the local directory name.
    pub fn session_id(&self) -> String {
        let name = self
            .dir
            .path()
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        name.strip_prefix(LOCAL_DIR_PREFIX)
            .unwrap_or(&name)
            .to_string()
    }

    #[cfg(test)]
    pub fn dir(&self) -> &std::path::Path {
        self.dir.path()
    }

    pub fn private_key(&self) -> PathBuf {
        self.dir.path().join(PRIVATE_KEY)
    }

    pub fn known_hosts(&self) -> PathBuf {
        self.dir.path().join(KNOWN_HOSTS)
    }

    /// The single-line OpenSSH public key.
    pub fn public_key(&self) -> &str {
        &self.public_key
    }

    /// Deletes the local directory and everything in it.
    pub fn remove(self) -> Result<(), BridgeError> {
        let path = self.dir.path().to_path_buf();
        self.dir
            .close()
            .map_err(|e| BridgeError::local("remove-session-dir", path, e))
    }

    /// Key material that does not need `ssh-keygen`.
    #[cfg(test)]
    pub fn fake() -> Self {
        let dir = tempfile::Builder::new()
            .prefix(LOCAL_DIR_PREFIX)
            .tempdir()
            .unwrap();
        std::fs::write(dir.path().join(PRIVATE_KEY), "fake private key\n").unwrap();
        let public_key = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIFakeClientKey burrow-session";
        std::fs::write(dir.path().join(PUBLIC_KEY), format!("{public_key}\n")).unwrap();
        Self {
            dir,
            public_key: public_key.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_strips_prefix() {
        let keys = ClientKeys::fake();
        let name = keys.dir().file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with(LOCAL_DIR_PREFIX));
        assert_eq!(format!("{LOCAL_DIR_PREFIX}{}", keys.session_id()), name);
        assert!(!keys.session_id().is_empty());
    }

    #[test]
    fn test_paths_live_in_session_dir() {
        let keys = ClientKeys::fake();
        assert_eq!(keys.private_key().parent(), Some(keys.dir()));
        assert_eq!(keys.known_hosts().parent(), Some(keys.dir()));
        assert!(keys.public_key().starts_with("ssh-ed25519 "));
    }

    #[tokio::test]
    async fn test_empty_public_key_is_rejected() {
        let dir = tempfile::Builder::new()
            .prefix(LOCAL_DIR_PREFIX)
            .tempdir()
            .unwrap();
        std::fs::write(dir.path().join(PUBLIC_KEY), "  \n").unwrap();
        let err = ClientKeys::load(dir).await.unwrap_err();
        assert!(matches!(err, BridgeError::EmptyPublicKey { .. }));
    }

    #[test]
    fn test_remove_deletes_directory() {
        let keys = ClientKeys::fake();
        let dir = keys.dir().to_path_buf();
        assert!(dir.exists());
        keys.remove().unwrap();
        assert!(!dir.exists());
    }
}
