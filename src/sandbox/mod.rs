//! Remote sandboxes that commands can run in.
//!
//! A [`Sandbox`] is a [`CommandExecutor`] that also knows how to expose one
//! of its ports as an externally reachable URL and how to receive files.
//! [`DockerSandbox`] provides the lifecycle (create, connect, list, kill).

mod docker;
mod error;
#[cfg(test)]
pub(crate) mod mock;

pub(crate) use docker::{DockerSandbox, SandboxSummary};
pub(crate) use error::SandboxError;

use anyhow::Result;
use async_trait::async_trait;

use crate::exec::CommandExecutor;

/// A remote compute environment reachable only through commands and HTTP ports.
#[async_trait]
pub(crate) trait Sandbox: CommandExecutor {
    /// Identifier used in logs and error messages.
    fn id(&self) -> &str;

    /// Returns the externally reachable URL for `port`.
    async fn host_url(&self, port: u16) -> Result<String>;

    /// Writes `contents` to `path` inside the sandbox.
    async fn write_file(&self, path: &str, contents: &[u8]) -> Result<()>;
}

/// Rewrites a URL to the matching WebSocket scheme.
///
/// `https` becomes `wss`, `http` becomes `ws`, WebSocket schemes are kept and
/// a bare host is assumed to be served over TLS.
pub(crate) fn websocket_url(url: &str) -> String {
    let url = url.trim();
    if let Some(rest) = url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if url.starts_with("wss://") || url.starts_with("ws://") {
        url.to_string()
    } else {
        format!("wss://{url}")
    }
}

/// Renders a host template such as `https://{port}-{id}.example.dev`.
pub(crate) fn render_host_template(template: &str, id: &str, port: u16) -> String {
    template
        .replace("{port}", &port.to_string())
        .replace("{id}", id)
}
