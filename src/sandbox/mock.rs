//! Scripted sandbox for testing.
//!
//! Records every command it receives together with its structured
//! environment, and answers through a caller-supplied responder so tests can
//! simulate remote tools, busy ports or failing cleanup.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use super::Sandbox;
use crate::exec::{CommandExecutor, CommandOutput, ExecOptions};

type Responder = dyn Fn(&str, &ExecOptions) -> Result<CommandOutput> + Send + Sync;

/// A command observed by [`MockSandbox`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RecordedCall {
    pub command: String,
    pub cwd: Option<String>,
    pub env: BTreeMap<String, String>,
}

/// A sandbox whose command results come from a closure.
#[derive(Clone)]
pub(crate) struct MockSandbox {
    id: String,
    host: String,
    responder: Arc<Responder>,
    calls: Arc<Mutex<Vec<RecordedCall>>>,
    files: Arc<Mutex<Vec<(String, Vec<u8>)>>>,
}

impl MockSandbox {
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&str, &ExecOptions) -> Result<CommandOutput> + Send + Sync + 'static,
    {
        Self {
            id: "mock-sandbox".to_string(),
            host: "https://{port}-mock.sandbox.test".to_string(),
            responder: Arc::new(responder),
            calls: Arc::new(Mutex::new(Vec::new())),
            files: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Every command exits 0 with empty output.
    pub fn succeeding() -> Self {
        Self::new(|_, _| Ok(ok("")))
    }

    /// Every command fails to execute at all.
    pub fn unreachable() -> Self {
        Self::new(|_, _| anyhow::bail!("connection to sandbox lost"))
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn commands(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.command).collect()
    }

    pub fn files(&self) -> Vec<(String, Vec<u8>)> {
        self.files.lock().unwrap().clone()
    }
}

/// Successful output with the given stdout.
pub(crate) fn ok(stdout: &str) -> CommandOutput {
    CommandOutput {
        exit_code: 0,
        stdout: stdout.to_string(),
        stderr: String::new(),
    }
}

/// Failed output with the given exit code and stderr.
pub(crate) fn failed(exit_code: i64, stderr: &str) -> CommandOutput {
    CommandOutput {
        exit_code,
        stdout: String::new(),
        stderr: stderr.to_string(),
    }
}

#[async_trait]
impl CommandExecutor for MockSandbox {
    async fn run(&self, command: &str, options: ExecOptions) -> Result<CommandOutput> {
        self.calls.lock().unwrap().push(RecordedCall {
            command: command.to_string(),
            cwd: options.cwd.clone(),
            env: options.env.clone(),
        });
        (self.responder)(command, &options)
    }
}

#[async_trait]
impl Sandbox for MockSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    async fn host_url(&self, port: u16) -> Result<String> {
        Ok(self.host.replace("{port}", &port.to_string()))
    }

    async fn write_file(&self, path: &str, contents: &[u8]) -> Result<()> {
        self.files
            .lock()
            .unwrap()
            .push((path.to_string(), contents.to_vec()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_records_commands_and_env() {
        let sandbox = MockSandbox::succeeding();
        let mut env = BTreeMap::new();
        env.insert("A".to_string(), "1".to_string());
        sandbox
            .run("echo hi", ExecOptions::default().with_cwd("/w").with_env(env))
            .await
            .unwrap();

        let calls = sandbox.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].command, "echo hi");
        assert_eq!(calls[0].cwd.as_deref(), Some("/w"));
        assert_eq!(calls[0].env.get("A").map(String::as_str), Some("1"));
    }

    #[tokio::test]
    async fn test_mock_unreachable_errors() {
        let sandbox = MockSandbox::unreachable();
        assert!(sandbox.run("true", ExecOptions::default()).await.is_err());
        assert_eq!(sandbox.commands(), vec!["true".to_string()]);
    }

    #[tokio::test]
    async fn test_mock_host_url() {
        let sandbox = MockSandbox::succeeding();
        assert_eq!(
            sandbox.host_url(40001).await.unwrap(),
            "https://40001-mock.sandbox.test"
        );
    }
}
