//! Command execution seam shared by the setup pipeline and the sandbox.
//!
//! Everything that runs a shell command (locally or inside a sandbox) goes
//! through [`CommandExecutor`], so the pipeline and the session bridge can be
//! exercised against scripted executors in tests.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing::debug;

/// Which output stream a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OutputStream {
    Stdout,
    Stderr,
}

/// Receives each output line as soon as it is produced.
pub(crate) type LineCallback = Arc<dyn Fn(OutputStream, &str) + Send + Sync>;

/// Options for a single command execution.
#[derive(Clone, Default)]
pub(crate) struct ExecOptions {
    /// Working directory for the command.
    pub cwd: Option<String>,
    /// Extra environment variables, passed structurally (never interpolated).
    pub env: BTreeMap<String, String>,
    /// Upper bound on wall-clock time.
    pub timeout: Option<Duration>,
    /// Streamed line sink.
    pub on_line: Option<LineCallback>,
}

impl fmt::Debug for ExecOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecOptions")
            .field("cwd", &self.cwd)
            .field("env", &self.env.keys().collect::<Vec<_>>())
            .field("timeout", &self.timeout)
            .field("on_line", &self.on_line.is_some())
            .finish()
    }
}

impl ExecOptions {
    pub fn with_cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_line_callback(mut self, on_line: LineCallback) -> Self {
        self.on_line = Some(on_line);
        self
    }

    fn emit(&self, stream: OutputStream, line: &str) {
        if let Some(ref cb) = self.on_line {
            cb(stream, line);
        }
    }
}

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct CommandOutput {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Stderr if present, otherwise stdout. Used when reporting failures.
    pub fn failure_text(&self) -> &str {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim()
        } else {
            stderr
        }
    }
}

/// Errors raised by executors themselves (not by the command they ran).
#[derive(Debug, thiserror::Error)]
pub(crate) enum ExecError {
    /// The command did not finish within its timeout.
    #[error("Command `{command}` timed out after {timeout_secs} seconds")]
    Timeout { command: String, timeout_secs: u64 },
}

impl ExecError {
    pub fn timeout(command: &str, duration: Duration) -> Self {
        Self::Timeout {
            command: command.to_string(),
            timeout_secs: duration.as_secs(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Runs shell command strings.
#[async_trait]
pub(crate) trait CommandExecutor: Send + Sync {
    /// Runs `command` through a POSIX shell and waits for it to exit.
    ///
    /// A non-zero exit code is not an error at this level; callers decide.
    async fn run(&self, command: &str, options: ExecOptions) -> Result<CommandOutput>;
}

/// Runs commands on the local machine via `sh -c`.
#[derive(Debug, Default, Clone)]
pub(crate) struct LocalExecutor;

#[async_trait]
impl CommandExecutor for LocalExecutor {
    async fn run(&self, command: &str, options: ExecOptions) -> Result<CommandOutput> {
        debug!("Running locally: {}", command);

        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .envs(&options.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(ref cwd) = options.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn `{command}`"))?;
        let stdout = child.stdout.take().context("Child stdout was not captured")?;
        let stderr = child.stderr.take().context("Child stderr was not captured")?;

        let finished = async {
            let (out, err, status) = tokio::join!(
                collect_lines(stdout, OutputStream::Stdout, &options),
                collect_lines(stderr, OutputStream::Stderr, &options),
                child.wait()
            );
            let status = status.with_context(|| format!("Failed to wait for `{command}`"))?;
            Ok::<_, anyhow::Error>(CommandOutput {
                // Killed by a signal: report like a shell would.
                exit_code: i64::from(status.code().unwrap_or(128)),
                stdout: out?,
                stderr: err?,
            })
        };

        match options.timeout {
            Some(limit) => tokio::time::timeout(limit, finished)
                .await
                .map_err(|_| ExecError::timeout(command, limit))?,
            None => finished.await,
        }
    }
}

/// Reads `reader` line by line, forwarding each line as it arrives.
async fn collect_lines<R>(reader: R, stream: OutputStream, options: &ExecOptions) -> Result<String>
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    let mut captured = String::new();
    while let Some(line) = lines.next_line().await? {
        options.emit(stream, &line);
        captured.push_str(&line);
        captured.push('\n');
    }
    Ok(captured)
}

/// Splits arbitrary byte chunks into complete lines.
///
/// Remote exec APIs deliver output in chunks that do not respect line
/// boundaries; this keeps the trailing partial line until more data arrives.
#[derive(Debug, Default)]
pub(crate) struct LineBuffer {
    pending: Vec<u8>,
    captured: String,
}

impl LineBuffer {
    /// Appends a chunk and returns the lines it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw[..raw.len() - 1])
                .trim_end_matches('\r')
                .to_string();
            self.captured.push_str(&line);
            self.captured.push('\n');
            lines.push(line);
        }
        lines
    }

    /// Flushes the trailing partial line, if any, and returns all captured text.
    pub fn finish(mut self) -> (Option<String>, String) {
        if self.pending.is_empty() {
            return (None, self.captured);
        }
        let line = String::from_utf8_lossy(&self.pending).to_string();
        self.captured.push_str(&line);
        (Some(line), self.captured)
    }
}

/// Feeds a chunk through `buffer`, emitting completed lines via `options`.
pub(crate) fn forward_chunk(
    buffer: &mut LineBuffer,
    chunk: &[u8],
    stream: OutputStream,
    options: &ExecOptions,
) {
    for line in buffer.push(chunk) {
        options.emit(stream, &line);
    }
}

/// Flushes `buffer`, emitting the last partial line, and returns the capture.
pub(crate) fn finish_stream(
    buffer: LineBuffer,
    stream: OutputStream,
    options: &ExecOptions,
) -> String {
    let (tail, captured) = buffer.finish();
    if let Some(line) = tail {
        options.emit(stream, &line);
    }
    captured
}
