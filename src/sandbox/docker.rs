use anyhow::{Context, Result};
use async_trait::async_trait;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, InspectContainerOptions,
    ListContainersOptions, LogOutput, RemoveContainerOptions, UploadToContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::ContainerInspectResponse;
use bollard::Docker;
use bytes::Bytes;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::time::Duration;
use tar::{Builder, Header};
use tracing::{debug, info, warn};

use super::{render_host_template, Sandbox, SandboxError};
use crate::config::SandboxConfig;
use crate::exec::{
    finish_stream, forward_chunk, CommandExecutor, CommandOutput, ExecError, ExecOptions,
    LineBuffer, OutputStream,
};

/// Label marking containers created by burrow.
const MANAGED_LABEL: &str = "burrow.managed";

/// Seconds between SIGTERM and SIGKILL for a timed-out exec.
const KILL_GRACE_SECS: u64 = 5;

/// Exit codes `timeout(1)` reports after stopping the command.
const TIMEOUT_EXIT_CODES: [i64; 2] = [124, 137];

/// Runs `$3` under `timeout(1)` with limit `$1` and kill grace `$2`, or
/// plainly when the image has no `timeout`.
const TIMEOUT_WRAPPER: &str = "if command -v timeout >/dev/null 2>&1; then \
exec timeout -s TERM -k \"$2\" \"$1\" sh -c \"$3\"; else exec sh -c \"$3\"; fi";

/// A Docker container used as a remote sandbox.
pub(crate) struct DockerSandbox {
    docker: Docker,
    id: String,
    config: SandboxConfig,
}

/// One row of `burrow sandboxes list`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SandboxSummary {
    pub id: String,
    pub name: String,
    pub image: String,
    pub state: String,
    pub status: String,
}

impl DockerSandbox {
    /// Creates and starts a fresh sandbox container.
    pub async fn create(config: &SandboxConfig) -> Result<Self> {
        let docker = connect().await?;
        ensure_image(&docker, &config.image).await?;

        let name = format!("burrow-{}", short_id());
        let mut labels: HashMap<String, String> = config
            .labels
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        labels.insert(MANAGED_LABEL.to_string(), "true".to_string());

        let container_config = ContainerConfig {
            image: Some(config.image.clone()),
            cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            user: config.user.clone(),
            labels: Some(labels),
            host_config: Some(bollard::service::HostConfig {
                init: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        };

        debug!("Creating container: {}", name);
        docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.clone(),
                    platform: None,
                }),
                container_config,
            )
            .await
            .map_err(|e| SandboxError::operation_failed("create", &name, e.to_string()))?;

        debug!("Starting container");
        docker
            .start_container::<String>(&name, None)
            .await
            .map_err(|e| SandboxError::operation_failed("start", &name, e.to_string()))?;

        info!("Created sandbox {}", name);
        let sandbox = Self {
            docker,
            id: name,
            config: config.clone(),
        };

        let mkdir = format!(
            "mkdir -p {}",
            shell_words::quote(&sandbox.config.workdir)
        );
        let output = sandbox.run(&mkdir, ExecOptions::default()).await?;
        if !output.success() {
            warn!(
                "Could not create workdir {}: {}",
                sandbox.config.workdir,
                output.failure_text()
            );
        }

        Ok(sandbox)
    }

    /// Connects to an existing, running sandbox by id or name.
    pub async fn connect(id: &str, config: &SandboxConfig) -> Result<Self> {
        let docker = connect().await?;
        let details = inspect(&docker, id).await?;

        let running = details
            .state
            .as_ref()
            .and_then(|s| s.running)
            .unwrap_or(false);
        if !running {
            let state = details
                .state
                .as_ref()
                .and_then(|s| s.status.as_ref())
                .map_or_else(|| "unknown".to_string(), |s| format!("{s:?}").to_lowercase());
            return Err(SandboxError::not_running(id, state).into());
        }

        let id = details
            .name
            .as_deref()
            .map_or_else(|| id.to_string(), |n| n.trim_start_matches('/').to_string());

        info!("Connected to sandbox {}", id);
        Ok(Self {
            docker,
            id,
            config: config.clone(),
        })
    }

    /// Lists sandboxes created by burrow.
    pub async fn list() -> Result<Vec<SandboxSummary>> {
        let docker = connect().await?;
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![MANAGED_LABEL.to_string()]);

        let containers = docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .context("Failed to list containers")?;

        Ok(containers
            .into_iter()
            .map(|c| SandboxSummary {
                id: c.id.unwrap_or_default().chars().take(12).collect(),
                name: c
                    .names
                    .and_then(|names| names.into_iter().next())
                    .map(|n| n.trim_start_matches('/').to_string())
                    .unwrap_or_default(),
                image: c.image.unwrap_or_default(),
                state: c.state.unwrap_or_default(),
                status: c.status.unwrap_or_default(),
            })
            .collect())
    }

    /// Force-removes a sandbox by id or name.
    pub async fn kill(id: &str) -> Result<()> {
        let docker = connect().await?;
        remove(&docker, id).await
    }

    /// Force-removes this sandbox.
    pub async fn destroy(self) -> Result<()> {
        remove(&self.docker, &self.id).await
    }

    /// The sandbox's working directory for repositories.
    pub fn workdir(&self) -> &str {
        &self.config.workdir
    }

    async fn container_ip(&self) -> Result<String, SandboxError> {
        let details = inspect(&self.docker, &self.id)
            .await
            .map_err(|e| SandboxError::operation_failed("inspect", &self.id, e.to_string()))?;
        container_ip(&details).ok_or_else(|| {
            SandboxError::operation_failed("inspect", &self.id, "container has no IP address")
        })
    }

    async fn exec(&self, command: &str, options: &ExecOptions) -> Result<CommandOutput> {
        let env: Vec<String> = options
            .env
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();

        let exec = self
            .docker
            .create_exec(
                &self.id,
                CreateExecOptions {
                    cmd: Some(exec_argv(command, options.timeout)),
                    env: Some(env),
                    working_dir: options.cwd.clone(),
                    user: self.config.user.clone(),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| SandboxError::operation_failed("exec", &self.id, e.to_string()))?;

        let mut stdout = LineBuffer::default();
        let mut stderr = LineBuffer::default();

        if let StartExecResults::Attached {
            output: mut stream, ..
        } = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| SandboxError::operation_failed("exec", &self.id, e.to_string()))?
        {
            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(LogOutput::StdOut { message } | LogOutput::Console { message }) => {
                        forward_chunk(&mut stdout, &message, OutputStream::Stdout, options);
                    }
                    Ok(LogOutput::StdErr { message }) => {
                        forward_chunk(&mut stderr, &message, OutputStream::Stderr, options);
                    }
                    Err(e) => {
                        warn!("Error reading exec output: {}", e);
                    }
                    Ok(LogOutput::StdIn { .. }) => {}
                }
            }
        }

        let inspected = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| SandboxError::operation_failed("exec", &self.id, e.to_string()))?;

        Ok(CommandOutput {
            exit_code: inspected.exit_code.unwrap_or(-1),
            stdout: finish_stream(stdout, OutputStream::Stdout, options),
            stderr: finish_stream(stderr, OutputStream::Stderr, options),
        })
    }
}

#[async_trait]
impl CommandExecutor for DockerSandbox {
    async fn run(&self, command: &str, options: ExecOptions) -> Result<CommandOutput> {
        debug!("[{}] {}", self.id, command);
        let Some(limit) = options.timeout else {
            return self.exec(command, &options).await;
        };

        // The limit is enforced inside the container so a timed-out command
        // does not keep running next to its retry. The local timeout only
        // covers a daemon that stops answering.
        let started = std::time::Instant::now();
        let backstop = limit + Duration::from_secs(KILL_GRACE_SECS + 5);
        let output = tokio::time::timeout(backstop, self.exec(command, &options))
            .await
            .map_err(|_| ExecError::timeout(command, limit))??;

        if TIMEOUT_EXIT_CODES.contains(&output.exit_code) && started.elapsed() >= limit {
            return Err(ExecError::timeout(command, limit).into());
        }
        Ok(output)
    }
}

#[async_trait]
impl Sandbox for DockerSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    async fn host_url(&self, port: u16) -> Result<String> {
        if let Some(ref template) = self.config.host_template {
            return Ok(render_host_template(template, &self.id, port));
        }
        let ip = self
            .container_ip()
            .await
            .map_err(|e| SandboxError::host_resolution(&self.id, port, e.to_string()))?;
        Ok(format!("http://{ip}:{port}"))
    }

    async fn write_file(&self, path: &str, contents: &[u8]) -> Result<()> {
        let absolute = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("{}/{}", self.config.workdir.trim_end_matches('/'), path)
        };

        let archive = tar_single_file(absolute.trim_start_matches('/'), contents)
            .context("Failed to build upload archive")?;

        self.docker
            .upload_to_container(
                &self.id,
                Some(UploadToContainerOptions {
                    path: "/".to_string(),
                    ..Default::default()
                }),
                archive,
            )
            .await
            .map_err(|e| SandboxError::operation_failed("write-file", &self.id, e.to_string()))?;

        debug!("Wrote {} bytes to {}:{}", contents.len(), self.id, absolute);
        Ok(())
    }
}

/// Connects to the local Docker daemon and checks it responds.
async fn connect() -> Result<Docker> {
    let docker = Docker::connect_with_local_defaults()
        .map_err(|e| SandboxError::docker_unavailable(e.to_string()))?;

    docker
        .ping()
        .await
        .map_err(|e| SandboxError::docker_unavailable(format!("cannot ping daemon: {e}")))?;

    Ok(docker)
}

async fn inspect(docker: &Docker, id: &str) -> Result<ContainerInspectResponse> {
    docker
        .inspect_container(id, None::<InspectContainerOptions>)
        .await
        .map_err(|e| match e {
            bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            } => SandboxError::not_found(id).into(),
            other => anyhow::Error::from(SandboxError::operation_failed(
                "inspect",
                id,
                other.to_string(),
            )),
        })
}

async fn remove(docker: &Docker, id: &str) -> Result<()> {
    docker
        .remove_container(
            id,
            Some(RemoveContainerOptions {
                force: true,
                ..Default::default()
            }),
        )
        .await
        .map_err(|e| SandboxError::operation_failed("remove", id, e.to_string()))?;
    info!("Removed sandbox {}", id);
    Ok(())
}

/// Pulls `image` unless it is already present locally.
async fn ensure_image(docker: &Docker, image: &str) -> Result<()> {
    if docker.inspect_image(image).await.is_ok() {
        debug!("Image {} present locally", image);
        return Ok(());
    }

    info!("Pulling image {}...", image);
    let mut stream = docker.create_image(
        Some(CreateImageOptions {
            from_image: image,
            ..Default::default()
        }),
        None,
        None,
    );

    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(output) => {
                if let Some(error) = output.error {
                    anyhow::bail!("Docker pull error for {image}: {error}");
                }
                if let Some(status) = output.status {
                    debug!("pull: {}", status.trim());
                }
            }
            Err(e) => anyhow::bail!("Error pulling image {image}: {e}"),
        }
    }

    Ok(())
}

/// Picks the container's address on its first attached network.
fn container_ip(details: &ContainerInspectResponse) -> Option<String> {
    let settings = details.network_settings.as_ref()?;
    if let Some(ip) = settings.ip_address.as_deref().filter(|ip| !ip.is_empty()) {
        return Some(ip.to_string());
    }
    let mut networks: Vec<_> = settings.networks.as_ref()?.iter().collect();
    networks.sort_by(|a, b| a.0.cmp(b.0));
    networks
        .into_iter()
        .filter_map(|(_, endpoint)| endpoint.ip_address.clone())
        .find(|ip| !ip.is_empty())
}

/// Builds a tar archive holding one file with owner-only permissions.
fn tar_single_file(path: &str, contents: &[u8]) -> std::io::Result<Bytes> {
    let mut buf = Vec::new();
    {
        let mut tar = Builder::new(&mut buf);
        let mut header = Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o600);
        header.set_cksum();
        tar.append_data(&mut header, path, contents)?;
        tar.finish()?;
    }
    Ok(Bytes::from(buf))
}

fn short_id() -> String {
    uuid::Uuid::new_v4().simple().to_string().chars().take(8).collect()
}

/// The exec argv for `command`, bounded by `limit` inside the container.
fn exec_argv(command: &str, limit: Option<Duration>) -> Vec<String> {
    let Some(limit) = limit else {
        return vec!["sh".to_string(), "-c".to_string(), command.to_string()];
    };
    let secs = (limit.as_secs() + u64::from(limit.subsec_nanos() > 0)).max(1);
    vec![
        "sh".to_string(),
        "-c".to_string(),
        TIMEOUT_WRAPPER.to_string(),
        "burrow-exec".to_string(),
        secs.to_string(),
        KILL_GRACE_SECS.to_string(),
        command.to_string(),
    ]
}
