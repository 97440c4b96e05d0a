use std::collections::HashMap;
use std::future::Future;
use std::pin::pin;
use std::time::Duration;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::LogOutput;
use bollard::errors::Error as BollardError;
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::models::{ContainerCreateBody, ExecInspectResponse, HostConfig};
use bollard::query_parameters::{
    CreateContainerOptions, CreateImageOptions, RemoveContainerOptions, StartContainerOptions,
};
use futures_util::stream::{StreamExt, TryStreamExt};
use sandbox::{
    ContainerRuntime, ExecId, ExecSession, InstanceId, InstanceSpec, NetworkMode, OutputChunk,
    SandboxError,
};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::{DockerConfig, OWNER_LABEL};

/// How long a finished exec may keep reporting itself as running.
const INSPECT_RETRY_BUDGET: Duration = Duration::from_secs(5);
const INSPECT_RETRY_INITIAL: Duration = Duration::from_millis(20);
const INSPECT_RETRY_MAX: Duration = Duration::from_millis(250);

/// [`ContainerRuntime`] backed by the local Docker Engine.
pub struct DockerRuntime {
    docker: Docker,
    config: DockerConfig,
}

impl DockerRuntime {
    /// Connect using the local defaults (`DOCKER_HOST` or the unix socket)
    /// and verify the daemon answers.
    pub async fn connect(config: DockerConfig) -> sandbox::Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| SandboxError::BackendNotAvailable(format!("connect: {e}")))?;
        docker
            .ping()
            .await
            .map_err(|e| SandboxError::BackendNotAvailable(format!("ping: {e}")))?;
        info!("connected to docker daemon");
        Ok(Self { docker, config })
    }

    fn container_name(&self) -> String {
        format!("{}{}", self.config.name_prefix, uuid::Uuid::new_v4())
    }
}

/// Translate an [`InstanceSpec`] into the Docker create body.
fn build_create_body(spec: &InstanceSpec, config: &DockerConfig) -> ContainerCreateBody {
    let network_mode = match spec.network {
        NetworkMode::Isolated => "none",
    };

    let host_config = HostConfig {
        network_mode: Some(network_mode.to_string()),
        memory: Some(spec.resources.memory_bytes),
        // Swap equal to memory means no swap at all.
        memory_swap: Some(spec.resources.memory_bytes),
        nano_cpus: Some(nano_cpus(spec.resources.cpus)),
        pids_limit: Some(config.pids_limit),
        readonly_rootfs: Some(spec.read_only_root),
        tmpfs: Some(HashMap::from([(
            "/tmp".to_string(),
            format!("rw,noexec,nosuid,size={}", config.tmpfs_size),
        )])),
        cap_drop: Some(vec!["ALL".to_string()]),
        security_opt: Some(vec!["no-new-privileges".to_string()]),
        auto_remove: Some(false),
        ..Default::default()
    };

    ContainerCreateBody {
        image: Some(spec.image.clone()),
        cmd: Some(spec.cmd.clone()),
        user: Some(spec.user.clone()),
        tty: Some(false),
        attach_stdout: Some(false),
        attach_stderr: Some(false),
        network_disabled: Some(spec.network == NetworkMode::Isolated),
        labels: Some(HashMap::from([(OWNER_LABEL.to_string(), "true".to_string())])),
        host_config: Some(host_config),
        ..Default::default()
    }
}

fn nano_cpus(cpus: f64) -> i64 {
    (cpus * 1e9).round() as i64
}

/// Map one attach frame to a logical stream. Stdin echoes carry no output.
fn translate_frame(frame: LogOutput) -> Option<OutputChunk> {
    match frame {
        LogOutput::StdOut { message } | LogOutput::Console { message } => {
            Some(OutputChunk::Stdout(message))
        }
        LogOutput::StdErr { message } => Some(OutputChunk::Stderr(message)),
        LogOutput::StdIn { .. } => None,
    }
}

/// Poll `inspect` until the exec stops running. The attach stream can close
/// a moment before the daemon records the exit code, and on a loaded host
/// that moment can stretch well past a few hundred milliseconds.
async fn wait_for_exit<F, Fut>(exec: &ExecId, mut inspect: F) -> sandbox::Result<i64>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = sandbox::Result<ExecInspectResponse>>,
{
    let deadline = Instant::now() + INSPECT_RETRY_BUDGET;
    let mut delay = INSPECT_RETRY_INITIAL;
    loop {
        let response = inspect().await?;
        if response.running != Some(true) {
            return response
                .exit_code
                .ok_or_else(|| SandboxError::InspectFailed(format!("{exec}: no exit code")));
        }
        if Instant::now() + delay > deadline {
            return Err(SandboxError::InspectFailed(format!(
                "{exec}: still running after {}s",
                INSPECT_RETRY_BUDGET.as_secs()
            )));
        }
        debug!(exec = %exec, delay_ms = delay.as_millis() as u64, "exec still running");
        tokio::time::sleep(delay).await;
        delay = (delay * 2).min(INSPECT_RETRY_MAX);
    }
}

fn is_not_found(err: &BollardError) -> bool {
    matches!(
        err,
        BollardError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    fn name(&self) -> &str {
        "docker"
    }

    async fn pull_image(&self, image: &str) -> sandbox::Result<()> {
        info!(image, "pulling image");
        let options = CreateImageOptions {
            from_image: Some(image.to_string()),
            ..Default::default()
        };
        let mut progress = pin!(self.docker.create_image(Some(options), None, None));
        // The pull only completes once the progress stream is drained.
        while let Some(event) = progress.next().await {
            let event = event.map_err(|e| SandboxError::ImagePull(format!("{image}: {e}")))?;
            if let Some(status) = event.status {
                debug!(image, status = %status, "pull progress");
            }
        }
        info!(image, "image ready");
        Ok(())
    }

    async fn create_instance(&self, spec: &InstanceSpec) -> sandbox::Result<InstanceId> {
        let options = CreateContainerOptions {
            name: Some(self.container_name()),
            ..Default::default()
        };
        let body = build_create_body(spec, &self.config);
        let response = self
            .docker
            .create_container(Some(options), body)
            .await
            .map_err(|e| SandboxError::CreationFailed(e.to_string()))?;
        for warning in &response.warnings {
            debug!(id = %response.id, warning = %warning, "docker create warning");
        }
        Ok(InstanceId::new(response.id))
    }

    async fn start_instance(&self, id: &InstanceId) -> sandbox::Result<()> {
        self.docker
            .start_container(id.as_str(), None::<StartContainerOptions>)
            .await
            .map_err(|e| SandboxError::StartFailed(format!("{id}: {e}")))
    }

    async fn exec(&self, id: &InstanceId, cmd: &[String]) -> sandbox::Result<ExecSession> {
        let options = CreateExecOptions {
            cmd: Some(cmd.to_vec()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false),
            ..Default::default()
        };
        let created = self
            .docker
            .create_exec(id.as_str(), options)
            .await
            .map_err(|e| SandboxError::ExecFailed(format!("create exec in {id}: {e}")))?;

        let started = self
            .docker
            .start_exec(&created.id, None::<StartExecOptions>)
            .await
            .map_err(|e| SandboxError::ExecFailed(format!("start exec {}: {e}", created.id)))?;

        match started {
            StartExecResults::Attached { output, .. } => {
                let output = output
                    .map_err(|e| SandboxError::ExecFailed(format!("output stream: {e}")))
                    .try_filter_map(|frame| futures_util::future::ready(Ok(translate_frame(frame))))
                    .boxed();
                Ok(ExecSession {
                    id: ExecId::new(created.id),
                    output,
                })
            }
            StartExecResults::Detached => Err(SandboxError::ExecFailed(format!(
                "exec {} started detached",
                created.id
            ))),
        }
    }

    async fn inspect_exec(&self, exec: &ExecId) -> sandbox::Result<i64> {
        wait_for_exit(exec, || async move {
            self.docker
                .inspect_exec(exec.as_str())
                .await
                .map_err(|e| SandboxError::InspectFailed(format!("{exec}: {e}")))
        })
        .await
    }

    async fn remove_instance(&self, id: &InstanceId) -> sandbox::Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        match self.docker.remove_container(id.as_str(), Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Err(SandboxError::NotFound(id.to_string())),
            Err(e) => Err(SandboxError::RemoveFailed(format!("{id}: {e}"))),
        }
    }
}
