use async_trait::async_trait;
use std::path::Path;
use tokio::process::Command;

use crate::error::{EngineError, EngineResult};

/// Exit code the docker CLI uses for daemon-side failures, as opposed
/// to the contained command's own exit status.
const DOCKER_DAEMON_ERROR: i32 = 125;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContainerId(pub String);

impl std::fmt::Display for ContainerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short ids read better in logs.
        write!(f, "{}", &self.0[..self.0.len().min(12)])
    }
}

/// Captured output of one in-container execution, streams kept apart.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// The container seam of the pool. The production driver shells out to
/// the docker CLI; tests substitute an in-process fake.
#[async_trait]
pub trait ContainerDriver: Send + Sync {
    /// Start a long-lived sandbox container with `scratch` bound
    /// read-only at the configured mount point.
    async fn create(&self, scratch: &Path) -> EngineResult<ContainerId>;

    /// Run `command` inside the container with the scratch bind as the
    /// working directory.
    async fn exec(&self, id: &ContainerId, command: &[&str]) -> EngineResult<ExecOutput>;

    /// Force-remove the container.
    async fn remove(&self, id: &ContainerId) -> EngineResult<()>;
}

/// Docker CLI driver. One sandbox container per worker: read-only root
/// filesystem, 64 MiB writable `/tmp`, 256 MiB memory cap, attached to
/// the private backend network.
pub struct DockerCli {
    image: String,
    network: String,
    bind_target: String,
}

impl DockerCli {
    pub fn new(image: String, network: String, bind_target: String) -> Self {
        Self {
            image,
            network,
            bind_target,
        }
    }

    async fn docker(&self, args: &[&str]) -> EngineResult<std::process::Output> {
        Command::new("docker")
            .args(args)
            .output()
            .await
            .map_err(|e| EngineError::SandboxTransient(format!("docker spawn failed: {e}")))
    }
}

#[async_trait]
impl ContainerDriver for DockerCli {
    async fn create(&self, scratch: &Path) -> EngineResult<ContainerId> {
        let bind = format!("{}:{}:ro", scratch.display(), self.bind_target);
        let args = [
            "run",
            "-d",
            "--network",
            self.network.as_str(),
            "--memory",
            "256m",
            "--read-only",
            "--tmpfs",
            "/tmp:rw,noexec,nosuid,size=64M",
            "-v",
            bind.as_str(),
            self.image.as_str(),
        ];
        let output = self.docker(&args).await?;
        if !output.status.success() {
            return Err(EngineError::SandboxTransient(format!(
                "docker run failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        let id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if id.is_empty() {
            return Err(EngineError::SandboxTransient(
                "docker run returned no container id".to_string(),
            ));
        }
        Ok(ContainerId(id))
    }

    async fn exec(&self, id: &ContainerId, command: &[&str]) -> EngineResult<ExecOutput> {
        let mut args = vec!["exec", "-w", self.bind_target.as_str(), id.0.as_str()];
        args.extend_from_slice(command);
        let output = self.docker(&args).await?;

        let exit_code = output.status.code().ok_or_else(|| {
            EngineError::SandboxTransient("docker exec terminated by signal".to_string())
        })?;
        if exit_code == DOCKER_DAEMON_ERROR {
            return Err(EngineError::SandboxTransient(format!(
                "docker exec failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(ExecOutput {
            exit_code,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn remove(&self, id: &ContainerId) -> EngineResult<()> {
        let output = self.docker(&["rm", "-f", id.0.as_str()]).await?;
        if !output.status.success() {
            return Err(EngineError::SandboxTransient(format!(
                "docker rm failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}
