//! Supervisor implementation driving the `docker` CLI.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use std::process::Output;
use std::time::Duration;

use async_trait::async_trait;
use datalab_supervisor::{Error, LogTail, ServiceStatus, Supervisor};
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

/// Options for configuring `DockerSupervisor`.
pub struct DockerSupervisorOptions {
    /// Path to the docker binary.
    pub bin: String,

    /// Timeout applied to every docker invocation.
    pub command_timeout: Duration,
}

/// Drives cluster services through the `docker` CLI.
#[derive(Clone)]
pub struct DockerSupervisor {
    bin: String,
    command_timeout: Duration,
}

impl DockerSupervisor {
    /// Creates a new instance of `DockerSupervisor`.
    #[must_use]
    pub fn new(
        DockerSupervisorOptions {
            bin,
            command_timeout,
        }: DockerSupervisorOptions,
    ) -> Self {
        Self {
            bin,
            command_timeout,
        }
    }

    async fn docker(&self, op: &'static str, args: &[&str]) -> Result<Output, Error> {
        debug!("running {} {}", self.bin, args.join(" "));

        timeout(
            self.command_timeout,
            Command::new(&self.bin).args(args).output(),
        )
        .await
        .map_err(|_| {
            Error::CommandFailed(op, format!("timed out after {:?}", self.command_timeout))
        })?
        .map_err(|e| Error::Io(op, e))
    }

    fn classify(op: &'static str, service: &str, output: &Output) -> Error {
        let stderr = String::from_utf8_lossy(&output.stderr);

        if stderr.contains("Cannot connect to the Docker daemon") {
            Error::Unreachable(stderr.trim().to_string())
        } else if stderr.contains("No such container") || stderr.contains("No such object") {
            Error::UnknownService(service.to_string())
        } else {
            Error::CommandFailed(op, stderr.trim().to_string())
        }
    }

    fn parse_inspect_state(stdout: &str) -> ServiceStatus {
        match stdout.trim() {
            "true" => ServiceStatus::Running,
            "false" => ServiceStatus::Stopped,
            _ => ServiceStatus::Unknown,
        }
    }
}

#[async_trait]
impl Supervisor for DockerSupervisor {
    async fn start(&self, service: &str) -> Result<(), Error> {
        let output = self.docker("docker start", &["start", service]).await?;

        if output.status.success() {
            Ok(())
        } else {
            Err(Self::classify("docker start", service, &output))
        }
    }

    async fn stop(&self, service: &str) -> Result<(), Error> {
        let output = self.docker("docker stop", &["stop", service]).await?;

        if output.status.success() {
            Ok(())
        } else {
            Err(Self::classify("docker stop", service, &output))
        }
    }

    async fn logs(&self, service: &str, tail: usize) -> Result<LogTail, Error> {
        let tail_arg = tail.to_string();
        let output = self
            .docker("docker logs", &["logs", "--tail", &tail_arg, service])
            .await?;

        if !output.status.success() {
            return Err(Self::classify("docker logs", service, &output));
        }

        // Containers log to either stream, so capture both.
        let mut lines: Vec<String> = Vec::new();
        lines.extend(
            String::from_utf8_lossy(&output.stdout)
                .lines()
                .map(ToString::to_string),
        );
        lines.extend(
            String::from_utf8_lossy(&output.stderr)
                .lines()
                .map(ToString::to_string),
        );

        Ok(LogTail { lines })
    }

    async fn status(&self, service: &str) -> Result<ServiceStatus, Error> {
        let output = self
            .docker(
                "docker inspect",
                &["inspect", "--format", "{{.State.Running}}", service],
            )
            .await?;

        if output.status.success() {
            Ok(Self::parse_inspect_state(&String::from_utf8_lossy(
                &output.stdout,
            )))
        } else {
            match Self::classify("docker inspect", service, &output) {
                Error::UnknownService(_) => Ok(ServiceStatus::Unknown),
                other => Err(other),
            }
        }
    }
}
