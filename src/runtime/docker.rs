// SPDX-License-Identifier: MIT
//! Docker CLI backend. Every call shells out to `docker` under the
//! configured per-call deadline; a call that exceeds it surfaces as
//! `ErrContainerRuntime`, as does any non-zero exit.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::process::Command;
use tracing::debug;

use crate::error::HiveError;
use crate::runtime::{ContainerRuntime, ContainerSpec, ContainerState};

pub struct DockerCli {
    deadline: Duration,
}

impl DockerCli {
    pub fn new(deadline: Duration) -> DockerCli {
        DockerCli { deadline }
    }

    async fn run(&self, args: Vec<String>) -> Result<String, HiveError> {
        let verb = args.first().cloned().unwrap_or_default();
        // `create` args carry `-e PROVIDER_API_KEY=...`; never log past the verb.
        debug!(%verb, "docker invocation");
        let output = tokio::time::timeout(
            self.deadline,
            Command::new("docker").args(&args).kill_on_drop(true).output(),
        )
        .await
        .map_err(|_| {
            HiveError::ContainerRuntime(format!(
                "docker {verb} exceeded the {}s deadline",
                self.deadline.as_secs()
            ))
        })?
        .map_err(|e| HiveError::ContainerRuntime(format!("docker {verb} spawn failed: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(HiveError::ContainerRuntime(format!(
                "docker {verb} failed: {}",
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn create(&self, spec: &ContainerSpec) -> Result<String, HiveError> {
        let mut args = vec![
            "create".to_string(),
            "--name".to_string(),
            spec.name.clone(),
            "--label".to_string(),
            "io.hived.managed=true".to_string(),
        ];
        for (key, value) in &spec.env {
            args.push("-e".to_string());
            args.push(format!("{key}={value}"));
        }
        for mount in &spec.mounts {
            let mut binding = format!("{}:{}", mount.host.display(), mount.container);
            if mount.read_only {
                binding.push_str(":ro");
            }
            args.push("-v".to_string());
            args.push(binding);
        }
        args.push(spec.image.clone());
        self.run(args).await
    }

    async fn start(&self, handle: &str) -> Result<(), HiveError> {
        self.run(vec!["start".to_string(), handle.to_string()])
            .await
            .map(|_| ())
    }

    async fn stop(&self, handle: &str) -> Result<(), HiveError> {
        self.run(vec![
            "stop".to_string(),
            "-t".to_string(),
            "5".to_string(),
            handle.to_string(),
        ])
        .await
        .map(|_| ())
    }

    async fn remove(&self, handle: &str) -> Result<(), HiveError> {
        self.run(vec!["rm".to_string(), "-f".to_string(), handle.to_string()])
            .await
            .map(|_| ())
    }

    async fn inspect(&self, handle: &str) -> Result<ContainerState, HiveError> {
        let stdout = self
            .run(vec![
                "inspect".to_string(),
                "--format".to_string(),
                "{{json .State}}".to_string(),
                handle.to_string(),
            ])
            .await?;
        parse_state(&stdout)
    }

    fn name(&self) -> &'static str {
        "docker"
    }
}

#[derive(Deserialize)]
struct RawDockerState {
    #[serde(rename = "Running")]
    running: bool,
    #[serde(rename = "Status", default)]
    status: String,
    #[serde(rename = "StartedAt", default)]
    started_at: String,
}

fn parse_state(raw: &str) -> Result<ContainerState, HiveError> {
    let state: RawDockerState = serde_json::from_str(raw)
        .map_err(|e| HiveError::ContainerRuntime(format!("unreadable inspect output: {e}")))?;
    // Docker reports the zero time for containers that never started.
    let started_at = DateTime::parse_from_rfc3339(&state.started_at)
        .ok()
        .map(|t| t.with_timezone(&Utc))
        .filter(|t| t.timestamp() > 0);
    Ok(ContainerState {
        running: state.running,
        started_at,
        state: state.status,
    })
}
