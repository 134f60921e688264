// SPDX-License-Identifier: MIT
//! Container runtime capability — the abstract surface the supervisor
//! drives. Backends are selected by `CONTAINER_BACKEND`: `docker` shells
//! out to the Docker CLI, `none` is an in-memory runtime for tests and
//! backendless development.

pub mod docker;
pub mod null;
pub mod supervisor;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::HiveError;

/// A bind mount handed to the backend.
#[derive(Debug, Clone)]
pub struct Mount {
    pub host: PathBuf,
    pub container: String,
    pub read_only: bool,
}

/// Everything needed to create an agent container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub env: Vec<(String, String)>,
    pub mounts: Vec<Mount>,
}

/// Freshly inspected container state. Never cached beyond one request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerState {
    pub running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// Backend-specific state label ("running", "exited", ...).
    pub state: String,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create a container and return its handle. The container persists
    /// across stops until removed.
    async fn create(&self, spec: &ContainerSpec) -> Result<String, HiveError>;
    async fn start(&self, handle: &str) -> Result<(), HiveError>;
    async fn stop(&self, handle: &str) -> Result<(), HiveError>;
    async fn remove(&self, handle: &str) -> Result<(), HiveError>;
    async fn inspect(&self, handle: &str) -> Result<ContainerState, HiveError>;
    fn name(&self) -> &'static str;
}

/// Resolve the configured backend selector.
pub fn backend_for(
    selector: &str,
    deadline: Duration,
) -> Result<Arc<dyn ContainerRuntime>, HiveError> {
    match selector {
        "docker" => Ok(Arc::new(docker::DockerCli::new(deadline))),
        "none" | "null" => Ok(Arc::new(null::NullRuntime::new())),
        other => Err(HiveError::Validation(format!(
            "unknown container backend '{other}' (expected 'docker' or 'none')"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_selector_resolves() {
        let deadline = Duration::from_secs(1);
        assert_eq!(backend_for("docker", deadline).unwrap().name(), "docker");
        assert_eq!(backend_for("none", deadline).unwrap().name(), "null");
        assert_eq!(backend_for("null", deadline).unwrap().name(), "null");
        assert!(backend_for("podmad", deadline).is_err());
    }
}
