// SPDX-License-Identifier: MIT
//! In-memory container runtime. Tracks lifecycle state without spawning
//! anything — used by the test suites and by `CONTAINER_BACKEND=none`
//! setups where agents are driven externally.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::error::HiveError;
use crate::runtime::{ContainerRuntime, ContainerSpec, ContainerState};

#[derive(Debug, Clone)]
struct NullContainer {
    running: bool,
    started_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
pub struct NullRuntime {
    containers: Mutex<HashMap<String, NullContainer>>,
}

impl NullRuntime {
    pub fn new() -> NullRuntime {
        NullRuntime::default()
    }
}

#[async_trait]
impl ContainerRuntime for NullRuntime {
    async fn create(&self, _spec: &ContainerSpec) -> Result<String, HiveError> {
        let handle = format!("null-{}", uuid::Uuid::new_v4());
        self.containers.lock().await.insert(
            handle.clone(),
            NullContainer {
                running: false,
                started_at: None,
            },
        );
        Ok(handle)
    }

    async fn start(&self, handle: &str) -> Result<(), HiveError> {
        let mut containers = self.containers.lock().await;
        let container = containers
            .get_mut(handle)
            .ok_or_else(|| HiveError::NotFound(handle.to_string()))?;
        container.running = true;
        container.started_at = Some(Utc::now());
        Ok(())
    }

    async fn stop(&self, handle: &str) -> Result<(), HiveError> {
        let mut containers = self.containers.lock().await;
        let container = containers
            .get_mut(handle)
            .ok_or_else(|| HiveError::NotFound(handle.to_string()))?;
        container.running = false;
        Ok(())
    }

    async fn remove(&self, handle: &str) -> Result<(), HiveError> {
        self.containers
            .lock()
            .await
            .remove(handle)
            .map(|_| ())
            .ok_or_else(|| HiveError::NotFound(handle.to_string()))
    }

    async fn inspect(&self, handle: &str) -> Result<ContainerState, HiveError> {
        let containers = self.containers.lock().await;
        let container = containers
            .get(handle)
            .ok_or_else(|| HiveError::NotFound(handle.to_string()))?;
        Ok(ContainerState {
            running: container.running,
            started_at: container.started_at,
            state: if container.running { "running" } else { "exited" }.to_string(),
        })
    }

    fn name(&self) -> &'static str {
        "null"
    }
}
