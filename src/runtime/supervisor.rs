// SPDX-License-Identifier: MIT
//! Container supervisor — agent lifecycle against the abstract runtime.
//!
//! Containers are created lazily on first start and persist across stops;
//! only an explicit remove destroys them. Runtime state is never trusted
//! beyond one request: `status` and `list` re-inspect the backend every
//! time. Every transition emits `bee:status`.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::config::HiveConfig;
use crate::error::HiveError;
use crate::events::{BeeStatus, Event, EventBus};
use crate::mail::counter::InboxCounter;
use crate::mail::store::MailStore;
use crate::mail::watcher::OutboxWatchers;
use crate::runtime::{ContainerRuntime, ContainerSpec, Mount};
use crate::swarm::model::{Bee, NodeType, SwarmConfig};
use crate::swarm::registry::SwarmRegistry;
use crate::topology::TopologyHandle;

/// Observed runtime state for one agent. Derived from inspection, never
/// persisted.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentState {
    pub id: String,
    pub running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl AgentState {
    fn stopped(id: &str, container_id: Option<String>) -> AgentState {
        AgentState {
            id: id.to_string(),
            running: false,
            container_id,
            started_at: None,
        }
    }
}

/// One neighbor entry in an agent's `hierarchy.json`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HierarchyPeer {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
}

/// The file contract with the agent runtime: an agent learns exactly its
/// neighborhood, never the global graph.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HierarchyFile {
    pub agent_id: String,
    pub receives_tasks_from: Vec<HierarchyPeer>,
    pub can_delegate_to: Vec<HierarchyPeer>,
}

pub struct Supervisor {
    config: Arc<HiveConfig>,
    store: Arc<MailStore>,
    registry: Arc<SwarmRegistry>,
    topology: Arc<TopologyHandle>,
    runtime: Arc<dyn ContainerRuntime>,
    watchers: Arc<OutboxWatchers>,
    counter: Arc<InboxCounter>,
    bus: EventBus,
    /// agentId → container handle, for containers created this process or
    /// adopted on a previous start.
    containers: tokio::sync::Mutex<HashMap<String, String>>,
}

impl Supervisor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<HiveConfig>,
        store: Arc<MailStore>,
        registry: Arc<SwarmRegistry>,
        topology: Arc<TopologyHandle>,
        runtime: Arc<dyn ContainerRuntime>,
        watchers: Arc<OutboxWatchers>,
        counter: Arc<InboxCounter>,
        bus: EventBus,
    ) -> Arc<Supervisor> {
        Arc::new(Supervisor {
            config,
            store,
            registry,
            topology,
            runtime,
            watchers,
            counter,
            bus,
            containers: tokio::sync::Mutex::new(HashMap::new()),
        })
    }

    // ── Lifecycle ────────────────────────────────────────────────────────────

    pub async fn start_agent(&self, agent_id: &str) -> Result<AgentState, HiveError> {
        let cfg = self.registry.snapshot();
        let bee = cfg
            .bee(agent_id)
            .ok_or_else(|| HiveError::UnknownNode(agent_id.to_string()))?
            .clone();
        if self.config.provider_api_key.is_none() {
            return Err(HiveError::Validation(
                "PROVIDER_API_KEY must be set to start agents".into(),
            ));
        }

        self.store.ensure_agent_dirs(agent_id).await?;
        self.provision_soul(&bee).await?;
        self.write_hierarchy(&cfg, agent_id).await?;

        // Lazy creation: reuse the known container, otherwise create one.
        let container_id = {
            let mut containers = self.containers.lock().await;
            match containers.get(agent_id) {
                Some(id) => id.clone(),
                None => {
                    let id = self.runtime.create(&self.container_spec(&bee)).await?;
                    containers.insert(agent_id.to_string(), id.clone());
                    id
                }
            }
        };
        self.runtime.start(&container_id).await?;

        self.watchers.watch(agent_id).await?;
        self.counter.track_node(agent_id).await;
        self.counter.set_running(agent_id, true).await;

        let inspected = self.runtime.inspect(&container_id).await?;
        let state = AgentState {
            id: agent_id.to_string(),
            running: inspected.running,
            container_id: Some(container_id),
            started_at: inspected.started_at,
        };
        info!(agent = agent_id, "agent started");
        self.emit_status(&state);
        Ok(state)
    }

    pub async fn stop_agent(&self, agent_id: &str) -> Result<AgentState, HiveError> {
        if self.registry.snapshot().bee(agent_id).is_none() {
            return Err(HiveError::UnknownNode(agent_id.to_string()));
        }
        self.watchers.unwatch(agent_id).await;
        self.counter.set_running(agent_id, false).await;

        let container_id = self.containers.lock().await.get(agent_id).cloned();
        if let Some(id) = &container_id {
            self.runtime.stop(id).await?;
        }
        let state = AgentState::stopped(agent_id, container_id);
        info!(agent = agent_id, "agent stopped");
        self.emit_status(&state);
        Ok(state)
    }

    /// Destroy the agent's container and data subtree. Refused while the
    /// agent is still present in the swarm registry.
    pub async fn remove_agent(&self, agent_id: &str) -> Result<(), HiveError> {
        if self.registry.snapshot().bee(agent_id).is_some() {
            return Err(HiveError::Busy(format!(
                "agent '{agent_id}' is still registered — remove it from the swarm first"
            )));
        }
        self.watchers.unwatch(agent_id).await;

        if let Some(container_id) = self.containers.lock().await.remove(agent_id) {
            if let Err(e) = self.runtime.stop(&container_id).await {
                warn!(agent = agent_id, err = %e, "stop during removal failed");
            }
            if let Err(e) = self.runtime.remove(&container_id).await {
                warn!(agent = agent_id, err = %e, "container removal failed");
            }
        }

        let dir = self.store.agent_dir(agent_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.counter.forget(agent_id).await;
        info!(agent = agent_id, "agent removed");
        self.emit_status(&AgentState::stopped(agent_id, None));
        Ok(())
    }

    /// Fresh inspection of one agent.
    pub async fn status(&self, agent_id: &str) -> Result<AgentState, HiveError> {
        if self.registry.snapshot().bee(agent_id).is_none() {
            return Err(HiveError::UnknownNode(agent_id.to_string()));
        }
        let container_id = self.containers.lock().await.get(agent_id).cloned();
        match container_id {
            None => Ok(AgentState::stopped(agent_id, None)),
            Some(id) => {
                let inspected = self.runtime.inspect(&id).await?;
                Ok(AgentState {
                    id: agent_id.to_string(),
                    running: inspected.running,
                    container_id: Some(id),
                    started_at: inspected.started_at,
                })
            }
        }
    }

    /// Runtime state for every registered bee, each freshly inspected.
    pub async fn list(&self) -> Vec<(Bee, AgentState)> {
        let cfg = self.registry.snapshot();
        let mut out = Vec::with_capacity(cfg.bees.len());
        for bee in &cfg.bees {
            let state = match self.status(&bee.id).await {
                Ok(state) => state,
                Err(e) => {
                    warn!(agent = %bee.id, err = %e, "inspect failed");
                    AgentState::stopped(&bee.id, None)
                }
            };
            out.push((bee.clone(), state));
        }
        out
    }

    // ── Hierarchy contract ───────────────────────────────────────────────────

    /// Compute the upstream/downstream neighborhood for one agent.
    pub fn hierarchy(&self, cfg: &SwarmConfig, agent_id: &str) -> Result<HierarchyFile, HiveError> {
        if cfg.bee(agent_id).is_none() {
            return Err(HiveError::UnknownNode(agent_id.to_string()));
        }
        let topology = self.topology.snapshot();
        let peer = |node: &String| HierarchyPeer {
            id: node.clone(),
            name: cfg.node_name(node),
            node_type: cfg.node_type(node).unwrap_or(NodeType::Agent),
        };
        Ok(HierarchyFile {
            agent_id: agent_id.to_string(),
            receives_tasks_from: topology.senders_to(agent_id).iter().map(peer).collect(),
            can_delegate_to: topology.recipients_of(agent_id).iter().map(peer).collect(),
        })
    }

    /// Rewrite `state/hierarchy.json` for one agent.
    pub async fn write_hierarchy(&self, cfg: &SwarmConfig, agent_id: &str) -> Result<(), HiveError> {
        let hierarchy = self.hierarchy(cfg, agent_id)?;
        let path = self.store.hierarchy_path(agent_id);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let bytes = serde_json::to_vec_pretty(&hierarchy)
            .map_err(|e| HiveError::Validation(format!("encode hierarchy: {e}")))?;
        let tmp = path.with_extension("json.tmp");
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    /// Rewrite every registered agent's hierarchy file. Called after every
    /// topology-affecting mutation.
    pub async fn refresh_hierarchies(&self) {
        let cfg = self.registry.snapshot();
        for bee in &cfg.bees {
            if let Err(e) = self.write_hierarchy(&cfg, &bee.id).await {
                warn!(agent = %bee.id, err = %e, "hierarchy rewrite failed");
            }
        }
    }

    // ── Internals ────────────────────────────────────────────────────────────

    /// Write `soul.md` during provisioning only — an existing soul file is
    /// the agent's and is never overwritten.
    async fn provision_soul(&self, bee: &Bee) -> Result<(), HiveError> {
        let Some(soul) = &bee.soul else { return Ok(()) };
        let path = self.store.soul_path(&bee.id);
        if tokio::fs::metadata(&path).await.is_ok() {
            return Ok(());
        }
        tokio::fs::write(&path, soul).await?;
        Ok(())
    }

    fn container_spec(&self, bee: &Bee) -> ContainerSpec {
        let mount = |host: std::path::PathBuf, container: &str, read_only: bool| Mount {
            host,
            container: container.to_string(),
            read_only,
        };
        let mut env = vec![
            ("AGENT_ID".to_string(), bee.id.clone()),
            ("AGENT_NAME".to_string(), bee.name.clone()),
        ];
        if let Some(model) = &bee.model {
            env.push(("MODEL".to_string(), model.clone()));
        }
        if let Some(key) = &self.config.provider_api_key {
            env.push(("PROVIDER_API_KEY".to_string(), key.clone()));
        }
        ContainerSpec {
            name: format!("hived-{}", bee.id),
            image: self.config.container_image.clone(),
            env,
            mounts: vec![
                mount(self.store.agent_inbox(&bee.id), "/hive/inbox", false),
                mount(self.store.agent_outbox(&bee.id), "/hive/outbox", false),
                mount(self.store.agent_state_dir(&bee.id), "/hive/state", false),
                mount(self.store.agent_logs_dir(&bee.id), "/hive/logs", false),
                mount(self.store.agent_workspace_dir(&bee.id), "/hive/workspace", false),
                mount(self.store.agent_session_dir(&bee.id), "/hive/session", false),
                mount(self.store.soul_path(&bee.id), "/hive/soul.md", true),
            ],
        }
    }

    fn emit_status(&self, state: &AgentState) {
        self.bus.publish(Event::BeeStatus(BeeStatus {
            id: state.id.clone(),
            running: state.running,
            container_id: state.container_id.clone(),
            started_at: state.started_at,
        }));
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mail::human::HumanStore;
    use crate::mail::router::Router;
    use crate::runtime::null::NullRuntime;
    use crate::topology::Topology;

    struct Fixture {
        supervisor: Arc<Supervisor>,
        registry: Arc<SwarmRegistry>,
        store: Arc<MailStore>,
        watchers: Arc<OutboxWatchers>,
        _dir: tempfile::TempDir,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = Arc::new(HiveConfig {
            data_root: dir.path().to_path_buf(),
            listen_addr: "127.0.0.1:0".into(),
            log: "warn".into(),
            container_backend: "none".into(),
            container_image: "test-image".into(),
            runtime_deadline: std::time::Duration::from_secs(5),
            auto_connect_human: false,
            provider_api_key: Some("test-key".into()),
        });
        let store = Arc::new(MailStore::new(dir.path()));
        store.ensure_layout().await.unwrap();
        let bus = EventBus::new();
        let registry = Arc::new(
            SwarmRegistry::load(store.swarm_path(), bus.clone())
                .await
                .unwrap(),
        );
        let topology = Arc::new(TopologyHandle::new(Topology::from_config(
            &registry.snapshot(),
        )));
        let human = Arc::new(HumanStore::new(store.human_dir()));
        let counter = InboxCounter::new(store.clone(), human.clone(), bus.clone());
        let router = Router::new(
            store.clone(),
            human,
            topology.clone(),
            counter.clone(),
            bus.clone(),
        );
        let watchers = OutboxWatchers::new(store.clone(), router, counter.clone(), bus.clone());
        let supervisor = Supervisor::new(
            config,
            store.clone(),
            registry.clone(),
            topology,
            Arc::new(NullRuntime::new()),
            watchers.clone(),
            counter,
            bus,
        );
        Fixture {
            supervisor,
            registry,
            store,
            watchers,
            _dir: dir,
        }
    }

    fn bee(id: &str) -> Bee {
        Bee {
            id: id.to_string(),
            name: id.to_uppercase(),
            model: Some("claude-sonnet".into()),
            soul: Some("You are a diligent worker bee.".into()),
        }
    }

    #[tokio::test]
    async fn start_provisions_and_runs() {
        let f = fixture().await;
        f.registry.add_bee(bee("b1"), true).await.unwrap();

        let state = f.supervisor.start_agent("b1").await.unwrap();
        assert!(state.running);
        assert!(state.container_id.is_some());

        // Directories, soul and hierarchy were provisioned.
        assert!(f.store.agent_inbox("b1").is_dir());
        assert!(f.store.soul_path("b1").exists());
        let hierarchy: serde_json::Value = serde_json::from_slice(
            &tokio::fs::read(f.store.hierarchy_path("b1")).await.unwrap(),
        )
        .unwrap();
        assert_eq!(hierarchy["agentId"], "b1");
        assert_eq!(hierarchy["receivesTasksFrom"][0]["id"], "human");
        assert_eq!(hierarchy["canDelegateTo"][0]["id"], "human");

        assert!(f.watchers.is_watching("b1").await);
        f.watchers.stop_all().await;
    }

    #[tokio::test]
    async fn stop_halts_container_and_watcher() {
        let f = fixture().await;
        f.registry.add_bee(bee("b1"), false).await.unwrap();
        f.supervisor.start_agent("b1").await.unwrap();

        let state = f.supervisor.stop_agent("b1").await.unwrap();
        assert!(!state.running);
        assert!(!f.watchers.is_watching("b1").await);

        // Container persists across stops and restarts cleanly.
        let state = f.supervisor.start_agent("b1").await.unwrap();
        assert!(state.running);
        f.watchers.stop_all().await;
    }

    #[tokio::test]
    async fn remove_refused_while_registered() {
        let f = fixture().await;
        f.registry.add_bee(bee("b1"), false).await.unwrap();
        let err = f.supervisor.remove_agent("b1").await.unwrap_err();
        assert_eq!(err.kind(), "ErrBusy");
    }

    #[tokio::test]
    async fn remove_purges_data_after_deregistration() {
        let f = fixture().await;
        f.registry.add_bee(bee("b1"), false).await.unwrap();
        f.supervisor.start_agent("b1").await.unwrap();
        f.supervisor.stop_agent("b1").await.unwrap();

        f.registry.remove_bee("b1").await.unwrap();
        f.supervisor.remove_agent("b1").await.unwrap();
        assert!(!f.store.agent_dir("b1").exists());
    }

    #[tokio::test]
    async fn status_requires_known_bee_and_reflects_runtime() {
        let f = fixture().await;
        let err = f.supervisor.status("ghost").await.unwrap_err();
        assert_eq!(err.kind(), "ErrUnknownNode");

        f.registry.add_bee(bee("b1"), false).await.unwrap();
        assert!(!f.supervisor.status("b1").await.unwrap().running);

        f.supervisor.start_agent("b1").await.unwrap();
        assert!(f.supervisor.status("b1").await.unwrap().running);
        f.watchers.stop_all().await;
    }

    #[tokio::test]
    async fn start_without_provider_key_is_rejected() {
        let f = fixture().await;
        f.registry.add_bee(bee("b1"), false).await.unwrap();

        // Rebuild a supervisor whose config lacks the key.
        let mut config = (*f.supervisor.config).clone();
        config.provider_api_key = None;
        let supervisor = Supervisor::new(
            Arc::new(config),
            f.supervisor.store.clone(),
            f.supervisor.registry.clone(),
            f.supervisor.topology.clone(),
            f.supervisor.runtime.clone(),
            f.supervisor.watchers.clone(),
            f.supervisor.counter.clone(),
            f.supervisor.bus.clone(),
        );
        let err = supervisor.start_agent("b1").await.unwrap_err();
        assert_eq!(err.kind(), "ErrValidation");
    }
}
