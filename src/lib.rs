// SPDX-License-Identifier: MIT
//! hived — orchestrator daemon for containerized agent swarms.
//!
//! Agents ("bees") run in sandboxed containers and talk exclusively through
//! filesystem mail queues; the daemon routes mail along an explicit
//! connection topology, supervises containers, and fans events out to
//! observers.

pub mod config;
pub mod error;
pub mod events;
pub mod gateway;
pub mod mail;
pub mod retry;
pub mod runtime;
pub mod swarm;
pub mod topology;

use std::sync::Arc;

use anyhow::Context as _;
use tokio::sync::watch;

use config::HiveConfig;
use events::EventBus;
use mail::counter::InboxCounter;
use mail::human::HumanStore;
use mail::router::Router;
use mail::store::MailStore;
use mail::watcher::OutboxWatchers;
use runtime::supervisor::Supervisor;
use swarm::registry::SwarmRegistry;
use topology::{Topology, TopologyHandle};

/// Shared application state passed to every gateway handler and background
/// task.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<HiveConfig>,
    pub store: Arc<MailStore>,
    pub human: Arc<HumanStore>,
    pub bus: EventBus,
    pub registry: Arc<SwarmRegistry>,
    pub topology: Arc<TopologyHandle>,
    pub counter: Arc<InboxCounter>,
    pub router: Arc<Router>,
    pub watchers: Arc<OutboxWatchers>,
    pub supervisor: Arc<Supervisor>,
    pub started_at: std::time::Instant,
}

impl AppContext {
    /// Wire every subsystem together against the configured data root.
    pub async fn bootstrap(config: HiveConfig) -> anyhow::Result<Arc<AppContext>> {
        let config = Arc::new(config);
        let store = Arc::new(MailStore::new(&config.data_root));
        store
            .ensure_layout()
            .await
            .with_context(|| format!("create data layout at {}", config.data_root.display()))?;

        let bus = EventBus::new();
        let registry = Arc::new(
            SwarmRegistry::load(store.swarm_path(), bus.clone())
                .await
                .context("load swarm registry")?,
        );
        let topology = Arc::new(TopologyHandle::new(Topology::from_config(
            &registry.snapshot(),
        )));
        let human = Arc::new(HumanStore::new(store.human_dir()));
        let counter = InboxCounter::new(store.clone(), human.clone(), bus.clone());
        let router = Router::new(
            store.clone(),
            human.clone(),
            topology.clone(),
            counter.clone(),
            bus.clone(),
        );
        let watchers = OutboxWatchers::new(store.clone(), router.clone(), counter.clone(), bus.clone());
        let runtime = runtime::backend_for(&config.container_backend, config.runtime_deadline)
            .context("select container backend")?;
        let supervisor = Supervisor::new(
            config.clone(),
            store.clone(),
            registry.clone(),
            topology.clone(),
            runtime,
            watchers.clone(),
            counter.clone(),
            bus.clone(),
        );

        Ok(Arc::new(AppContext {
            config,
            store,
            human,
            bus,
            registry,
            topology,
            counter,
            router,
            watchers,
            supervisor,
            started_at: std::time::Instant::now(),
        }))
    }

    /// Propagate a registry mutation: rebuild the topology snapshot,
    /// provision mailbox queues, rewrite agent hierarchy files, and resync
    /// queue counts. In-flight routes keep the snapshot they entered with.
    pub async fn apply_topology(&self) {
        let cfg = self.registry.snapshot();
        self.topology.install(Topology::from_config(&cfg));

        for mailbox in &cfg.mailboxes {
            if let Err(e) = self.store.ensure_mailbox_dirs(&mailbox.id).await {
                tracing::warn!(mailbox = %mailbox.id, err = %e, "mailbox provisioning failed");
            }
        }
        self.supervisor.refresh_hierarchies().await;

        let mut nodes: Vec<String> = cfg.bees.iter().map(|b| b.id.clone()).collect();
        nodes.extend(cfg.mailboxes.iter().map(|m| format!("mailbox:{}", m.id)));
        self.counter.resync(&nodes).await;
    }

    /// Startup sequence: propagate the loaded topology, re-route anything
    /// left in the inflight spool from a previous run, then start the
    /// queue-count observer. Runs before the gateway accepts requests and
    /// before any outbox watcher starts, so recovered mail keeps its order.
    pub async fn start_background(&self, shutdown: watch::Receiver<bool>) {
        self.apply_topology().await;
        let recovered = self.router.recover_inflight().await;
        if recovered > 0 {
            tracing::info!(recovered, "inflight spool recovery complete");
        }
        let _ = self.counter.spawn(shutdown);
    }

    /// Cooperative shutdown of everything owning OS resources.
    pub async fn shutdown(&self) {
        self.watchers.stop_all().await;
    }
}
