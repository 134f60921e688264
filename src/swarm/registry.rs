// SPDX-License-Identifier: MIT
//! Swarm registry — the persisted `swarm.json` behind every graph mutation.
//!
//! All writes pass through a single-writer lock; readers take cheap
//! copy-on-read snapshots. Every successful mutation is validated first,
//! persisted via tmp-write + fsync + rename, then announced with
//! `swarm:updated`.

use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use tokio::io::AsyncWriteExt;
use tracing::info;

use crate::error::HiveError;
use crate::events::{Event, EventBus};
use crate::swarm::model::{Bee, Connection, MailboxDef, SwarmConfig};

pub struct SwarmRegistry {
    path: PathBuf,
    bus: EventBus,
    current: RwLock<Arc<SwarmConfig>>,
    // Serializes the whole mutate→persist→swap cycle.
    writer: tokio::sync::Mutex<()>,
}

impl SwarmRegistry {
    /// Load `swarm.json`, or create a fresh empty swarm when none exists.
    pub async fn load(path: PathBuf, bus: EventBus) -> Result<SwarmRegistry, HiveError> {
        let cfg = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let mut cfg: SwarmConfig = serde_json::from_slice(&bytes).map_err(|e| {
                    HiveError::Validation(format!("unreadable {}: {e}", path.display()))
                })?;
                cfg.normalize();
                cfg.validate()?;
                cfg
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let cfg = SwarmConfig::empty(uuid::Uuid::new_v4().to_string(), "hive");
                persist(&path, &cfg).await?;
                info!(path = %path.display(), "created empty swarm registry");
                cfg
            }
            Err(e) => return Err(e.into()),
        };
        Ok(SwarmRegistry {
            path,
            bus,
            current: RwLock::new(Arc::new(cfg)),
            writer: tokio::sync::Mutex::new(()),
        })
    }

    /// Consistent copy-on-read snapshot.
    pub fn snapshot(&self) -> Arc<SwarmConfig> {
        self.current.read().expect("registry lock poisoned").clone()
    }

    /// Replace the whole configuration (swarm.put).
    pub async fn put(&self, mut cfg: SwarmConfig) -> Result<Arc<SwarmConfig>, HiveError> {
        cfg.normalize();
        cfg.validate()?;
        let _writer = self.writer.lock().await;
        persist(&self.path, &cfg).await?;
        let snapshot = Arc::new(cfg);
        *self.current.write().expect("registry lock poisoned") = snapshot.clone();
        self.bus.publish(Event::SwarmUpdated);
        Ok(snapshot)
    }

    /// Apply one mutation under the writer lock. The closure edits a copy;
    /// normalization, validation and persistence happen before the swap, so
    /// a failed mutation leaves both memory and disk untouched.
    pub async fn mutate<F>(&self, mutation: F) -> Result<Arc<SwarmConfig>, HiveError>
    where
        F: FnOnce(&mut SwarmConfig) -> Result<(), HiveError>,
    {
        let _writer = self.writer.lock().await;
        let mut cfg = (*self.snapshot()).clone();
        mutation(&mut cfg)?;
        cfg.normalize();
        cfg.validate()?;
        persist(&self.path, &cfg).await?;
        let snapshot = Arc::new(cfg);
        *self.current.write().expect("registry lock poisoned") = snapshot.clone();
        self.bus.publish(Event::SwarmUpdated);
        Ok(snapshot)
    }

    // ── Node mutations ───────────────────────────────────────────────────────

    /// Add a bee; with `auto_connect_human` both directed human edges are
    /// seeded in the same mutation.
    pub async fn add_bee(
        &self,
        bee: Bee,
        auto_connect_human: bool,
    ) -> Result<Arc<SwarmConfig>, HiveError> {
        self.mutate(|cfg| {
            if cfg.bee(&bee.id).is_some() {
                return Err(HiveError::AlreadyExists(bee.id.clone()));
            }
            if auto_connect_human {
                cfg.connections.push(Connection::directed("human", &bee.id));
                cfg.connections.push(Connection::directed(&bee.id, "human"));
            }
            cfg.bees.push(bee);
            Ok(())
        })
        .await
    }

    /// Remove a bee and every connection touching it.
    pub async fn remove_bee(&self, id: &str) -> Result<Arc<SwarmConfig>, HiveError> {
        let id = id.to_string();
        self.mutate(move |cfg| {
            let before = cfg.bees.len();
            cfg.bees.retain(|b| b.id != id);
            if cfg.bees.len() == before {
                return Err(HiveError::NotFound(id.clone()));
            }
            cfg.connections.retain(|c| c.from != id && c.to != id);
            Ok(())
        })
        .await
    }

    pub async fn add_mailbox(&self, mailbox: MailboxDef) -> Result<Arc<SwarmConfig>, HiveError> {
        self.mutate(|cfg| {
            if cfg.mailbox(&mailbox.id).is_some() {
                return Err(HiveError::AlreadyExists(mailbox.id.clone()));
            }
            cfg.mailboxes.push(mailbox);
            Ok(())
        })
        .await
    }

    // ── Connection mutations ─────────────────────────────────────────────────

    /// Insert a directed edge (both directions when `bidirectional`).
    /// Idempotent: normalization collapses duplicates.
    pub async fn add_connection(
        &self,
        from: &str,
        to: &str,
        bidirectional: bool,
    ) -> Result<Arc<SwarmConfig>, HiveError> {
        let (from, to) = (from.to_string(), to.to_string());
        self.mutate(move |cfg| {
            cfg.connections.push(Connection {
                from,
                to,
                bidirectional,
            });
            Ok(())
        })
        .await
    }

    /// Remove a directed edge (both directions when `bidirectional`).
    pub async fn remove_connection(
        &self,
        from: &str,
        to: &str,
        bidirectional: bool,
    ) -> Result<Arc<SwarmConfig>, HiveError> {
        let (from, to) = (from.to_string(), to.to_string());
        self.mutate(move |cfg| {
            cfg.connections.retain(|c| {
                let forward = c.from == from && c.to == to;
                let reverse = bidirectional && c.from == to && c.to == from;
                !forward && !reverse
            });
            Ok(())
        })
        .await
    }

    /// `true` adds the reverse edge, `false` removes it — the forward edge
    /// is untouched either way.
    pub async fn set_bidirectional(
        &self,
        from: &str,
        to: &str,
        bidirectional: bool,
    ) -> Result<Arc<SwarmConfig>, HiveError> {
        if bidirectional {
            self.add_connection(to, from, false).await
        } else {
            self.remove_connection(to, from, false).await
        }
    }
}

/// Atomic persist: temporary sibling, flush to disk, rename into place.
async fn persist(path: &PathBuf, cfg: &SwarmConfig) -> Result<(), HiveError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let bytes = serde_json::to_vec_pretty(cfg)
        .map_err(|e| HiveError::Validation(format!("encode swarm config: {e}")))?;
    let tmp = path.with_extension("json.tmp");
    let mut file = tokio::fs::File::create(&tmp).await?;
    file.write_all(&bytes).await?;
    file.sync_all().await?;
    drop(file);
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

// ─── Tests ────────────────────────────────────────────────────────────────────
