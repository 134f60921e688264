// SPDX-License-Identifier: MIT
//! Outbox watchers — one long-running task per running agent.
//!
//! notify callbacks run on a notify-internal thread and are forwarded to a
//! tokio mpsc channel; the task treats them purely as wake signals and
//! drains the whole outbox in sorted order on every wake. The first drain
//! happens before the first wait, so files written while no watcher was
//! running are still picked up. A poll-interval fallback rescans even when
//! the platform watcher goes quiet.
//!
//! Per file: parse (with a short retry for freshly renamed files), then
//! rename into the router's `inflight/` spool — the rename atomically
//! removes the file from the logical outbox — and hand it to the router.
//! Files that never parse are quarantined in `outbox/poison/`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use notify::{Config, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};

use crate::error::HiveError;
use crate::events::{Event, EventBus};
use crate::mail::counter::InboxCounter;
use crate::mail::model::Mail;
use crate::mail::router::Router;
use crate::mail::store::MailStore;

/// Fallback rescan cadence when no filesystem events arrive.
const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Attempts to parse a file that may still be settling after rename.
const READ_ATTEMPTS: u32 = 3;

struct WatcherHandle {
    shutdown: watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
}

pub struct OutboxWatchers {
    store: Arc<MailStore>,
    router: Arc<Router>,
    counter: Arc<InboxCounter>,
    bus: EventBus,
    handles: Mutex<HashMap<String, WatcherHandle>>,
}

impl OutboxWatchers {
    pub fn new(
        store: Arc<MailStore>,
        router: Arc<Router>,
        counter: Arc<InboxCounter>,
        bus: EventBus,
    ) -> Arc<OutboxWatchers> {
        Arc::new(OutboxWatchers {
            store,
            router,
            counter,
            bus,
            handles: Mutex::new(HashMap::new()),
        })
    }

    /// Start watching an agent's outbox. Idempotent — an existing watcher
    /// for the same agent is stopped and replaced.
    pub async fn watch(self: &Arc<Self>, agent_id: &str) -> Result<(), HiveError> {
        let outbox = self.store.agent_outbox(agent_id);
        tokio::fs::create_dir_all(&outbox).await?;

        let (event_tx, event_rx) = mpsc::channel::<notify::Result<notify::Event>>(64);
        let mut fs_watcher = RecommendedWatcher::new(
            move |res| {
                let _ = event_tx.blocking_send(res);
            },
            Config::default().with_poll_interval(POLL_INTERVAL),
        )
        .map_err(|e| HiveError::Io(std::io::Error::other(e)))?;
        fs_watcher
            .watch(&outbox, RecursiveMode::NonRecursive)
            .map_err(|e| HiveError::Io(std::io::Error::other(e)))?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run_watch_loop(
            Arc::clone(self),
            agent_id.to_string(),
            fs_watcher,
            event_rx,
            shutdown_rx,
        ));

        let previous = {
            let mut handles = self.handles.lock().await;
            handles.insert(
                agent_id.to_string(),
                WatcherHandle {
                    shutdown: shutdown_tx,
                    task,
                },
            )
        };
        if let Some(previous) = previous {
            stop_handle(previous).await;
        }
        info!(agent = agent_id, "outbox watcher started");
        Ok(())
    }

    /// Stop the watcher for one agent, releasing its OS watches. No-op when
    /// none is running.
    pub async fn unwatch(&self, agent_id: &str) {
        let handle = self.handles.lock().await.remove(agent_id);
        if let Some(handle) = handle {
            stop_handle(handle).await;
            info!(agent = agent_id, "outbox watcher stopped");
        }
    }

    pub async fn is_watching(&self, agent_id: &str) -> bool {
        self.handles.lock().await.contains_key(agent_id)
    }

    pub async fn stop_all(&self) {
        let handles: Vec<WatcherHandle> = {
            let mut map = self.handles.lock().await;
            map.drain().map(|(_, h)| h).collect()
        };
        for handle in handles {
            stop_handle(handle).await;
        }
    }

    /// One full pass over the agent's outbox, oldest file first. Each file
    /// is spooled and routed to completion before the next is touched,
    /// which is what preserves FIFO order per source.
    pub async fn drain(&self, agent_id: &str) {
        let outbox = self.store.agent_outbox(agent_id);
        let files = match self.store.list_mail_files(&outbox).await {
            Ok(files) => files,
            Err(e) => {
                warn!(agent = agent_id, err = %e, "could not list outbox");
                return;
            }
        };
        for path in files {
            let mail = match self.read_with_retry(&path).await {
                Ok(mail) => mail,
                Err(ReadFailure::Gone) => continue,
                Err(ReadFailure::Corrupt(reason)) => {
                    warn!(agent = agent_id, path = %path.display(), %reason, "poisoning outbox file");
                    if let Err(e) = self.store.quarantine(&path, &reason).await {
                        warn!(path = %path.display(), err = %e, "quarantine failed");
                        continue;
                    }
                    self.bus.publish(Event::MailFailed {
                        mail_id: None,
                        node: agent_id.to_string(),
                        kind: "ErrMailCorrupt",
                        reason,
                    });
                    self.counter.recount_node(agent_id).await;
                    continue;
                }
            };

            // Atomic handoff: the rename removes the file from the logical
            // outbox and makes the spool copy the single live instance.
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| mail.file_name());
            let spooled = self.store.inflight_dir().join(&name);
            match tokio::fs::rename(&path, &spooled).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    warn!(path = %path.display(), err = %e, "could not spool outbox file");
                    continue;
                }
            }

            self.bus.publish(Event::MailSent(mail));
            self.router.route_spooled(&spooled).await;
            self.counter.recount_node(agent_id).await;
        }
    }

    async fn read_with_retry(&self, path: &std::path::Path) -> Result<Mail, ReadFailure> {
        let mut last = String::new();
        for attempt in 0..READ_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            match self.store.read_mail(path).await {
                Ok(mail) => return Ok(mail),
                Err(e) => last = e.to_string(),
            }
            if tokio::fs::metadata(path).await.is_err() {
                // Unlinked between listing and read — someone else took it.
                return Err(ReadFailure::Gone);
            }
        }
        Err(ReadFailure::Corrupt(last))
    }
}

enum ReadFailure {
    Gone,
    Corrupt(String),
}

async fn run_watch_loop(
    watchers: Arc<OutboxWatchers>,
    agent_id: String,
    fs_watcher: RecommendedWatcher,
    mut events: mpsc::Receiver<notify::Result<notify::Event>>,
    mut shutdown: watch::Receiver<bool>,
) {
    // Dropping the watcher releases the OS watch; keep it alive in the task.
    let _fs_watcher = fs_watcher;
    loop {
        watchers.drain(&agent_id).await;
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    debug!(agent = %agent_id, "outbox watch loop stopping");
                    break;
                }
            }
            event = events.recv() => {
                match event {
                    Some(Ok(_)) => {}
                    Some(Err(e)) => warn!(agent = %agent_id, err = %e, "outbox watcher error"),
                    None => break,
                }
            }
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
        }
    }
}

async fn stop_handle(handle: WatcherHandle) {
    let _ = handle.shutdown.send(true);
    if tokio::time::timeout(Duration::from_secs(1), handle.task)
        .await
        .is_err()
    {
        warn!("outbox watcher did not stop within 1s");
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
