// SPDX-License-Identifier: MIT
//! Inbox counter — real-time queue-depth snapshots for every node.
//!
//! Counts are updated two ways: the router and outbox watchers recount a
//! node after every file move they perform, and a filesystem watcher over
//! `agents/` and `mailboxes/` catches moves the orchestrator did not make
//! (an agent consuming from its own inbox inside the container). Either
//! path converges on a directory recount, so bursts and duplicate events
//! are harmless. A single coalescer tick emits `mail:counts` at most every
//! [`COALESCE_INTERVAL`] and only when something changed.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Component, Path};
use std::sync::Arc;
use std::time::Duration;

use notify::{Config, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Serialize;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, warn};

use crate::events::{Event, EventBus};
use crate::mail::human::HumanStore;
use crate::mail::model::{HUMAN_NODE, MAILBOX_PREFIX};
use crate::mail::store::{MailStore, POISON_DIR};

/// Minimum spacing between `mail:counts` emissions.
pub const COALESCE_INTERVAL: Duration = Duration::from_millis(300);

/// Queue snapshot for one node. `processing` means the node is a running
/// agent with a non-empty inbox.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct NodeCounts {
    pub inbox: usize,
    pub outbox: usize,
    pub processing: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueueSide {
    Inbox,
    Outbox,
}

#[derive(Default)]
struct CounterInner {
    /// nodeId → (inbox, outbox).
    counts: BTreeMap<String, (usize, usize)>,
    running: BTreeSet<String>,
    dirty: bool,
}

pub struct InboxCounter {
    store: Arc<MailStore>,
    human: Arc<HumanStore>,
    bus: EventBus,
    inner: Mutex<CounterInner>,
}

impl InboxCounter {
    pub fn new(store: Arc<MailStore>, human: Arc<HumanStore>, bus: EventBus) -> Arc<InboxCounter> {
        Arc::new(InboxCounter {
            store,
            human,
            bus,
            inner: Mutex::new(CounterInner::default()),
        })
    }

    /// Ensure a node appears in snapshots even with empty queues.
    pub async fn track_node(&self, node: &str) {
        let mut inner = self.inner.lock().await;
        if !inner.counts.contains_key(node) {
            inner.counts.insert(node.to_string(), (0, 0));
            inner.dirty = true;
        }
    }

    pub async fn forget(&self, node: &str) {
        let mut inner = self.inner.lock().await;
        if inner.counts.remove(node).is_some() {
            inner.dirty = true;
        }
        inner.running.remove(node);
    }

    pub async fn set_running(&self, node: &str, running: bool) {
        let mut inner = self.inner.lock().await;
        let changed = if running {
            inner.running.insert(node.to_string())
        } else {
            inner.running.remove(node)
        };
        if changed {
            inner.dirty = true;
        }
    }

    /// Mark the snapshot stale without touching directory counts (used when
    /// the human array store changed).
    pub async fn touch(&self) {
        self.inner.lock().await.dirty = true;
    }

    /// Recount both queues of one node from the filesystem.
    pub async fn recount_node(&self, node: &str) {
        if node == HUMAN_NODE {
            self.touch().await;
            return;
        }
        let (inbox_dir, outbox_dir) = match node.strip_prefix(MAILBOX_PREFIX) {
            Some(name) => (self.store.mailbox_inbox(name), self.store.mailbox_outbox(name)),
            None => (self.store.agent_inbox(node), self.store.agent_outbox(node)),
        };
        let inbox = self.store.count_mail_files(&inbox_dir).await;
        let outbox = self.store.count_mail_files(&outbox_dir).await;

        let mut inner = self.inner.lock().await;
        let entry = inner.counts.entry(node.to_string()).or_default();
        if *entry != (inbox, outbox) {
            *entry = (inbox, outbox);
            inner.dirty = true;
        }
    }

    /// Recount every known node and drop entries for nodes no longer in the
    /// swarm. Called at startup and after registry mutations.
    pub async fn resync(&self, nodes: &[String]) {
        {
            let keep: BTreeSet<&String> = nodes.iter().collect();
            let mut inner = self.inner.lock().await;
            let stale: Vec<String> = inner
                .counts
                .keys()
                .filter(|n| !keep.contains(n))
                .cloned()
                .collect();
            for node in stale {
                inner.counts.remove(&node);
                inner.running.remove(&node);
                inner.dirty = true;
            }
        }
        for node in nodes {
            self.recount_node(node).await;
            self.track_node(node).await;
        }
    }

    /// Current snapshot, human node included.
    pub async fn snapshot(&self) -> BTreeMap<String, NodeCounts> {
        let (human_in, human_out) = self.human.depths().await;
        let inner = self.inner.lock().await;
        let mut out: BTreeMap<String, NodeCounts> = inner
            .counts
            .iter()
            .map(|(node, (inbox, outbox))| {
                (
                    node.clone(),
                    NodeCounts {
                        inbox: *inbox,
                        outbox: *outbox,
                        processing: *inbox > 0 && inner.running.contains(node),
                    },
                )
            })
            .collect();
        out.insert(
            HUMAN_NODE.to_string(),
            NodeCounts {
                inbox: human_in,
                outbox: human_out,
                processing: false,
            },
        );
        out
    }

    /// Emit `mail:counts` if anything changed since the last emission.
    pub async fn flush(&self) {
        let was_dirty = {
            let mut inner = self.inner.lock().await;
            std::mem::replace(&mut inner.dirty, false)
        };
        if was_dirty {
            let snapshot = self.snapshot().await;
            self.bus.publish(Event::MailCounts(snapshot));
        }
    }

    /// Spawn the filesystem observer + coalescer task. Returns once the
    /// task is running; the task exits within one tick of `shutdown`.
    pub fn spawn(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        let counter = Arc::clone(self);
        let (tx, mut rx) = mpsc::channel::<notify::Result<notify::Event>>(64);

        // notify callbacks run on a notify-internal thread; forward to the
        // async executor through the channel.
        let watcher = RecommendedWatcher::new(
            move |res| {
                let _ = tx.blocking_send(res);
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        );

        tokio::spawn(async move {
            let mut watcher = match watcher {
                Ok(w) => w,
                Err(e) => {
                    warn!(err = %e, "queue-count watcher could not be created");
                    return;
                }
            };
            for dir in [counter.store.agents_dir(), counter.store.mailboxes_dir()] {
                if let Err(e) = std::fs::create_dir_all(&dir) {
                    warn!(path = %dir.display(), err = %e, "could not create watch root");
                    continue;
                }
                if let Err(e) = watcher.watch(&dir, RecursiveMode::Recursive) {
                    warn!(path = %dir.display(), err = %e, "could not watch queue root");
                }
            }

            let mut tick = tokio::time::interval(COALESCE_INTERVAL);
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            debug!("queue-count watcher stopping");
                            break;
                        }
                    }
                    _ = tick.tick() => {
                        counter.flush().await;
                    }
                    event = rx.recv() => {
                        match event {
                            Some(Ok(event)) => {
                                let mut touched: BTreeSet<String> = BTreeSet::new();
                                for path in &event.paths {
                                    if let Some((node, _side)) =
                                        classify(counter.store.root(), path)
                                    {
                                        touched.insert(node);
                                    }
                                }
                                for node in touched {
                                    counter.recount_node(&node).await;
                                }
                            }
                            Some(Err(e)) => warn!(err = %e, "queue-count watcher error"),
                            None => break,
                        }
                    }
                }
            }
        })
    }
}

/// Map a filesystem path to the queue it belongs to:
/// `agents/<id>/inbox/x.json` → (`<id>`, Inbox),
/// `mailboxes/<name>/outbox/x.json` → (`mailbox:<name>`, Outbox).
/// Poison subdirectories and non-mail files do not count.
fn classify(root: &Path, path: &Path) -> Option<(String, QueueSide)> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<&str> = rel
        .components()
        .filter_map(|c| match c {
            Component::Normal(s) => s.to_str(),
            _ => None,
        })
        .collect();
    if parts.len() != 4 {
        return None;
    }
    let file = parts[3];
    if !file.ends_with(".json") || parts[2] == POISON_DIR {
        return None;
    }
    let side = match parts[2] {
        "inbox" => QueueSide::Inbox,
        "outbox" => QueueSide::Outbox,
        _ => return None,
    };
    match parts[0] {
        "agents" => Some((parts[1].to_string(), side)),
        "mailboxes" => Some((format!("{MAILBOX_PREFIX}{}", parts[1]), side)),
        _ => None,
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mail::model::{Mail, MailType};

    fn fixture() -> (Arc<InboxCounter>, Arc<MailStore>, EventBus, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(MailStore::new(dir.path()));
        let human = Arc::new(HumanStore::new(dir.path().join("human")));
        let bus = EventBus::new();
        let counter = InboxCounter::new(store.clone(), human, bus.clone());
        (counter, store, bus, dir)
    }

    #[tokio::test]
    async fn recount_matches_directory_contents() {
        let (counter, store, _bus, _dir) = fixture();
        store.ensure_agent_dirs("b1").await.unwrap();
        for _ in 0..2 {
            let mail = Mail::new("x", "b1", "s", "b", MailType::Agent);
            store.write_mail(&store.agent_inbox("b1"), &mail).await.unwrap();
        }
        store
            .write_mail(
                &store.agent_outbox("b1"),
                &Mail::new("b1", "x", "s", "b", MailType::Agent),
            )
            .await
            .unwrap();

        counter.recount_node("b1").await;
        let snapshot = counter.snapshot().await;
        let counts = snapshot.get("b1").unwrap();
        assert_eq!(counts.inbox, 2);
        assert_eq!(counts.outbox, 1);
        assert!(!counts.processing);
    }

    #[tokio::test]
    async fn processing_requires_running_and_backlog() {
        let (counter, store, _bus, _dir) = fixture();
        store.ensure_agent_dirs("b1").await.unwrap();
        store
            .write_mail(
                &store.agent_inbox("b1"),
                &Mail::new("x", "b1", "s", "b", MailType::Agent),
            )
            .await
            .unwrap();
        counter.recount_node("b1").await;

        assert!(!counter.snapshot().await["b1"].processing);
        counter.set_running("b1", true).await;
        assert!(counter.snapshot().await["b1"].processing);

        // Draining the inbox clears processing even while running.
        let files = store.list_mail_files(&store.agent_inbox("b1")).await.unwrap();
        tokio::fs::remove_file(&files[0]).await.unwrap();
        counter.recount_node("b1").await;
        assert!(!counter.snapshot().await["b1"].processing);
    }

    #[tokio::test]
    async fn flush_emits_only_when_dirty() {
        let (counter, _store, bus, _dir) = fixture();
        let mut rx = bus.subscribe();

        counter.track_node("b1").await;
        counter.flush().await;
        match rx.recv().await.unwrap() {
            Event::MailCounts(counts) => assert!(counts.contains_key("b1")),
            other => panic!("expected counts, got {}", other.method()),
        }

        // Nothing changed — a second flush emits nothing.
        counter.flush().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn resync_drops_stale_nodes() {
        let (counter, _store, _bus, _dir) = fixture();
        counter.track_node("gone").await;
        counter.resync(&["b1".to_string()]).await;
        let snapshot = counter.snapshot().await;
        assert!(snapshot.contains_key("b1"));
        assert!(!snapshot.contains_key("gone"));
        // The human node is always present.
        assert!(snapshot.contains_key("human"));
    }

    #[test]
    fn classify_maps_queue_paths() {
        let root = Path::new("/data");
        assert_eq!(
            classify(root, Path::new("/data/agents/b1/inbox/1-x.json")),
            Some(("b1".to_string(), QueueSide::Inbox))
        );
        assert_eq!(
            classify(root, Path::new("/data/mailboxes/reports/outbox/1-x.json")),
            Some(("mailbox:reports".to_string(), QueueSide::Outbox))
        );
        // Poison, temp files, and non-queue paths are ignored.
        assert_eq!(classify(root, Path::new("/data/agents/b1/inbox/poison/1-x.json")), None);
        assert_eq!(classify(root, Path::new("/data/agents/b1/inbox/.x.tmp")), None);
        assert_eq!(classify(root, Path::new("/data/agents/b1/state/hierarchy.json")), None);
        assert_eq!(classify(root, Path::new("/elsewhere/agents/b1/inbox/1-x.json")), None);
    }
}
