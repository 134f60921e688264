// SPDX-License-Identifier: MIT
//! Mail router — the only component that consults the topology.
//!
//! Every mail enters through the orchestrator-owned `inflight/` spool: the
//! gateway writes sends there directly, outbox watchers rename agent mail
//! in. Delivery then moves the spooled file into the recipient's queue (or
//! the human array store) and unlinks the spool copy last, so a crash at
//! any point leaves the mail recoverable from exactly one place. On
//! restart [`Router::recover_inflight`] re-routes whatever the spool still
//! holds, re-evaluated against the current topology.
//!
//! The router never raises to its caller: rejections become bounces,
//! undeliverable bounces go to `deadletter/`, everything is surfaced as
//! events.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::events::{Event, EventBus};
use crate::mail::counter::InboxCounter;
use crate::mail::human::HumanStore;
use crate::mail::model::{Mail, MailStatus};
use crate::mail::store::MailStore;
use crate::retry::retry_with_schedule;
use crate::topology::TopologyHandle;

/// Delays between inbox-write attempts (one initial try plus one retry per
/// entry).
pub const ROUTE_RETRY_DELAYS: [Duration; 3] = [
    Duration::from_millis(100),
    Duration::from_millis(500),
    Duration::from_secs(2),
];

/// Terminal result of one route. Informational only — failures have already
/// been converted into bounces, dead letters, and events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    Delivered,
    Bounced,
    Failed,
    DeadLettered,
}

impl RouteOutcome {
    /// The status an archived copy of the routed mail should carry.
    pub fn status(self) -> MailStatus {
        match self {
            RouteOutcome::Delivered => MailStatus::Delivered,
            RouteOutcome::Bounced => MailStatus::Bounced,
            RouteOutcome::Failed | RouteOutcome::DeadLettered => MailStatus::Failed,
        }
    }
}

pub struct Router {
    store: Arc<MailStore>,
    human: Arc<HumanStore>,
    topology: Arc<TopologyHandle>,
    counter: Arc<InboxCounter>,
    bus: EventBus,
}

impl Router {
    pub fn new(
        store: Arc<MailStore>,
        human: Arc<HumanStore>,
        topology: Arc<TopologyHandle>,
        counter: Arc<InboxCounter>,
        bus: EventBus,
    ) -> Arc<Router> {
        Arc::new(Router {
            store,
            human,
            topology,
            counter,
            bus,
        })
    }

    /// Synchronous admission probe for gateway sends. The router is the
    /// only component that consults the topology; callers wanting an
    /// up-front rejection ask here instead of reading the graph themselves.
    pub fn can_route(&self, from: &str, to: &str) -> bool {
        self.topology.snapshot().can_send(from, to)
    }

    /// Route a mail that is not yet on disk: spool it, then deliver.
    pub async fn submit(&self, mail: Mail) -> RouteOutcome {
        let name = mail.file_name();
        match self
            .store
            .write_mail_named(&self.store.inflight_dir(), &name, &mail)
            .await
        {
            Ok(path) => self.route_spooled(&path).await,
            Err(e) => {
                warn!(mail_id = %mail.id, err = %e, "could not spool mail");
                self.bus.publish(Event::MailFailed {
                    mail_id: Some(mail.id.clone()),
                    node: mail.to.clone(),
                    kind: "ErrIO",
                    reason: format!("could not spool mail: {e}"),
                });
                RouteOutcome::Failed
            }
        }
    }

    /// Route a mail already sitting in the inflight spool. The spool file is
    /// unlinked only after delivery has run to completion.
    pub async fn route_spooled(&self, path: &Path) -> RouteOutcome {
        let mail = match self.store.read_mail(path).await {
            Ok(mail) => mail,
            Err(e) => {
                // A spool file the router itself cannot parse has no sender
                // to bounce to — it goes straight to the dead-letter store.
                warn!(path = %path.display(), err = %e, "corrupt spool file");
                self.move_to_deadletter(path).await;
                self.bus.publish(Event::MailFailed {
                    mail_id: None,
                    node: String::new(),
                    kind: "ErrMailCorrupt",
                    reason: e.to_string(),
                });
                return RouteOutcome::DeadLettered;
            }
        };

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| mail.file_name());
        let outcome = self.deliver(mail, &name, false).await;

        if let Err(e) = tokio::fs::remove_file(path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %path.display(), err = %e, "could not unlink spool file");
            }
        }
        outcome
    }

    /// Crash recovery: re-route every mail left in the spool, oldest first.
    /// Must run before watchers start so recovered mail keeps FIFO order.
    pub async fn recover_inflight(&self) -> usize {
        let files = match self.store.list_mail_files(&self.store.inflight_dir()).await {
            Ok(files) => files,
            Err(e) => {
                warn!(err = %e, "could not scan inflight spool");
                return 0;
            }
        };
        let count = files.len();
        if count > 0 {
            info!(count, "re-routing mail recovered from the inflight spool");
        }
        for path in files {
            self.route_spooled(&path).await;
        }
        count
    }

    // ── Delivery ─────────────────────────────────────────────────────────────

    async fn deliver(&self, mut mail: Mail, name: &str, bounce_hop: bool) -> RouteOutcome {
        // The bounce hop is exempt from the topology check: its sender is
        // the orchestrator itself ("system"), which owns no graph edges. A
        // bounce can therefore only fail on I/O, and then it dead-letters.
        if !bounce_hop {
            // One snapshot per route; concurrent mutations do not tear the view.
            let topology = self.topology.snapshot();
            if !topology.can_send(&mail.from, &mail.to) {
                let reason = format!("no route from {} to {}", mail.from, mail.to);
                return self.reject(mail, &reason).await;
            }
        }

        match self.store.inbox_dir(&mail.to) {
            // Human inbox is the array store, not a queue directory.
            None => {
                mail.status = MailStatus::Delivered;
                match self.human.append_inbox(mail.clone()).await {
                    Ok(()) => {
                        self.counter.touch().await;
                        self.bus.publish(Event::MailReceived(mail));
                        RouteOutcome::Delivered
                    }
                    Err(e) => {
                        let reason = format!("human inbox append failed: {e}");
                        self.fail(mail, &reason, bounce_hop).await
                    }
                }
            }
            Some(inbox) => {
                mail.status = MailStatus::Delivered;
                if let Err(e) = tokio::fs::create_dir_all(&inbox).await {
                    let reason = format!("inbox unavailable: {e}");
                    return self.fail(mail, &reason, bounce_hop).await;
                }
                let written = retry_with_schedule(&ROUTE_RETRY_DELAYS, || {
                    self.store.write_mail_named(&inbox, name, &mail)
                })
                .await;
                match written {
                    Ok(_) => {
                        self.counter.recount_node(&mail.to).await;
                        self.bus.publish(Event::MailRouted(mail));
                        RouteOutcome::Delivered
                    }
                    Err(e) => {
                        let reason = format!(
                            "delivery failed after {} attempts: {e}",
                            ROUTE_RETRY_DELAYS.len() + 1
                        );
                        self.fail(mail, &reason, bounce_hop).await
                    }
                }
            }
        }
    }

    /// Topology rejected the mail. Produce a bounce and route it one-shot;
    /// a bounce that cannot be delivered is dead-lettered, never re-bounced.
    async fn reject(&self, mail: Mail, reason: &str) -> RouteOutcome {
        info!(mail_id = %mail.id, from = %mail.from, to = %mail.to, reason, "mail bounced");
        let bounce = Mail::bounce_for(&mail, reason);
        self.bus.publish(Event::MailBounced(bounce.clone()));
        let name = bounce.file_name();
        Box::pin(self.deliver(bounce, &name, true)).await;
        RouteOutcome::Bounced
    }

    /// Delivery failed for non-topology reasons. Emit `mail:failed` and send
    /// the sender a failure bounce with a distinct reason.
    async fn fail(&self, mail: Mail, reason: &str, bounce_hop: bool) -> RouteOutcome {
        self.bus.publish(Event::MailFailed {
            mail_id: Some(mail.id.clone()),
            node: mail.to.clone(),
            kind: "ErrIO",
            reason: reason.to_string(),
        });
        if bounce_hop {
            self.dead_letter(&mail, reason).await;
            return RouteOutcome::DeadLettered;
        }
        let bounce = Mail::bounce_for(&mail, reason);
        let name = bounce.file_name();
        Box::pin(self.deliver(bounce, &name, true)).await;
        RouteOutcome::Failed
    }

    // ── Dead-letter store ────────────────────────────────────────────────────

    async fn dead_letter(&self, mail: &Mail, reason: &str) {
        warn!(mail_id = %mail.id, to = %mail.to, reason, "mail dead-lettered");
        let dir = self.store.deadletter_dir();
        if let Err(e) = tokio::fs::create_dir_all(&dir).await {
            warn!(err = %e, "could not create deadletter directory");
            return;
        }
        if let Err(e) = self.store.write_mail(&dir, mail).await {
            warn!(mail_id = %mail.id, err = %e, "could not persist dead letter");
        }
    }

    async fn move_to_deadletter(&self, path: &Path) {
        let dir = self.store.deadletter_dir();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("{}.json", uuid::Uuid::new_v4()));
        if let Err(e) = tokio::fs::create_dir_all(&dir).await {
            warn!(err = %e, "could not create deadletter directory");
            return;
        }
        if let Err(e) = tokio::fs::rename(path, dir.join(&name)).await {
            warn!(path = %path.display(), err = %e, "could not move corrupt spool file");
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mail::model::MailType;
    use crate::swarm::model::{Bee, Connection, SwarmConfig};
    use crate::topology::Topology;

    struct Fixture {
        router: Arc<Router>,
        store: Arc<MailStore>,
        human: Arc<HumanStore>,
        bus: EventBus,
        _dir: tempfile::TempDir,
    }

    async fn fixture(edges: &[(&str, &str)]) -> Fixture {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(MailStore::new(dir.path()));
        store.ensure_layout().await.unwrap();
        for bee in ["b1", "b2"] {
            store.ensure_agent_dirs(bee).await.unwrap();
        }
        let human = Arc::new(HumanStore::new(store.human_dir()));
        let bus = EventBus::new();
        let counter = InboxCounter::new(store.clone(), human.clone(), bus.clone());

        let cfg = SwarmConfig {
            id: "s".into(),
            name: "s".into(),
            bees: ["b1", "b2"]
                .iter()
                .map(|id| Bee {
                    id: id.to_string(),
                    name: id.to_string(),
                    model: None,
                    soul: None,
                })
                .collect(),
            mailboxes: vec![],
            connections: edges
                .iter()
                .map(|(f, t)| Connection::directed(*f, *t))
                .collect(),
        };
        let topology = Arc::new(TopologyHandle::new(Topology::from_config(&cfg)));
        let router = Router::new(store.clone(), human.clone(), topology, counter, bus.clone());
        Fixture {
            router,
            store,
            human,
            bus,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn routes_to_agent_inbox_and_clears_spool() {
        let f = fixture(&[("b1", "b2")]).await;
        let mail = Mail::new("b1", "b2", "s", "b", MailType::Agent);
        let outcome = f.router.submit(mail.clone()).await;

        assert_eq!(outcome, RouteOutcome::Delivered);
        let inbox = f.store.list_mail_files(&f.store.agent_inbox("b2")).await.unwrap();
        assert_eq!(inbox.len(), 1);
        let delivered = f.store.read_mail(&inbox[0]).await.unwrap();
        assert_eq!(delivered.id, mail.id);
        assert_eq!(delivered.status, MailStatus::Delivered);
        // Spool is empty once delivery completed.
        assert!(f
            .store
            .list_mail_files(&f.store.inflight_dir())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn no_route_produces_bounce_to_sender() {
        let f = fixture(&[]).await;
        let mut rx = f.bus.subscribe();
        let mail = Mail::new("b1", "b2", "hello", "b", MailType::Agent);
        let outcome = f.router.submit(mail.clone()).await;

        assert_eq!(outcome, RouteOutcome::Bounced);
        // Recipient got nothing.
        assert!(f
            .store
            .list_mail_files(&f.store.agent_inbox("b2"))
            .await
            .unwrap()
            .is_empty());
        // Exactly one bounce in the sender's inbox, threaded to the original.
        let b1_inbox = f.store.list_mail_files(&f.store.agent_inbox("b1")).await.unwrap();
        assert_eq!(b1_inbox.len(), 1);
        let bounce = f.store.read_mail(&b1_inbox[0]).await.unwrap();
        assert_eq!(bounce.metadata.kind, MailType::Bounce);
        assert_eq!(bounce.metadata.in_reply_to.as_deref(), Some(mail.id.as_str()));
        assert_eq!(bounce.subject, "Bounced: hello");

        let event = rx.recv().await.unwrap();
        assert_eq!(event.method(), "mail:bounced");
    }

    #[tokio::test]
    async fn undeliverable_bounce_dead_letters_without_looping() {
        let f = fixture(&[]).await;
        // Sabotage the sender's inbox so the bounce write itself fails: a
        // plain file sits where the directory should be.
        tokio::fs::remove_dir_all(f.store.agent_inbox("b1")).await.unwrap();
        tokio::fs::write(f.store.agent_inbox("b1"), b"").await.unwrap();

        let mail = Mail::new("b1", "b2", "s", "b", MailType::Agent);
        f.router.submit(mail).await;

        let dead = f
            .store
            .list_mail_files(&f.store.deadletter_dir())
            .await
            .unwrap();
        assert_eq!(dead.len(), 1, "exactly one dead letter, no cascade");
        let letter = f.store.read_mail(&dead[0]).await.unwrap();
        assert_eq!(letter.metadata.kind, MailType::Bounce);
        // The original recipient saw nothing either.
        assert!(f
            .store
            .list_mail_files(&f.store.agent_inbox("b2"))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn delivers_to_human_array_store() {
        let f = fixture(&[("b1", "human")]).await;
        let mut rx = f.bus.subscribe();
        let outcome = f
            .router
            .submit(Mail::new("b1", "human", "re:hi", "y", MailType::Agent))
            .await;

        assert_eq!(outcome, RouteOutcome::Delivered);
        let inbox = f.human.inbox().await.unwrap();
        assert_eq!(inbox.len(), 1);
        assert_eq!(inbox[0].subject, "re:hi");
        assert_eq!(inbox[0].status, MailStatus::Delivered);
        assert_eq!(rx.recv().await.unwrap().method(), "mail:received");
    }

    #[tokio::test]
    async fn corrupt_spool_file_moves_to_deadletter() {
        let f = fixture(&[]).await;
        let spool = f.store.inflight_dir().join("1700000000000-bad.json");
        tokio::fs::write(&spool, b"{ nope").await.unwrap();

        let outcome = f.router.route_spooled(&spool).await;
        assert_eq!(outcome, RouteOutcome::DeadLettered);
        assert!(!spool.exists());
        assert!(f
            .store
            .deadletter_dir()
            .join("1700000000000-bad.json")
            .exists());
    }

    #[tokio::test]
    async fn recover_inflight_reroutes_spooled_mail() {
        let f = fixture(&[("b1", "b2")]).await;
        let mail = Mail::new("b1", "b2", "s", "b", MailType::Agent);
        // Simulate a crash after spooling, before delivery.
        f.store
            .write_mail_named(&f.store.inflight_dir(), &mail.file_name(), &mail)
            .await
            .unwrap();

        let recovered = f.router.recover_inflight().await;
        assert_eq!(recovered, 1);
        let inbox = f.store.list_mail_files(&f.store.agent_inbox("b2")).await.unwrap();
        assert_eq!(inbox.len(), 1);
        assert!(f
            .store
            .list_mail_files(&f.store.inflight_dir())
            .await
            .unwrap()
            .is_empty());
    }
}
