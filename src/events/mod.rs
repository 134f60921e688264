// SPDX-License-Identifier: MIT
//! In-process event bus fanning status changes, mail events and count
//! updates to all subscribers.
//!
//! Built on `tokio::sync::broadcast`: each subscriber owns a bounded queue
//! of [`SUBSCRIBER_QUEUE`] events. A subscriber that falls behind observes
//! `RecvError::Lagged` — the bus drops its oldest events rather than block
//! the hot path, and the subscriber is expected to resubscribe. The stream
//! is not persistent across restarts.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

use crate::mail::counter::NodeCounts;
use crate::mail::model::Mail;

/// Bounded per-subscriber queue depth.
pub const SUBSCRIBER_QUEUE: usize = 256;

/// Runtime state payload for `bee:status`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BeeStatus {
    pub id: String,
    pub running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub enum Event {
    /// A sender handed a mail to the orchestrator (human send or outbox pickup).
    MailSent(Mail),
    /// A mail landed in the human inbox.
    MailReceived(Mail),
    /// A mail landed in an agent or mailbox inbox.
    MailRouted(Mail),
    /// A mail could not be processed; `kind` is the error taxonomy name.
    MailFailed {
        mail_id: Option<String>,
        node: String,
        kind: &'static str,
        reason: String,
    },
    /// A bounce was produced for a rejected or undeliverable mail.
    MailBounced(Mail),
    /// Coalesced queue-depth snapshot for every node.
    MailCounts(BTreeMap<String, NodeCounts>),
    BeeStatus(BeeStatus),
    SwarmUpdated,
}

impl Event {
    /// Topic name on the wire (SSE event name).
    pub fn method(&self) -> &'static str {
        match self {
            Event::MailSent(_) => "mail:sent",
            Event::MailReceived(_) => "mail:received",
            Event::MailRouted(_) => "mail:routed",
            Event::MailFailed { .. } => "mail:failed",
            Event::MailBounced(_) => "mail:bounced",
            Event::MailCounts(_) => "mail:counts",
            Event::BeeStatus(_) => "bee:status",
            Event::SwarmUpdated => "swarm:updated",
        }
    }

    /// JSON payload for external subscribers.
    pub fn payload(&self) -> serde_json::Value {
        match self {
            Event::MailSent(mail)
            | Event::MailReceived(mail)
            | Event::MailRouted(mail)
            | Event::MailBounced(mail) => serde_json::to_value(mail).unwrap_or_default(),
            Event::MailFailed {
                mail_id,
                node,
                kind,
                reason,
            } => serde_json::json!({
                "mailId": mail_id,
                "node": node,
                "kind": kind,
                "reason": reason,
            }),
            Event::MailCounts(counts) => serde_json::to_value(counts).unwrap_or_default(),
            Event::BeeStatus(status) => serde_json::to_value(status).unwrap_or_default(),
            Event::SwarmUpdated => serde_json::json!({}),
        }
    }
}

/// Cloneable publisher handle; one broadcast channel behind every clone.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> EventBus {
        let (tx, _) = broadcast::channel(SUBSCRIBER_QUEUE);
        EventBus { tx }
    }

    /// Publish to all subscribers. No subscribers is fine; a full subscriber
    /// queue drops that subscriber's oldest events instead of blocking.
    pub fn publish(&self, event: Event) {
        debug!(method = event.method(), "event published");
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mail::model::MailType;

    #[tokio::test]
    async fn subscribers_receive_in_publication_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish(Event::SwarmUpdated);
        bus.publish(Event::MailSent(Mail::new("human", "b1", "s", "b", MailType::Human)));

        assert_eq!(rx.recv().await.unwrap().method(), "swarm:updated");
        assert_eq!(rx.recv().await.unwrap().method(), "mail:sent");
    }

    #[tokio::test]
    async fn slow_subscriber_lags_instead_of_blocking() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        for _ in 0..(SUBSCRIBER_QUEUE + 10) {
            bus.publish(Event::SwarmUpdated);
        }

        // The oldest events were dropped; the receiver is told how many.
        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(n)) => assert!(n >= 10),
            other => panic!("expected lag, got {other:?}"),
        }
    }

    #[test]
    fn method_names_are_stable() {
        let mail = Mail::new("a", "b", "s", "b", MailType::Agent);
        assert_eq!(Event::MailRouted(mail.clone()).method(), "mail:routed");
        assert_eq!(Event::MailReceived(mail.clone()).method(), "mail:received");
        assert_eq!(Event::MailBounced(mail).method(), "mail:bounced");
        assert_eq!(
            Event::MailFailed {
                mail_id: None,
                node: "b1".into(),
                kind: "ErrMailCorrupt",
                reason: "bad json".into(),
            }
            .method(),
            "mail:failed"
        );
        assert_eq!(Event::MailCounts(Default::default()).method(), "mail:counts");
    }

    #[test]
    fn failed_payload_carries_taxonomy_kind() {
        let payload = Event::MailFailed {
            mail_id: Some("m-1".into()),
            node: "b1".into(),
            kind: "ErrMailCorrupt",
            reason: "unparseable".into(),
        }
        .payload();
        assert_eq!(payload["kind"], "ErrMailCorrupt");
        assert_eq!(payload["mailId"], "m-1");
    }
}
