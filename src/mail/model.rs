// SPDX-License-Identifier: MIT
//! Mail data model — the wire-critical JSON exchanged through inbox/outbox
//! queues.
//!
//! Mail files are UTF-8 JSON with camelCase field names. Unknown fields MUST
//! survive a round-trip through the router, so both [`Mail`] and
//! [`MailMetadata`] carry a flattened extras map.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The distinguished node representing the operator. It has no privileged
/// connectivity — edges to and from it must exist explicitly.
pub const HUMAN_NODE: &str = "human";

/// Prefix marking a non-agent mailbox endpoint, e.g. `mailbox:reports`.
pub const MAILBOX_PREFIX: &str = "mailbox:";

/// Returns the bare mailbox name when `node` is a mailbox identifier.
pub fn mailbox_name(node: &str) -> Option<&str> {
    node.strip_prefix(MAILBOX_PREFIX)
}

// ─── Enums ────────────────────────────────────────────────────────────────────

/// Who (or what) originated a mail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MailType {
    Human,
    Agent,
    System,
    Cron,
    External,
    Bounce,
}

impl Default for MailType {
    fn default() -> Self {
        MailType::Agent
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Normal,
    High,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

/// Mail lifecycle. `Delivered`, `Bounced` and `Failed` are terminal — a mail
/// that reached one of them is never modified again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MailStatus {
    Queued,
    Delivered,
    Bounced,
    Failed,
}

impl Default for MailStatus {
    fn default() -> Self {
        MailStatus::Queued
    }
}

// ─── Metadata / attachments ──────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MailMetadata {
    #[serde(rename = "type", default)]
    pub kind: MailType,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<String>,
    /// Unknown metadata fields, preserved verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Reference to a blob in the shared attachment store. Mail never embeds the
/// bytes themselves.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentRef {
    pub id: String,
    pub filename: String,
    pub mime_type: String,
    pub size: u64,
}

// ─── Mail ────────────────────────────────────────────────────────────────────

/// An immutable message deposited into a queue directory (one JSON file per
/// mail) or into the human endpoint's array store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mail {
    pub id: String,
    pub from: String,
    pub to: String,
    pub subject: String,
    pub body: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: MailMetadata,
    #[serde(default)]
    pub status: MailStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<AttachmentRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bounce_reason: Option<String>,
    /// Unknown top-level fields, preserved verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Mail {
    pub fn new(
        from: impl Into<String>,
        to: impl Into<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
        kind: MailType,
    ) -> Mail {
        Mail {
            id: uuid::Uuid::new_v4().to_string(),
            from: from.into(),
            to: to.into(),
            subject: subject.into(),
            body: body.into(),
            timestamp: Utc::now(),
            metadata: MailMetadata {
                kind,
                ..MailMetadata::default()
            },
            status: MailStatus::Queued,
            attachments: Vec::new(),
            bounce_reason: None,
            extra: Map::new(),
        }
    }

    /// Build the system bounce reporting a delivery failure of `original`
    /// back to its sender.
    pub fn bounce_for(original: &Mail, reason: &str) -> Mail {
        let mut bounce = Mail::new(
            "system",
            original.from.clone(),
            format!("Bounced: {}", original.subject),
            format!(
                "Your mail to '{}' could not be delivered: {reason}",
                original.to
            ),
            MailType::Bounce,
        );
        bounce.metadata.in_reply_to = Some(original.id.clone());
        bounce.bounce_reason = Some(reason.to_string());
        bounce
    }

    /// Queue file name: `<epochMillis>-<uuid>.json`. The millisecond prefix
    /// imposes FIFO order under lexicographic sort; the UUID breaks ties
    /// within one millisecond.
    pub fn file_name(&self) -> String {
        format!("{}-{}.json", self.timestamp.timestamp_millis(), self.id)
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn make_mail() -> Mail {
        Mail::new("b1", "b2", "subject line", "body text", MailType::Agent)
    }

    #[test]
    fn serializes_camel_case_wire_names() {
        let mut mail = make_mail();
        mail.metadata.in_reply_to = Some("prior-id".to_string());
        mail.bounce_reason = Some("nope".to_string());
        let json = serde_json::to_value(&mail).unwrap();
        assert_eq!(json["from"], "b1");
        assert_eq!(json["metadata"]["type"], "agent");
        assert_eq!(json["metadata"]["priority"], "normal");
        assert_eq!(json["metadata"]["inReplyTo"], "prior-id");
        assert_eq!(json["status"], "queued");
        assert_eq!(json["bounceReason"], "nope");
    }

    #[test]
    fn unknown_fields_round_trip() {
        let raw = serde_json::json!({
            "id": "m-1",
            "from": "b1",
            "to": "human",
            "subject": "s",
            "body": "b",
            "timestamp": "2026-03-01T10:00:00Z",
            "metadata": {"type": "agent", "priority": "high", "traceId": "t-77"},
            "status": "queued",
            "threadHint": 42
        });
        let mail: Mail = serde_json::from_value(raw).unwrap();
        assert_eq!(mail.metadata.priority, Priority::High);
        let back = serde_json::to_value(&mail).unwrap();
        assert_eq!(back["threadHint"], 42);
        assert_eq!(back["metadata"]["traceId"], "t-77");
    }

    #[test]
    fn missing_metadata_defaults() {
        let raw = serde_json::json!({
            "id": "m-2",
            "from": "b1",
            "to": "b2",
            "subject": "s",
            "body": "b",
            "timestamp": "2026-03-01T10:00:00Z"
        });
        let mail: Mail = serde_json::from_value(raw).unwrap();
        assert_eq!(mail.metadata.priority, Priority::Normal);
        assert_eq!(mail.status, MailStatus::Queued);
        assert!(mail.attachments.is_empty());
        assert!(mail.bounce_reason.is_none());
    }

    #[test]
    fn bounce_references_original() {
        let original = make_mail();
        let bounce = Mail::bounce_for(&original, "no route from b1 to b2");
        assert_eq!(bounce.from, "system");
        assert_eq!(bounce.to, "b1");
        assert_eq!(bounce.subject, "Bounced: subject line");
        assert_eq!(bounce.metadata.kind, MailType::Bounce);
        assert_eq!(bounce.metadata.in_reply_to.as_deref(), Some(original.id.as_str()));
        assert_eq!(bounce.bounce_reason.as_deref(), Some("no route from b1 to b2"));
        assert_ne!(bounce.id, original.id);
    }

    #[test]
    fn file_name_sorts_by_timestamp() {
        let mut a = make_mail();
        let mut b = make_mail();
        a.timestamp = DateTime::parse_from_rfc3339("2026-03-01T10:00:00.001Z")
            .unwrap()
            .with_timezone(&Utc);
        b.timestamp = DateTime::parse_from_rfc3339("2026-03-01T10:00:00.002Z")
            .unwrap()
            .with_timezone(&Utc);
        assert!(a.file_name() < b.file_name());
        assert!(a.file_name().ends_with(".json"));
    }

    #[test]
    fn mailbox_prefix_helpers() {
        assert_eq!(mailbox_name("mailbox:reports"), Some("reports"));
        assert_eq!(mailbox_name("b1"), None);
        assert_eq!(mailbox_name(HUMAN_NODE), None);
    }
}
