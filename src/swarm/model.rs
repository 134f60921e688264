// SPDX-License-Identifier: MIT
//! Swarm configuration model — the persistent graph of bees, mailboxes and
//! permitted connections.

use serde::{Deserialize, Serialize};

use crate::error::HiveError;
use crate::mail::model::{mailbox_name, HUMAN_NODE, MAILBOX_PREFIX};

/// A containerized agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bee {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Persona text written to the agent's read-only `soul.md` during
    /// provisioning.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub soul: Option<String>,
}

/// A named non-agent endpoint. Referenced in connections as
/// `mailbox:<id>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MailboxDef {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// A directed permission edge. `bidirectional: true` is accepted on input
/// and normalized away — the registry materializes it as two directed
/// entries (the display layer re-merges pairs).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    pub from: String,
    pub to: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub bidirectional: bool,
}

impl Connection {
    pub fn directed(from: impl Into<String>, to: impl Into<String>) -> Connection {
        Connection {
            from: from.into(),
            to: to.into(),
            bidirectional: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwarmConfig {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub bees: Vec<Bee>,
    #[serde(default)]
    pub mailboxes: Vec<MailboxDef>,
    #[serde(default)]
    pub connections: Vec<Connection>,
}

/// What kind of endpoint a node identifier denotes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    Human,
    Agent,
    Mailbox,
}

impl SwarmConfig {
    pub fn empty(id: impl Into<String>, name: impl Into<String>) -> SwarmConfig {
        SwarmConfig {
            id: id.into(),
            name: name.into(),
            bees: Vec::new(),
            mailboxes: Vec::new(),
            connections: Vec::new(),
        }
    }

    pub fn bee(&self, id: &str) -> Option<&Bee> {
        self.bees.iter().find(|b| b.id == id)
    }

    pub fn mailbox(&self, id: &str) -> Option<&MailboxDef> {
        self.mailboxes.iter().find(|m| m.id == id)
    }

    /// The `human` node is implicit and always present; agents and
    /// mailboxes must be declared.
    pub fn node_exists(&self, node: &str) -> bool {
        if node == HUMAN_NODE {
            return true;
        }
        match mailbox_name(node) {
            Some(name) => self.mailbox(name).is_some(),
            None => self.bee(node).is_some(),
        }
    }

    pub fn node_type(&self, node: &str) -> Option<NodeType> {
        if node == HUMAN_NODE {
            Some(NodeType::Human)
        } else if let Some(name) = mailbox_name(node) {
            self.mailbox(name).map(|_| NodeType::Mailbox)
        } else {
            self.bee(node).map(|_| NodeType::Agent)
        }
    }

    /// Display name for a node identifier.
    pub fn node_name(&self, node: &str) -> String {
        if node == HUMAN_NODE {
            return "Human".to_string();
        }
        if let Some(name) = mailbox_name(node) {
            return self
                .mailbox(name)
                .and_then(|m| m.name.clone())
                .unwrap_or_else(|| name.to_string());
        }
        self.bee(node)
            .map(|b| b.name.clone())
            .unwrap_or_else(|| node.to_string())
    }

    /// Expand `bidirectional` entries into directed pairs, deduplicate, and
    /// sort. The normalized form is what gets persisted and what the
    /// topology is built from.
    pub fn normalize(&mut self) {
        let mut edges = std::collections::BTreeSet::new();
        for conn in self.connections.drain(..) {
            if conn.bidirectional {
                edges.insert((conn.to.clone(), conn.from.clone()));
            }
            edges.insert((conn.from, conn.to));
        }
        self.connections = edges
            .into_iter()
            .map(|(from, to)| Connection::directed(from, to))
            .collect();
    }

    /// Structural validation, run before every persist.
    pub fn validate(&self) -> Result<(), HiveError> {
        let mut seen = std::collections::HashSet::new();
        for bee in &self.bees {
            if bee.id.is_empty() {
                return Err(HiveError::Validation("bee id must not be empty".into()));
            }
            if bee.id == HUMAN_NODE {
                return Err(HiveError::Validation(format!(
                    "'{HUMAN_NODE}' is reserved and cannot be a bee id"
                )));
            }
            if bee.id.starts_with(MAILBOX_PREFIX) {
                return Err(HiveError::Validation(format!(
                    "bee id '{}' must not use the mailbox prefix",
                    bee.id
                )));
            }
            if !seen.insert(format!("bee:{}", bee.id)) {
                return Err(HiveError::Validation(format!("duplicate bee id '{}'", bee.id)));
            }
        }
        for mailbox in &self.mailboxes {
            if mailbox.id.is_empty() {
                return Err(HiveError::Validation("mailbox id must not be empty".into()));
            }
            if !seen.insert(format!("mailbox:{}", mailbox.id)) {
                return Err(HiveError::Validation(format!(
                    "duplicate mailbox id '{}'",
                    mailbox.id
                )));
            }
        }
        for conn in &self.connections {
            if conn.from == conn.to {
                return Err(HiveError::Validation(format!(
                    "self-edge on '{}' is not allowed",
                    conn.from
                )));
            }
            for node in [&conn.from, &conn.to] {
                if !self.node_exists(node) {
                    return Err(HiveError::Validation(format!(
                        "connection references unknown node '{node}'"
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with(bees: &[&str], connections: Vec<Connection>) -> SwarmConfig {
        SwarmConfig {
            id: "swarm-1".into(),
            name: "test".into(),
            bees: bees
                .iter()
                .map(|id| Bee {
                    id: id.to_string(),
                    name: id.to_uppercase(),
                    model: None,
                    soul: None,
                })
                .collect(),
            mailboxes: vec![MailboxDef {
                id: "reports".into(),
                name: None,
            }],
            connections,
        }
    }

    #[test]
    fn normalize_expands_bidirectional() {
        let mut cfg = config_with(
            &["b1"],
            vec![Connection {
                from: "human".into(),
                to: "b1".into(),
                bidirectional: true,
            }],
        );
        cfg.normalize();
        assert_eq!(
            cfg.connections,
            vec![
                Connection::directed("b1", "human"),
                Connection::directed("human", "b1"),
            ]
        );
    }

    #[test]
    fn normalize_deduplicates() {
        let mut cfg = config_with(
            &["b1", "b2"],
            vec![
                Connection::directed("b1", "b2"),
                Connection::directed("b1", "b2"),
                Connection {
                    from: "b2".into(),
                    to: "b1".into(),
                    bidirectional: true,
                },
            ],
        );
        cfg.normalize();
        assert_eq!(
            cfg.connections,
            vec![
                Connection::directed("b1", "b2"),
                Connection::directed("b2", "b1"),
            ]
        );
    }

    #[test]
    fn validate_rejects_unknown_node() {
        let cfg = config_with(&["b1"], vec![Connection::directed("b1", "ghost")]);
        let err = cfg.validate().unwrap_err();
        assert_eq!(err.kind(), "ErrValidation");
    }

    #[test]
    fn validate_rejects_self_edge() {
        let cfg = config_with(&["b1"], vec![Connection::directed("b1", "b1")]);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_duplicate_bee() {
        let mut cfg = config_with(&["b1"], vec![]);
        cfg.bees.push(cfg.bees[0].clone());
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_reserved_human_id() {
        let cfg = config_with(&["human"], vec![]);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn human_is_implicit_mailboxes_need_prefix() {
        let cfg = config_with(&["b1"], vec![]);
        assert!(cfg.node_exists("human"));
        assert!(cfg.node_exists("b1"));
        assert!(cfg.node_exists("mailbox:reports"));
        assert!(!cfg.node_exists("reports"));
        assert!(!cfg.node_exists("mailbox:ghost"));
        assert_eq!(cfg.node_type("mailbox:reports"), Some(NodeType::Mailbox));
        assert_eq!(cfg.node_type("human"), Some(NodeType::Human));
    }

    #[test]
    fn connection_accepts_human_edges_like_any_node() {
        let cfg = config_with(
            &["b1"],
            vec![
                Connection::directed("human", "b1"),
                Connection::directed("b1", "human"),
            ],
        );
        assert!(cfg.validate().is_ok());
    }
}
