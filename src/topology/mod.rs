// SPDX-License-Identifier: MIT
//! Connection topology — the directed graph of permitted sender→recipient
//! pairs.
//!
//! A [`Topology`] is an immutable snapshot rebuilt from the swarm registry
//! on every mutation; [`TopologyHandle`] swaps snapshots atomically so an
//! in-flight route sees one consistent view. The `human` node is an
//! ordinary node here — it can reach exactly the nodes it has edges to,
//! nothing more.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};

use serde::Serialize;

use crate::swarm::model::SwarmConfig;

// ─── Topology snapshot ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct Topology {
    edges: BTreeSet<(String, String)>,
}

/// One entry of the display-merged view: matched directed pairs collapse to
/// a single bidirectional edge whose `source` is the lexicographic minimum.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MergedEdge {
    pub source: String,
    pub target: String,
    pub bidirectional: bool,
}

impl Topology {
    /// Build a snapshot from normalized registry connections.
    pub fn from_config(cfg: &SwarmConfig) -> Topology {
        let mut edges = BTreeSet::new();
        for conn in &cfg.connections {
            if conn.bidirectional {
                edges.insert((conn.to.clone(), conn.from.clone()));
            }
            edges.insert((conn.from.clone(), conn.to.clone()));
        }
        Topology { edges }
    }

    pub fn can_send(&self, from: &str, to: &str) -> bool {
        self.edges.contains(&(from.to_string(), to.to_string()))
    }

    /// Display-only: true when both directed edges exist.
    pub fn is_bidirectional(&self, a: &str, b: &str) -> bool {
        self.can_send(a, b) && self.can_send(b, a)
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Nodes with a directed edge into `node` (its upstream senders).
    pub fn senders_to(&self, node: &str) -> Vec<String> {
        self.edges
            .iter()
            .filter(|(_, to)| to == node)
            .map(|(from, _)| from.clone())
            .collect()
    }

    /// Nodes `node` has a directed edge to (its delegation targets).
    pub fn recipients_of(&self, node: &str) -> Vec<String> {
        self.edges
            .iter()
            .filter(|(from, _)| from == node)
            .map(|(_, to)| to.clone())
            .collect()
    }

    /// Collapse matched pairs into single bidirectional display entries.
    /// For a matched pair the display `source` is `min(from, to)`.
    pub fn merge(&self) -> Vec<MergedEdge> {
        let mut merged = Vec::new();
        for (from, to) in &self.edges {
            let reverse = self.edges.contains(&(to.clone(), from.clone()));
            if reverse {
                // Emit the pair once, keyed on its lexicographic minimum.
                if from < to {
                    merged.push(MergedEdge {
                        source: from.clone(),
                        target: to.clone(),
                        bidirectional: true,
                    });
                }
            } else {
                merged.push(MergedEdge {
                    source: from.clone(),
                    target: to.clone(),
                    bidirectional: false,
                });
            }
        }
        merged
    }

    /// Read-only diagnostic: enumerate simple cycles reachable in the graph.
    /// Cycles are permitted; callers use this for display, never to reject.
    pub fn detect_cycles(&self) -> Vec<Vec<String>> {
        let mut adjacency: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for (from, to) in &self.edges {
            adjacency.entry(from).or_default().push(to);
        }

        let mut cycles: Vec<Vec<String>> = Vec::new();
        let mut done: BTreeSet<&str> = BTreeSet::new();

        for start in adjacency.keys().copied().collect::<Vec<_>>() {
            if done.contains(start) {
                continue;
            }
            let mut path: Vec<&str> = Vec::new();
            let mut on_path: BTreeSet<&str> = BTreeSet::new();
            // Iterative DFS with an explicit edge-iterator stack.
            let mut stack: Vec<(&str, usize)> = vec![(start, 0)];
            path.push(start);
            on_path.insert(start);

            while let Some((node, next_idx)) = stack.pop() {
                let neighbors = adjacency.get(node).map(|v| v.as_slice()).unwrap_or(&[]);
                if next_idx < neighbors.len() {
                    stack.push((node, next_idx + 1));
                    let next = neighbors[next_idx];
                    if on_path.contains(next) {
                        // Back edge — slice the current path into a cycle.
                        let pos = path
                            .iter()
                            .position(|n| *n == next)
                            .expect("on_path member is on the path");
                        let cycle: Vec<String> =
                            path[pos..].iter().map(|n| n.to_string()).collect();
                        if !cycles.contains(&cycle) {
                            cycles.push(cycle);
                        }
                    } else if !done.contains(next) {
                        path.push(next);
                        on_path.insert(next);
                        stack.push((next, 0));
                    }
                } else {
                    path.pop();
                    on_path.remove(node);
                    done.insert(node);
                }
            }
        }
        cycles
    }
}

// ─── Snapshot handle ──────────────────────────────────────────────────────────

/// Holds the current topology snapshot. Mutations install a new snapshot;
/// routes in flight keep the `Arc` they observed at entry.
pub struct TopologyHandle {
    current: RwLock<Arc<Topology>>,
}

impl TopologyHandle {
    pub fn new(initial: Topology) -> TopologyHandle {
        TopologyHandle {
            current: RwLock::new(Arc::new(initial)),
        }
    }

    pub fn snapshot(&self) -> Arc<Topology> {
        self.current.read().expect("topology lock poisoned").clone()
    }

    pub fn install(&self, topology: Topology) {
        *self.current.write().expect("topology lock poisoned") = Arc::new(topology);
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::swarm::model::{Bee, Connection, SwarmConfig};

    fn topology(edges: &[(&str, &str)]) -> Topology {
        let cfg = SwarmConfig {
            id: "s".into(),
            name: "s".into(),
            bees: ["a", "b", "c"]
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
        Topology::from_config(&cfg)
    }

    #[test]
    fn can_send_follows_directed_edges_only() {
        let topo = topology(&[("a", "b")]);
        assert!(topo.can_send("a", "b"));
        assert!(!topo.can_send("b", "a"));
        assert!(!topo.can_send("a", "c"));
    }

    #[test]
    fn human_has_no_implicit_reachability() {
        let topo = topology(&[("human", "a")]);
        assert!(topo.can_send("human", "a"));
        assert!(!topo.can_send("human", "b"));
        assert!(!topo.can_send("a", "human"));
    }

    #[test]
    fn bidirectional_requires_both_edges() {
        let topo = topology(&[("a", "b"), ("b", "a"), ("b", "c")]);
        assert!(topo.is_bidirectional("a", "b"));
        assert!(topo.is_bidirectional("b", "a"));
        assert!(!topo.is_bidirectional("b", "c"));
    }

    #[test]
    fn merge_collapses_pairs_with_lexicographic_source() {
        let topo = topology(&[("human", "b"), ("b", "human"), ("a", "c")]);
        let merged = topo.merge();
        assert_eq!(merged.len(), 2);
        let pair = merged.iter().find(|e| e.bidirectional).unwrap();
        // min("human", "b") is "b".
        assert_eq!(pair.source, "b");
        assert_eq!(pair.target, "human");
        let single = merged.iter().find(|e| !e.bidirectional).unwrap();
        assert_eq!(single.source, "a");
        assert_eq!(single.target, "c");
    }

    #[test]
    fn detect_cycles_finds_loop_and_permits_it() {
        let topo = topology(&[("a", "b"), ("b", "c"), ("c", "a")]);
        let cycles = topo.detect_cycles();
        assert_eq!(cycles.len(), 1);
        assert_eq!(cycles[0].len(), 3);

        let acyclic = topology(&[("a", "b"), ("b", "c")]);
        assert!(acyclic.detect_cycles().is_empty());
    }

    #[test]
    fn detect_cycles_two_node_loop() {
        let topo = topology(&[("a", "b"), ("b", "a")]);
        let cycles = topo.detect_cycles();
        assert_eq!(cycles.len(), 1);
        assert_eq!(cycles[0].len(), 2);
    }

    #[test]
    fn handle_swaps_snapshots_atomically() {
        let handle = TopologyHandle::new(topology(&[("a", "b")]));
        let before = handle.snapshot();
        handle.install(topology(&[("b", "c")]));
        let after = handle.snapshot();

        // The old snapshot is unchanged; the new one reflects the swap.
        assert!(before.can_send("a", "b"));
        assert!(!after.can_send("a", "b"));
        assert!(after.can_send("b", "c"));
    }

    #[test]
    fn neighbor_queries() {
        let topo = topology(&[("human", "a"), ("b", "a"), ("a", "c")]);
        let mut senders = topo.senders_to("a");
        senders.sort();
        assert_eq!(senders, vec!["b".to_string(), "human".to_string()]);
        assert_eq!(topo.recipients_of("a"), vec!["c".to_string()]);
    }
}
