//! Resource allocation graph.
//!
//! Nodes are resources and live transactions, stored in a keyed arena with
//! owned adjacency lists. A grant edge points from a resource to the
//! transaction holding it; a wait edge points from a transaction to the
//! resource it is blocked on. Every edge is stored twice: in the source's
//! `out` list and in the target's `inc` list, so both directions can be
//! walked without scanning the graph.
//!
//! Deadlock detection is online: the lock manager adds a wait edge and asks
//! [`ResourceAllocationGraph::has_cycle`] whether that edge closed a cycle.
//! The graph is acyclic before every such insertion, so a cycle, if any,
//! must pass through the new edge.

use std::collections::{HashMap, HashSet};

use bankcoord_common::{LockMode, ResourceId, TransactionId};

/// Node key in the allocation graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NodeKey {
    Resource(ResourceId),
    Transaction(TransactionId),
}

/// Edge kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKind {
    /// Resource → transaction: the lock is held.
    Grant,
    /// Transaction → resource: the lock is awaited.
    Wait,
}

/// One directed edge, as seen from the node that stores it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edge {
    /// The node at the other end.
    pub node: NodeKey,
    pub kind: EdgeKind,
    pub mode: LockMode,
}

#[derive(Debug, Default)]
struct Node {
    out: Vec<Edge>,
    inc: Vec<Edge>,
}

/// Directed graph of held and awaited locks.
#[derive(Debug, Default)]
pub struct ResourceAllocationGraph {
    nodes: HashMap<NodeKey, Node>,
}

impl ResourceAllocationGraph {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a resource node if not present.
    pub fn add_resource(&mut self, resource: &ResourceId) {
        self.nodes
            .entry(NodeKey::Resource(resource.clone()))
            .or_default();
    }

    /// Add a transaction node if not present.
    pub fn add_transaction(&mut self, txn: &TransactionId) {
        self.nodes
            .entry(NodeKey::Transaction(txn.clone()))
            .or_default();
    }

    /// Remove a transaction node along with any edges still attached to it.
    pub fn remove_transaction(&mut self, txn: &TransactionId) -> bool {
        let key = NodeKey::Transaction(txn.clone());
        let Some(node) = self.nodes.remove(&key) else {
            return false;
        };

        for edge in node.out {
            if let Some(target) = self.nodes.get_mut(&edge.node) {
                target.inc.retain(|e| e.node != key);
            }
        }
        for edge in node.inc {
            if let Some(source) = self.nodes.get_mut(&edge.node) {
                source.out.retain(|e| e.node != key);
            }
        }
        true
    }

    pub fn contains(&self, key: &NodeKey) -> bool {
        self.nodes.contains_key(key)
    }

    pub fn contains_transaction(&self, txn: &TransactionId) -> bool {
        self.contains(&NodeKey::Transaction(txn.clone()))
    }

    /// Record that `txn` holds `resource`.
    pub fn add_grant_edge(&mut self, resource: &ResourceId, txn: &TransactionId, mode: LockMode) {
        self.add_edge(
            NodeKey::Resource(resource.clone()),
            NodeKey::Transaction(txn.clone()),
            EdgeKind::Grant,
            mode,
        );
    }

    /// Record that `txn` waits for `resource`.
    pub fn add_wait_edge(&mut self, txn: &TransactionId, resource: &ResourceId, mode: LockMode) {
        self.add_edge(
            NodeKey::Transaction(txn.clone()),
            NodeKey::Resource(resource.clone()),
            EdgeKind::Wait,
            mode,
        );
    }

    fn add_edge(&mut self, from: NodeKey, to: NodeKey, kind: EdgeKind, mode: LockMode) {
        self.nodes.entry(to.clone()).or_default().inc.push(Edge {
            node: from.clone(),
            kind,
            mode,
        });
        self.nodes.entry(from).or_default().out.push(Edge {
            node: to,
            kind,
            mode,
        });
    }

    /// Remove the edge `from → to` and its reverse entry.
    pub fn remove_edge(&mut self, from: &NodeKey, to: &NodeKey) -> Option<Edge> {
        let source = self.nodes.get_mut(from)?;
        let pos = source.out.iter().position(|e| &e.node == to)?;
        let edge = source.out.remove(pos);

        if let Some(target) = self.nodes.get_mut(to) {
            if let Some(pos) = target.inc.iter().position(|e| &e.node == from) {
                target.inc.remove(pos);
            }
        }
        Some(edge)
    }

    /// Check whether the edge `from → to`, already present, closes a cycle.
    ///
    /// Walks out-edges depth first from `to` looking for a path back to
    /// `from`, with a fresh visited set per call.
    pub fn has_cycle(&self, from: &NodeKey, to: &NodeKey) -> bool {
        if from == to {
            return true;
        }

        let mut visited: HashSet<&NodeKey> = HashSet::new();
        visited.insert(from);
        visited.insert(to);
        let mut stack = vec![to];

        while let Some(current) = stack.pop() {
            let Some(node) = self.nodes.get(current) else {
                continue;
            };
            for edge in &node.out {
                if &edge.node == from {
                    return true;
                }
                if visited.insert(&edge.node) {
                    stack.push(&edge.node);
                }
            }
        }
        false
    }

    /// Grant edges leaving a resource: its current holders.
    pub fn holders(&self, resource: &ResourceId) -> &[Edge] {
        self.out_edges(&NodeKey::Resource(resource.clone()))
    }

    /// Wait edges entering a resource, oldest first.
    pub fn waiters(&self, resource: &ResourceId) -> &[Edge] {
        self.in_edges(&NodeKey::Resource(resource.clone()))
    }

    /// Grant edges entering a transaction: the resources it holds.
    pub fn held_by(&self, txn: &TransactionId) -> &[Edge] {
        self.in_edges(&NodeKey::Transaction(txn.clone()))
    }

    /// Wait edges leaving a transaction.
    pub fn waiting_on(&self, txn: &TransactionId) -> &[Edge] {
        self.out_edges(&NodeKey::Transaction(txn.clone()))
    }

    /// Mode in which `txn` holds `resource`, if it does.
    pub fn held_mode(&self, txn: &TransactionId, resource: &ResourceId) -> Option<LockMode> {
        let resource = NodeKey::Resource(resource.clone());
        self.held_by(txn)
            .iter()
            .find(|e| e.node == resource)
            .map(|e| e.mode)
    }

    fn out_edges(&self, key: &NodeKey) -> &[Edge] {
        self.nodes.get(key).map(|n| n.out.as_slice()).unwrap_or(&[])
    }

    fn in_edges(&self, key: &NodeKey) -> &[Edge] {
        self.nodes.get(key).map(|n| n.inc.as_slice()).unwrap_or(&[])
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.nodes.values().map(|n| n.out.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r(name: &str) -> ResourceId {
        ResourceId::new(name)
    }

    fn t(name: &str) -> TransactionId {
        TransactionId::parse(name).unwrap()
    }

    fn rk(name: &str) -> NodeKey {
        NodeKey::Resource(r(name))
    }

    fn tk(name: &str) -> NodeKey {
        NodeKey::Transaction(t(name))
    }

    #[test]
    fn test_edges_are_mirrored() {
        let mut graph = ResourceAllocationGraph::new();
        graph.add_resource(&r("A"));
        graph.add_transaction(&t("t1"));
        graph.add_grant_edge(&r("A"), &t("t1"), LockMode::Write);

        assert_eq!(graph.holders(&r("A")).len(), 1);
        assert_eq!(graph.held_by(&t("t1"))[0].node, rk("A"));
        assert_eq!(graph.held_mode(&t("t1"), &r("A")), Some(LockMode::Write));
        assert_eq!(graph.edge_count(), 1);

        let removed = graph.remove_edge(&rk("A"), &tk("t1")).unwrap();
        assert_eq!(removed.kind, EdgeKind::Grant);
        assert!(graph.holders(&r("A")).is_empty());
        assert!(graph.held_by(&t("t1")).is_empty());
        assert!(graph.remove_edge(&rk("A"), &tk("t1")).is_none());
    }

    #[test]
    fn test_waiters_keep_arrival_order() {
        let mut graph = ResourceAllocationGraph::new();
        for name in ["t1", "t2", "t3"] {
            graph.add_wait_edge(&t(name), &r("A"), LockMode::Read);
        }
        graph.remove_edge(&tk("t2"), &rk("A"));

        let order: Vec<_> = graph.waiters(&r("A")).iter().map(|e| e.node.clone()).collect();
        assert_eq!(order, vec![tk("t1"), tk("t3")]);
    }

    #[test]
    fn test_two_transaction_cycle() {
        let mut graph = ResourceAllocationGraph::new();
        graph.add_grant_edge(&r("A"), &t("t1"), LockMode::Write);
        graph.add_grant_edge(&r("B"), &t("t2"), LockMode::Write);

        graph.add_wait_edge(&t("t1"), &r("B"), LockMode::Write);
        assert!(!graph.has_cycle(&tk("t1"), &rk("B")));

        graph.add_wait_edge(&t("t2"), &r("A"), LockMode::Write);
        assert!(graph.has_cycle(&tk("t2"), &rk("A")));
    }

    #[test]
    fn test_shared_holders_do_not_form_cycle() {
        let mut graph = ResourceAllocationGraph::new();
        graph.add_grant_edge(&r("A"), &t("t1"), LockMode::Read);
        graph.add_grant_edge(&r("A"), &t("t2"), LockMode::Read);
        graph.add_wait_edge(&t("t3"), &r("A"), LockMode::Write);
        assert!(!graph.has_cycle(&tk("t3"), &rk("A")));
    }

    #[test]
    fn test_remove_transaction_strips_edges() {
        let mut graph = ResourceAllocationGraph::new();
        graph.add_grant_edge(&r("A"), &t("t1"), LockMode::Write);
        graph.add_wait_edge(&t("t1"), &r("B"), LockMode::Read);

        assert!(graph.remove_transaction(&t("t1")));
        assert!(!graph.contains_transaction(&t("t1")));
        assert!(graph.holders(&r("A")).is_empty());
        assert!(graph.waiters(&r("B")).is_empty());
        assert_eq!(graph.edge_count(), 0);
        assert!(!graph.remove_transaction(&t("t1")));
    }

    /// Reachability on a plain adjacency matrix, used as the oracle.
    fn reaches(adj: &[[bool; 6]; 6], from: usize, to: usize) -> bool {
        let mut seen = [false; 6];
        let mut stack = vec![from];
        while let Some(n) = stack.pop() {
            if n == to {
                return true;
            }
            if std::mem::replace(&mut seen[n], true) {
                continue;
            }
            stack.extend((0..6).filter(|&m| adj[n][m]));
        }
        false
    }

    fn is_acyclic(adj: &[[bool; 6]; 6]) -> bool {
        (0..6).all(|n| (0..6).filter(|&m| adj[n][m]).all(|m| !reaches(adj, m, n)))
    }

    /// Every acyclic graph over three resources and three transactions, with
    /// at most one edge per resource/transaction pair, probed with every
    /// possible new edge.
    #[test]
    fn test_has_cycle_exhaustive_small_graphs() {
        // Nodes 0..3 are resources, 3..6 transactions.
        let keys: Vec<NodeKey> = (0..3)
            .map(|i| rk(&format!("R{}", i)))
            .chain((0..3).map(|j| tk(&format!("T{}", j))))
            .collect();
        let pairs: Vec<(usize, usize)> = (0..3).flat_map(|i| (3..6).map(move |j| (i, j))).collect();

        let mut checked = 0;
        for code in 0..3usize.pow(pairs.len() as u32) {
            // 0: no edge, 1: grant (resource → txn), 2: wait (txn → resource).
            let mut choice = vec![0; pairs.len()];
            let mut c = code;
            for slot in choice.iter_mut() {
                *slot = c % 3;
                c /= 3;
            }

            let mut adj = [[false; 6]; 6];
            let mut graph = ResourceAllocationGraph::new();
            for (&(res, txn), &kind) in pairs.iter().zip(&choice) {
                match kind {
                    1 => adj[res][txn] = true,
                    2 => adj[txn][res] = true,
                    _ => continue,
                }
                let (from, to) = if kind == 1 { (res, txn) } else { (txn, res) };
                graph.add_edge(keys[from].clone(), keys[to].clone(), EdgeKind::Wait, LockMode::Write);
            }
            if !is_acyclic(&adj) {
                continue;
            }

            for (&(res, txn), &kind) in pairs.iter().zip(&choice) {
                if kind != 0 {
                    continue;
                }
                for (from, to) in [(res, txn), (txn, res)] {
                    graph.add_edge(keys[from].clone(), keys[to].clone(), EdgeKind::Wait, LockMode::Write);
                    assert_eq!(
                        graph.has_cycle(&keys[from], &keys[to]),
                        reaches(&adj, to, from),
                        "edge {:?} -> {:?} on graph {:?}",
                        keys[from],
                        keys[to],
                        choice
                    );
                    graph.remove_edge(&keys[from], &keys[to]);
                    checked += 1;
                }
            }
        }
        assert!(checked > 0);
    }
}
