//! Async Gate
//!
//! Tracks producers whose value has not arrived yet, and the nodes waiting
//! on them.
//!
//! A node is blocked on exactly one pending root at a time. Blocking is
//! idempotent, so repeated triggers while the root stays pending never grow
//! the bookkeeping. When the root settles, only the nodes blocked on it are
//! released.

use std::collections::HashMap;

use indexmap::{IndexMap, IndexSet};

use crate::graph::NodeId;

#[derive(Debug, Default)]
pub(crate) struct AsyncGate {
    /// Pending table: node -> generation of its in-flight run.
    pending: IndexMap<NodeId, u64>,
    /// Pending root -> nodes waiting on it.
    waiting: HashMap<NodeId, IndexSet<NodeId>>,
    /// Waiting node -> pending root.
    blocked_on: HashMap<NodeId, NodeId>,
}

impl AsyncGate {
    pub fn start(&mut self, node: NodeId, generation: u64) {
        self.pending.insert(node, generation);
    }

    pub fn is_pending(&self, node: NodeId) -> bool {
        self.pending.contains_key(&node)
    }

    pub fn in_flight(&self, node: NodeId) -> Option<u64> {
        self.pending.get(&node).copied()
    }

    /// Record that `node` can't run until `root` settles.
    pub fn block(&mut self, node: NodeId, root: NodeId) {
        if node == root {
            return;
        }
        if let Some(previous) = self.blocked_on.insert(node, root) {
            if previous != root {
                if let Some(set) = self.waiting.get_mut(&previous) {
                    set.shift_remove(&node);
                }
            }
        }
        self.waiting.entry(root).or_default().insert(node);
    }

    pub fn blocker(&self, node: NodeId) -> Option<NodeId> {
        self.blocked_on.get(&node).copied()
    }

    /// Clear the pending marker if `generation` is the one in flight.
    ///
    /// Returns the released nodes, or `None` for a settlement that does
    /// not match.
    pub fn finish(&mut self, node: NodeId, generation: u64) -> Option<Vec<NodeId>> {
        if self.in_flight(node) != Some(generation) {
            return None;
        }
        self.pending.shift_remove(&node);

        let released: Vec<NodeId> = self
            .waiting
            .remove(&node)
            .map(|set| set.into_iter().collect())
            .unwrap_or_default();
        for waiter in &released {
            self.blocked_on.remove(waiter);
        }
        Some(released)
    }

    pub fn pending(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.pending.keys().copied()
    }

    pub fn blocked_count(&self) -> usize {
        self.blocked_on.len()
    }
}
