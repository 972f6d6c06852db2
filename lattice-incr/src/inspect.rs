//! Diagnostics
//!
//! Read-only views of an engine: the [`Snapshot`] returned by
//! `Engine::inspect` and handed to the fatal hook, and the [`TraceEvent`]
//! emitted once per settled transaction.

use indexmap::IndexMap;
use serde::Serialize;

use crate::error::FatalRecord;
use crate::eval::Evaluator;
use crate::graph::{DirtyState, NodeId, NodeKind};
use crate::rate::RateWindow;
use crate::value::Value;

/// Point-in-time view of an engine.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    /// Name -> names read during its latest run, in declaration order.
    pub graph: IndexMap<String, Vec<String>>,
    /// Committed values. Uncomputed and pending nodes map to `null`.
    pub values: IndexMap<String, serde_json::Value>,
    pub stale: Vec<String>,
    pub pending: Vec<String>,
    /// Dependents frozen by rate-limit backoff.
    pub frozen: Vec<String>,
    /// Write counters of rate-limited static names.
    pub rate: IndexMap<String, RateWindow>,
    pub revision: u64,
    pub fatal: Option<FatalRecord>,
}

impl Snapshot {
    pub(crate) fn capture(eval: &Evaluator) -> Self {
        let graph = eval.graph();
        let names = |ids: Vec<_>| -> Vec<String> {
            ids.into_iter()
                .map(|id| graph.name(id).to_string())
                .collect()
        };

        Self {
            graph: graph
                .iter()
                .map(|node| {
                    let deps = node
                        .dependencies()
                        .iter()
                        .map(|dep| graph.name(*dep).to_string())
                        .collect();
                    (node.name().to_string(), deps)
                })
                .collect(),
            values: graph
                .iter()
                .map(|node| {
                    let value = match node.value() {
                        Some(value) if !eval.is_pending(node.id()) => value.to_json(),
                        _ => serde_json::Value::Null,
                    };
                    (node.name().to_string(), value)
                })
                .collect(),
            stale: names(eval.stale_nodes()),
            pending: names(eval.pending_nodes()),
            frozen: names(eval.frozen_nodes()),
            rate: eval
                .rate_windows()
                .into_iter()
                .map(|(id, window)| (graph.name(id).to_string(), window))
                .collect(),
            revision: eval.revision(),
            fatal: eval.fatal().cloned(),
        }
    }

    /// Dependencies recorded for `name`.
    pub fn dependencies(&self, name: &str) -> Option<&[String]> {
        self.graph.get(name).map(Vec::as_slice)
    }

    pub fn is_stale(&self, name: &str) -> bool {
        self.stale.iter().any(|n| n == name)
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Diagnostic view of a single node.
#[derive(Debug, Clone, Serialize)]
pub struct NodeState {
    pub kind: NodeKind,
    pub dirty: DirtyState,
    pub stale: bool,
    pub pending: bool,
    pub frozen: bool,
    /// Last committed value, even while pending.
    pub value: Option<Value>,
    pub dependencies: Vec<String>,
    pub dependents: Vec<String>,
}

impl NodeState {
    pub(crate) fn capture(eval: &Evaluator, id: NodeId) -> Self {
        let graph = eval.graph();
        let node = &graph[id];
        Self {
            kind: node.kind(),
            dirty: node.dirty_state(),
            stale: eval.is_stale(id),
            pending: eval.is_pending(id),
            frozen: eval.is_frozen(id),
            value: node.value().cloned(),
            dependencies: node
                .dependencies()
                .iter()
                .map(|&dep| graph.name(dep).to_string())
                .collect(),
            dependents: node
                .dependents()
                .iter()
                .map(|&dep| graph.name(dep).to_string())
                .collect(),
        }
    }
}

/// One node's value change within a transaction.
#[derive(Debug, Clone, Serialize)]
pub struct NodeChange {
    pub name: String,
    /// `None` if the node had never held a value.
    pub before: Option<Value>,
    pub after: Value,
}

/// Emitted once per settled transaction.
#[derive(Debug, Clone, Serialize)]
pub struct TraceEvent {
    /// Names written, settled, or released from backoff.
    pub triggers: Vec<String>,
    /// Nodes whose committed value changed, in commit order.
    pub changes: Vec<NodeChange>,
}

impl TraceEvent {
    pub fn change(&self, name: &str) -> Option<&NodeChange> {
        self.changes.iter().find(|c| c.name == name)
    }
}
