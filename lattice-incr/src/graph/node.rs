//! Graph Nodes
//!
//! This module defines the node types that live in the dependency graph.

use std::fmt;
use std::rc::Rc;

use indexmap::IndexSet;
use serde::Serialize;
use smallvec::SmallVec;

use super::extract::Producer;
use crate::value::Value;

/// Index of a node in its graph's arena.
///
/// Ids are only meaningful within the graph that issued them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u32);

impl NodeId {
    pub(crate) fn from_index(index: usize) -> Self {
        Self(index as u32)
    }

    /// Position in the arena.
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

/// The kind of node in the dependency graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NodeKind {
    /// Written only from outside the graph.
    Static,

    /// Written only by the evaluator, from its producer.
    Derived,
}

/// Dirty state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DirtyState {
    /// The node's value is up-to-date.
    Clean,

    /// Something upstream changed. The node recomputes only if one of its
    /// own dependencies turns out to have changed.
    MaybeDirty,

    /// The node definitely needs to recompute: it has never run, or a
    /// direct dependency changed.
    Dirty,
}

/// Dependency list. Most producers read a handful of names.
pub type Dependencies = SmallVec<[NodeId; 4]>;

/// A node in the dependency graph.
pub struct Node {
    id: NodeId,
    name: Rc<str>,
    kind: NodeKind,
    dirty: DirtyState,

    /// Names read during the most recent run, in read order.
    dependencies: Dependencies,

    /// Nodes whose latest run read this node.
    dependents: IndexSet<NodeId>,

    /// Committed value. `None` until the first commit.
    pub(crate) value: Option<Value>,
    pub(crate) producer: Option<Producer>,

    /// Revision at which the committed value last changed.
    pub(crate) changed_at: u64,
    /// Revision at which the node last observed its inputs.
    pub(crate) verified_at: u64,
    /// Count of producer runs, used to match async settlements.
    pub(crate) generation: u64,
}

impl Node {
    pub(crate) fn new_static(id: NodeId, name: Rc<str>, value: Value) -> Self {
        Self {
            id,
            name,
            kind: NodeKind::Static,
            dirty: DirtyState::Clean,
            dependencies: Dependencies::new(),
            dependents: IndexSet::new(),
            value: Some(value),
            producer: None,
            changed_at: 0,
            verified_at: 0,
            generation: 0,
        }
    }

    pub(crate) fn new_derived(id: NodeId, name: Rc<str>, producer: Producer) -> Self {
        Self {
            id,
            name,
            kind: NodeKind::Derived,
            // Start dirty to ensure first computation
            dirty: DirtyState::Dirty,
            dependencies: Dependencies::new(),
            dependents: IndexSet::new(),
            value: None,
            producer: Some(producer),
            changed_at: 0,
            verified_at: 0,
            generation: 0,
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn shared_name(&self) -> Rc<str> {
        Rc::clone(&self.name)
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn is_derived(&self) -> bool {
        self.kind == NodeKind::Derived
    }

    pub fn value(&self) -> Option<&Value> {
        self.value.as_ref()
    }

    pub fn dirty_state(&self) -> DirtyState {
        self.dirty
    }

    pub fn is_clean(&self) -> bool {
        self.dirty == DirtyState::Clean
    }

    pub fn mark_clean(&mut self) {
        self.dirty = DirtyState::Clean;
    }

    /// Never downgrades `Dirty`.
    pub fn mark_maybe_dirty(&mut self) {
        if self.dirty == DirtyState::Clean {
            self.dirty = DirtyState::MaybeDirty;
        }
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = DirtyState::Dirty;
    }

    pub fn dependencies(&self) -> &[NodeId] {
        &self.dependencies
    }

    pub fn dependents(&self) -> &IndexSet<NodeId> {
        &self.dependents
    }

    /// Swap in a new dependency list, returning the old one.
    pub(crate) fn replace_dependencies(&mut self, deps: Dependencies) -> Dependencies {
        std::mem::replace(&mut self.dependencies, deps)
    }

    pub(crate) fn add_dependent(&mut self, node_id: NodeId) {
        self.dependents.insert(node_id);
    }

    pub(crate) fn remove_dependent(&mut self, node_id: NodeId) {
        self.dependents.shift_remove(&node_id);
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("dirty", &self.dirty)
            .field("dependencies", &self.dependencies)
            .field("value", &self.value)
            .finish()
    }
}
