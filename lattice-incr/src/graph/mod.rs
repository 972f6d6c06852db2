//! Dependency Graph
//!
//! Node storage, dependency discovery, and the declarations an engine is
//! built from.
//!
//! # Overview
//!
//! - Nodes are static (written from outside) or derived (computed by a
//!   producer from other nodes).
//! - Edges point from a dependency to its dependents and are discovered
//!   by running the producer, never declared.
//! - The graph is not required to be acyclic. A cycle surfaces only when
//!   evaluation actually walks it.
//!
//! # Design Decisions
//!
//! 1. Nodes live in an arena indexed by [`NodeId`]; edges are ids, so the
//!    graph owns no reference cycles.
//!
//! 2. Both forward (dependencies) and reverse (dependents) edges are kept,
//!    for verification upstream and invalidation downstream.

mod extract;
mod node;
mod table;

use indexmap::IndexMap;

pub(crate) use extract::{extract, Interrupt, Settled, Settlement, SettlementSink};
pub use extract::{Accessor, Output, Producer, Settler};
pub use node::{Dependencies, DirtyState, Node, NodeId, NodeKind};
pub use table::Graph;

use crate::error::ComputeError;
use crate::value::Value;

/// How one name is defined.
#[derive(Debug, Clone)]
pub enum Declaration {
    Static(Value),
    Derived(Producer),
}

/// Ordered set of declarations. Redeclaring a name replaces it.
///
/// ```rust
/// use lattice_incr::{Declarations, Value};
///
/// let decls = Declarations::new()
///     .value("data", Value::Null)
///     .derived("count", |acc| {
///         let data = acc.get("data")?;
///         Ok(Value::from(data.len().unwrap_or(0)))
///     });
/// assert_eq!(decls.len(), 2);
/// ```
#[derive(Debug, Clone, Default)]
pub struct Declarations {
    entries: IndexMap<String, Declaration>,
}

impl Declarations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a static node.
    pub fn value(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.entries
            .insert(name.into(), Declaration::Static(value.into()));
        self
    }

    /// Declare a derived node with a synchronous producer.
    pub fn derived<F>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&mut Accessor<'_>) -> Result<Value, ComputeError> + 'static,
    {
        self.producer(name, Producer::new(f))
    }

    /// Declare a derived node whose value is delivered through a [`Settler`].
    pub fn deferred<F>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&mut Accessor<'_>, Settler) -> Result<(), ComputeError> + 'static,
    {
        self.producer(name, Producer::deferred(f))
    }

    pub fn producer(mut self, name: impl Into<String>, producer: Producer) -> Self {
        self.entries
            .insert(name.into(), Declaration::Derived(producer));
        self
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl IntoIterator for Declarations {
    type Item = (String, Declaration);
    type IntoIter = indexmap::map::IntoIter<String, Declaration>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redeclaring_replaces_in_place() {
        let decls = Declarations::new()
            .value("a", 1)
            .value("b", 2)
            .derived("a", |_| Ok(Value::Null));

        let names: Vec<&str> = decls.names().collect();
        assert_eq!(names, vec!["a", "b"]);
        let (_, first) = decls.into_iter().next().unwrap();
        assert!(matches!(first, Declaration::Derived(_)));
    }
}
