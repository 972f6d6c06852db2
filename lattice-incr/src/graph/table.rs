//! Node Table
//!
//! An arena of [`Node`]s addressed by [`NodeId`], with a name index.
//! Edges are ids in both directions, never ownership.
//!
//! # Ordering
//!
//! [`Graph::topological_order`] sorts a subset of nodes so dependencies
//! come before dependents, counting only edges inside the subset (Kahn's
//! algorithm). Nodes on a cycle never reach in-degree zero; they are
//! appended at the end so the evaluator reaches them and reports the cycle.

use std::collections::{HashMap, HashSet, VecDeque};
use std::ops::{Index, IndexMut};
use std::rc::Rc;

use indexmap::IndexMap;

use super::extract::Producer;
use super::node::{Dependencies, Node, NodeId};
use crate::error::EngineError;
use crate::value::Value;

/// Name-indexed arena of nodes.
#[derive(Debug, Default)]
pub struct Graph {
    index: IndexMap<Rc<str>, NodeId>,
    nodes: Vec<Node>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_static(&mut self, name: &str, value: Value) -> Result<NodeId, EngineError> {
        let name = self.claim(name)?;
        let id = NodeId::from_index(self.nodes.len());
        self.nodes.push(Node::new_static(id, Rc::clone(&name), value));
        self.index.insert(name, id);
        Ok(id)
    }

    pub fn add_derived(&mut self, name: &str, producer: Producer) -> Result<NodeId, EngineError> {
        let name = self.claim(name)?;
        let id = NodeId::from_index(self.nodes.len());
        self.nodes
            .push(Node::new_derived(id, Rc::clone(&name), producer));
        self.index.insert(name, id);
        Ok(id)
    }

    fn claim(&self, name: &str) -> Result<Rc<str>, EngineError> {
        if self.index.contains_key(name) {
            return Err(EngineError::DuplicateName(name.to_string()));
        }
        Ok(Rc::from(name))
    }

    pub fn lookup(&self, name: &str) -> Option<NodeId> {
        self.index.get(name).copied()
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.index())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nodes in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter()
    }

    pub fn name(&self, id: NodeId) -> &str {
        self[id].name()
    }

    /// Replace a node's dependency set with the one from its latest run,
    /// updating reverse edges. A self-reference is dropped.
    pub fn set_dependencies(&mut self, node_id: NodeId, deps: Dependencies) {
        let deps: Dependencies = deps.into_iter().filter(|d| *d != node_id).collect();
        let old = self[node_id].replace_dependencies(deps.clone());

        for dep in old.iter().filter(|d| !deps.contains(*d)) {
            self[*dep].remove_dependent(node_id);
        }
        for dep in deps.iter() {
            self[*dep].add_dependent(node_id);
        }
    }

    /// Every node that transitively depends on `source`, breadth-first.
    /// `source` itself is excluded unless it sits on a cycle.
    pub fn transitive_dependents(&self, source: NodeId) -> Vec<NodeId> {
        let mut visited = HashSet::new();
        let mut order = Vec::new();
        let mut queue: VecDeque<NodeId> = self[source].dependents().iter().copied().collect();

        while let Some(node_id) = queue.pop_front() {
            if !visited.insert(node_id) {
                continue;
            }
            order.push(node_id);
            queue.extend(self[node_id].dependents().iter().copied());
        }

        order
    }

    /// Sort `subset` so dependencies come before dependents.
    pub fn topological_order(&self, subset: &[NodeId]) -> Vec<NodeId> {
        let members: HashSet<NodeId> = subset.iter().copied().collect();
        let mut in_degree: HashMap<NodeId, usize> = HashMap::with_capacity(subset.len());
        let mut queue = VecDeque::new();
        let mut result = Vec::with_capacity(subset.len());

        // Calculate in-degrees (only counting edges within the subset)
        for &node_id in subset {
            let degree = self[node_id]
                .dependencies()
                .iter()
                .filter(|d| members.contains(*d))
                .count();
            in_degree.insert(node_id, degree);
            if degree == 0 {
                queue.push_back(node_id);
            }
        }

        // Kahn's algorithm
        while let Some(node_id) = queue.pop_front() {
            result.push(node_id);

            for dependent_id in self[node_id].dependents() {
                if let Some(degree) = in_degree.get_mut(dependent_id) {
                    if *degree > 0 {
                        *degree -= 1;
                        if *degree == 0 {
                            queue.push_back(*dependent_id);
                        }
                    }
                }
            }
        }

        // Whatever is left sits on or behind a cycle.
        if result.len() < subset.len() {
            let placed: HashSet<NodeId> = result.iter().copied().collect();
            result.extend(subset.iter().filter(|id| !placed.contains(*id)));
        }

        result
    }
}

impl Index<NodeId> for Graph {
    type Output = Node;

    fn index(&self, id: NodeId) -> &Node {
        &self.nodes[id.index()]
    }
}

impl IndexMut<NodeId> for Graph {
    fn index_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.index()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> Producer {
        Producer::new(|_| Ok(Value::Null))
    }

    fn deps(ids: &[NodeId]) -> Dependencies {
        ids.iter().copied().collect()
    }

    #[test]
    fn rejects_duplicate_names() {
        let mut graph = Graph::new();
        graph.add_static("a", Value::Null).unwrap();

        assert_eq!(
            graph.add_derived("a", noop()).unwrap_err(),
            EngineError::DuplicateName("a".into())
        );
        assert_eq!(graph.len(), 1);
    }

    #[test]
    fn set_dependencies_maintains_reverse_edges() {
        let mut graph = Graph::new();
        let a = graph.add_static("a", Value::Null).unwrap();
        let b = graph.add_static("b", Value::Null).unwrap();
        let d = graph.add_derived("d", noop()).unwrap();

        graph.set_dependencies(d, deps(&[a, b, d]));
        assert_eq!(graph[d].dependencies(), &[a, b]);
        assert!(graph[a].dependents().contains(&d));
        assert!(!graph[d].dependents().contains(&d));

        // Latest run only: `a` is dropped.
        graph.set_dependencies(d, deps(&[b]));
        assert!(!graph[a].dependents().contains(&d));
        assert!(graph[b].dependents().contains(&d));
    }

    #[test]
    fn transitive_dependents_follow_chain() {
        let mut graph = Graph::new();
        let source = graph.add_static("source", Value::Null).unwrap();
        let first = graph.add_derived("first", noop()).unwrap();
        let second = graph.add_derived("second", noop()).unwrap();
        let unrelated = graph.add_derived("unrelated", noop()).unwrap();

        graph.set_dependencies(first, deps(&[source]));
        graph.set_dependencies(second, deps(&[first]));

        let reached = graph.transitive_dependents(source);
        assert_eq!(reached, vec![first, second]);
        assert!(!reached.contains(&unrelated));
    }

    #[test]
    fn topological_order_puts_dependencies_first() {
        let mut graph = Graph::new();
        let source = graph.add_static("source", Value::Null).unwrap();
        let top = graph.add_derived("top", noop()).unwrap();
        let mid = graph.add_derived("mid", noop()).unwrap();
        let low = graph.add_derived("low", noop()).unwrap();

        // Declared out of order on purpose.
        graph.set_dependencies(low, deps(&[source]));
        graph.set_dependencies(mid, deps(&[low]));
        graph.set_dependencies(top, deps(&[mid, low]));

        let order = graph.topological_order(&[top, mid, low]);
        let pos = |id| order.iter().position(|&x| x == id).unwrap();
        assert!(pos(low) < pos(mid));
        assert!(pos(mid) < pos(top));
    }

    #[test]
    fn topological_order_keeps_cycle_members() {
        let mut graph = Graph::new();
        let tick = graph.add_derived("tick", noop()).unwrap();
        let tock = graph.add_derived("tock", noop()).unwrap();
        graph.set_dependencies(tick, deps(&[tock]));
        graph.set_dependencies(tock, deps(&[tick]));

        let order = graph.topological_order(&[tick, tock]);
        assert_eq!(order.len(), 2);
    }
}
