//! Dependency graph used to order collections by `distributeShardsLike`.
//!
//! Edges point from a prototype to the collections that follow its shard
//! distribution, so a topological order creates prototypes first.

use std::collections::{HashMap, VecDeque};
use std::fmt::Display;
use std::hash::Hash;

use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;

use crate::error::{Error, Result};

/// Result of sorting a graph that may contain cycles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialOrder<T> {
    /// Nodes in dependency order.
    pub sorted: Vec<T>,
    /// Nodes on a cycle or downstream of one, in insertion order.
    pub blocked: Vec<T>,
}

/// A directed graph with deterministic topological ordering.
#[derive(Debug, Clone)]
pub struct Dag<T>
where
    T: Clone + Eq + Hash + Display,
{
    graph: DiGraph<T, ()>,
    index_map: HashMap<T, NodeIndex>,
    /// Insertion order for deterministic tie-breaking in toposort.
    insertion_order: Vec<NodeIndex>,
}

impl<T> Default for Dag<T>
where
    T: Clone + Eq + Hash + Display,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Dag<T>
where
    T: Clone + Eq + Hash + Display,
{
    /// Creates a new empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            index_map: HashMap::new(),
            insertion_order: Vec::new(),
        }
    }

    /// Adds a node; adding an existing value returns its index.
    pub fn add_node(&mut self, value: T) -> NodeIndex {
        if let Some(&idx) = self.index_map.get(&value) {
            return idx;
        }
        let idx = self.graph.add_node(value.clone());
        self.index_map.insert(value, idx);
        self.insertion_order.push(idx);
        idx
    }

    /// Returns the index of a value, if present.
    #[must_use]
    pub fn index_of(&self, value: &T) -> Option<NodeIndex> {
        self.index_map.get(value).copied()
    }

    /// Adds a directed edge from `from` to `to`.
    ///
    /// # Errors
    ///
    /// Returns an error if either node index is invalid.
    pub fn add_edge(&mut self, from: NodeIndex, to: NodeIndex) -> Result<()> {
        for idx in [from, to] {
            self.graph
                .node_weight(idx)
                .ok_or_else(|| Error::DagNodeNotFound {
                    node: format!("index {}", idx.index()),
                })?;
        }
        self.graph.add_edge(from, to, ());
        Ok(())
    }

    /// Sorts the graph with Kahn's algorithm, leaving cyclic parts aside.
    ///
    /// Ties between ready nodes are broken by insertion order, so equal
    /// graphs always sort the same way.
    #[must_use]
    pub fn partial_toposort(&self) -> PartialOrder<T> {
        let position: HashMap<NodeIndex, usize> = self
            .insertion_order
            .iter()
            .enumerate()
            .map(|(pos, &idx)| (idx, pos))
            .collect();

        let mut in_degree: HashMap<NodeIndex, usize> =
            self.graph.node_indices().map(|idx| (idx, 0)).collect();
        for edge in self.graph.edge_references() {
            *in_degree.entry(edge.target()).or_insert(0) += 1;
        }

        let mut queue: VecDeque<NodeIndex> = self
            .insertion_order
            .iter()
            .filter(|idx| in_degree.get(idx).copied().unwrap_or(0) == 0)
            .copied()
            .collect();

        let mut sorted = Vec::with_capacity(self.graph.node_count());
        while let Some(idx) = queue.pop_front() {
            if let Some(node) = self.graph.node_weight(idx) {
                sorted.push(node.clone());
            }

            let mut neighbors: Vec<NodeIndex> = self
                .graph
                .neighbors_directed(idx, Direction::Outgoing)
                .collect();
            neighbors.sort_by_key(|n| position.get(n).copied().unwrap_or(usize::MAX));
            neighbors.dedup();

            for neighbor in neighbors {
                if let Some(deg) = in_degree.get_mut(&neighbor) {
                    // Parallel edges count once per edge.
                    let parallel = self.graph.edges_connecting(idx, neighbor).count();
                    *deg = deg.saturating_sub(parallel);
                    if *deg == 0 {
                        queue.push_back(neighbor);
                    }
                }
            }
        }

        let blocked = self
            .insertion_order
            .iter()
            .filter(|idx| in_degree.get(idx).copied().unwrap_or(0) > 0)
            .filter_map(|&idx| self.graph.node_weight(idx).cloned())
            .collect();

        PartialOrder { sorted, blocked }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(edges: &[(&str, &str)], nodes: &[&str]) -> Dag<String> {
        let mut dag = Dag::new();
        for node in nodes {
            dag.add_node((*node).to_string());
        }
        for (from, to) in edges {
            let a = dag.add_node((*from).to_string());
            let b = dag.add_node((*to).to_string());
            dag.add_edge(a, b).unwrap();
        }
        dag
    }

    #[test]
    fn prototypes_sort_before_followers() {
        let dag = graph(&[("proto", "a"), ("proto", "b"), ("a", "c")], &["c", "b", "a"]);
        let order = dag.partial_toposort();
        assert!(order.blocked.is_empty());
        let sorted = order.sorted;
        let pos = |n: &str| sorted.iter().position(|x| x == n).unwrap();
        assert!(pos("proto") < pos("a"));
        assert!(pos("proto") < pos("b"));
        assert!(pos("a") < pos("c"));
    }

    #[test]
    fn ties_follow_insertion_order() {
        let dag = graph(&[], &["z", "a", "m"]);
        assert_eq!(dag.partial_toposort().sorted, vec!["z", "a", "m"]);
    }

    #[test]
    fn cycle_and_its_dependents_are_blocked() {
        let dag = graph(
            &[("x", "y"), ("y", "x"), ("y", "dependent"), ("free", "other")],
            &[],
        );
        let order = dag.partial_toposort();
        assert_eq!(order.sorted, vec!["free", "other"]);
        assert_eq!(order.blocked, vec!["x", "y", "dependent"]);
    }

    #[test]
    fn self_loop_is_a_cycle() {
        let dag = graph(&[("solo", "solo")], &[]);
        let order = dag.partial_toposort();
        assert!(order.sorted.is_empty());
        assert_eq!(order.blocked, vec!["solo"]);
    }

    #[test]
    fn invalid_edge_is_rejected() {
        let mut dag: Dag<String> = Dag::new();
        let a = dag.add_node("a".into());
        let err = dag.add_edge(a, NodeIndex::new(42)).unwrap_err();
        assert!(matches!(err, Error::DagNodeNotFound { .. }));
        assert_eq!(dag.index_of(&"a".to_string()), Some(a));
    }
}
