//! Directed acyclic graph used for plan validation and ordering.
//!
//! Internal to `datapack-flow`: the planner uses it to validate dependency
//! structure and produce a deterministic execution order; nothing outside
//! this crate depends on its shape.

use std::collections::{HashMap, VecDeque};
use std::fmt::Display;
use std::hash::Hash;

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;

use crate::error::{Error, Result};

/// A directed acyclic graph with deterministic topological sorting.
///
/// Kahn's algorithm with insertion order as the tie-breaker: the same nodes
/// and edges always produce the same order, regardless of hash seeds.
#[derive(Debug, Clone)]
pub struct Dag<T>
where
    T: Clone + Eq + Hash + Display,
{
    graph: DiGraph<T, ()>,
    index_map: HashMap<T, NodeIndex>,
    insertion_order: Vec<NodeIndex>,
}

impl<T> Dag<T>
where
    T: Clone + Eq + Hash + Display,
{
    /// Creates a new empty DAG.
    #[must_use]
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            index_map: HashMap::new(),
            insertion_order: Vec::new(),
        }
    }

    /// Returns the number of nodes.
    #[must_use]
    #[allow(dead_code)]
    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Adds a node, returning its index. Adding an existing node is a no-op.
    pub fn add_node(&mut self, value: T) -> NodeIndex {
        if let Some(&idx) = self.index_map.get(&value) {
            return idx;
        }
        let idx = self.graph.add_node(value.clone());
        self.index_map.insert(value, idx);
        self.insertion_order.push(idx);
        idx
    }

    /// Adds a directed edge `from -> to`.
    ///
    /// # Errors
    ///
    /// Returns an error if either index is invalid.
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

    /// Returns the node index for a value, if present.
    #[must_use]
    pub fn get_index(&self, value: &T) -> Option<NodeIndex> {
        self.index_map.get(value).copied()
    }

    /// Returns all nodes with no incoming edges, in insertion order.
    #[must_use]
    #[allow(dead_code)]
    pub fn roots(&self) -> Vec<T> {
        self.insertion_order
            .iter()
            .filter(|&&idx| {
                self.graph
                    .neighbors_directed(idx, Direction::Incoming)
                    .count()
                    == 0
            })
            .filter_map(|&idx| self.graph.node_weight(idx).cloned())
            .collect()
    }

    /// Returns a topologically sorted list of nodes.
    ///
    /// # Errors
    ///
    /// Returns `CycleDetected` if the graph contains a cycle; the error
    /// names a node still inside the cycle.
    pub fn toposort(&self) -> Result<Vec<T>> {
        let node_count = self.graph.node_count();
        if node_count == 0 {
            return Ok(Vec::new());
        }

        let mut in_degree: HashMap<NodeIndex, usize> = HashMap::with_capacity(node_count);
        for idx in self.graph.node_indices() {
            in_degree.insert(idx, 0);
        }
        for edge in self.graph.edge_references() {
            *in_degree.entry(edge.target()).or_insert(0) += 1;
        }

        let position: HashMap<NodeIndex, usize> = self
            .insertion_order
            .iter()
            .enumerate()
            .map(|(pos, &idx)| (idx, pos))
            .collect();

        let mut queue: VecDeque<NodeIndex> = self
            .insertion_order
            .iter()
            .filter(|&&idx| in_degree.get(&idx).copied().unwrap_or(0) == 0)
            .copied()
            .collect();

        let mut result = Vec::with_capacity(node_count);
        while let Some(idx) = queue.pop_front() {
            let node = self
                .graph
                .node_weight(idx)
                .ok_or_else(|| Error::DagNodeNotFound {
                    node: format!("index {}", idx.index()),
                })?
                .clone();
            result.push(node);

            let mut neighbors: Vec<NodeIndex> = self
                .graph
                .neighbors_directed(idx, Direction::Outgoing)
                .collect();
            neighbors.sort_by_key(|n| position.get(n).copied().unwrap_or(usize::MAX));

            for neighbor in neighbors {
                if let Some(deg) = in_degree.get_mut(&neighbor) {
                    *deg = deg.saturating_sub(1);
                    if *deg == 0 {
                        queue.push_back(neighbor);
                    }
                }
            }
        }

        if result.len() != node_count {
            let cycle_node = self
                .insertion_order
                .iter()
                .find(|&&idx| in_degree.get(&idx).copied().unwrap_or(0) > 0)
                .and_then(|&idx| self.graph.node_weight(idx))
                .map_or_else(|| "unknown".to_string(), ToString::to_string);
            return Err(Error::CycleDetected {
                cycle: vec![cycle_node],
            });
        }

        Ok(result)
    }
}

impl<T> Default for Dag<T>
where
    T: Clone + Eq + Hash + Display,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_dag_sorts_to_nothing() {
        let dag: Dag<String> = Dag::new();
        assert!(dag.toposort().unwrap().is_empty());
    }

    #[test]
    fn linear_chain_sorts_in_order() {
        let mut dag: Dag<String> = Dag::new();
        let a = dag.add_node("acquire".into());
        let b = dag.add_node("convert".into());
        let c = dag.add_node("zip".into());
        dag.add_edge(a, b).unwrap();
        dag.add_edge(b, c).unwrap();

        assert_eq!(dag.toposort().unwrap(), vec!["acquire", "convert", "zip"]);
    }

    #[test]
    fn fan_in_respects_all_upstreams() {
        let mut dag: Dag<String> = Dag::new();
        let a = dag.add_node("chain-a".into());
        let b = dag.add_node("chain-b".into());
        let f = dag.add_node("finalize".into());
        dag.add_edge(a, f).unwrap();
        dag.add_edge(b, f).unwrap();

        let sorted = dag.toposort().unwrap();
        assert_eq!(sorted.last().map(String::as_str), Some("finalize"));
    }

    #[test]
    fn cycle_is_detected() {
        let mut dag: Dag<String> = Dag::new();
        let a = dag.add_node("a".into());
        let b = dag.add_node("b".into());
        dag.add_edge(a, b).unwrap();
        dag.add_edge(b, a).unwrap();

        assert!(matches!(dag.toposort(), Err(Error::CycleDetected { .. })));
    }

    #[test]
    fn toposort_is_deterministic_across_calls() {
        let mut dag: Dag<String> = Dag::new();
        let a = dag.add_node("a".into());
        let b = dag.add_node("b".into());
        let c = dag.add_node("c".into());
        let d = dag.add_node("d".into());
        dag.add_edge(a, c).unwrap();
        dag.add_edge(b, d).unwrap();

        let first = dag.toposort().unwrap();
        assert_eq!(first, dag.toposort().unwrap());
        assert_eq!(first, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn roots_follow_insertion_order() {
        let mut dag: Dag<String> = Dag::new();
        let c = dag.add_node("c".into());
        let a = dag.add_node("a".into());
        let b = dag.add_node("b".into());
        dag.add_edge(a, c).unwrap();
        dag.add_edge(b, c).unwrap();

        assert_eq!(dag.roots(), vec!["a", "b"]);
    }
}
