//! Workflow graph implementation using petgraph.
//!
//! Workflows are directed graphs where:
//! - Nodes are workflow steps of a registered kind
//! - Edges route control from a source node's output handle to a target
//!
//! The authored graph ([`WorkflowGraph`]) is stored as JSONB in the
//! database. Before a version is executed it is validated against the node
//! registry, producing a [`ValidatedGraph`] with O(1) route lookup.
//!
//! Cycles are allowed: loop bodies route back to their `loop` node. Runs are
//! bounded by the executor's step budget instead.

use crate::edge::Edge;
use crate::error::GraphError;
use crate::node::{Node, NodeFamily, NodeId};
use crate::registry::NodeRegistry;
use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A workflow graph as authored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowGraph {
    /// The graph's nodes.
    #[serde(default)]
    pub nodes: Vec<Node>,
    /// The graph's edges.
    #[serde(default)]
    pub edges: Vec<Edge>,
}

impl WorkflowGraph {
    /// Creates an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a node.
    #[must_use]
    pub fn with_node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    /// Adds an edge.
    #[must_use]
    pub fn with_edge(mut self, edge: Edge) -> Self {
        self.edges.push(edge);
        self
    }

    /// Kinds of the graph's trigger nodes, in node order.
    pub fn trigger_kinds<'a>(
        &'a self,
        registry: &'a NodeRegistry,
    ) -> impl Iterator<Item = &'a str> + 'a {
        self.nodes
            .iter()
            .filter(|n| {
                registry
                    .get(&n.kind)
                    .is_some_and(|h| h.family() == NodeFamily::Trigger)
            })
            .map(|n| n.kind.as_str())
    }

    /// Validates the graph against the registry.
    ///
    /// Checks:
    /// - Node IDs are unique
    /// - Every node's kind is registered and accepts its configuration
    /// - Every edge connects existing nodes
    /// - At most one edge leaves each `(node, handle)` pair
    /// - There is exactly one trigger node, and nothing routes into it
    ///
    /// # Errors
    ///
    /// Returns the first validation failure found.
    pub fn validate(&self, registry: &NodeRegistry) -> Result<ValidatedGraph, GraphError> {
        let mut graph = DiGraph::new();
        let mut index = HashMap::new();
        let mut nodes = HashMap::new();
        let mut triggers = Vec::new();

        for node in &self.nodes {
            if nodes.contains_key(&node.id) {
                return Err(GraphError::DuplicateNode {
                    node_id: node.id.clone(),
                });
            }
            let handler = registry
                .get(&node.kind)
                .ok_or_else(|| GraphError::UnknownKind {
                    node_id: node.id.clone(),
                    kind: node.kind.clone(),
                })?;
            handler
                .validate(&node.config)
                .map_err(|e| GraphError::InvalidConfig {
                    node_id: node.id.clone(),
                    reason: e.to_string(),
                })?;
            if handler.family() == NodeFamily::Trigger {
                triggers.push(node.id.clone());
            }
            index.insert(node.id.clone(), graph.add_node(node.id.clone()));
            nodes.insert(node.id.clone(), node.clone());
        }

        let mut routes = HashMap::new();
        for edge in &self.edges {
            let source = *index.get(&edge.source).ok_or_else(|| GraphError::DanglingEdge {
                node_id: edge.source.clone(),
            })?;
            let target = *index.get(&edge.target).ok_or_else(|| GraphError::DanglingEdge {
                node_id: edge.target.clone(),
            })?;
            if edge.handle.trim().is_empty() {
                return Err(GraphError::EmptyHandle {
                    node_id: edge.source.clone(),
                });
            }
            let key = (edge.source.clone(), edge.handle.clone());
            if routes.insert(key, edge.target.clone()).is_some() {
                return Err(GraphError::DuplicateRoute {
                    node_id: edge.source.clone(),
                    handle: edge.handle.clone(),
                });
            }
            graph.add_edge(source, target, edge.handle.clone());
        }

        let entry = match triggers.as_slice() {
            [] => return Err(GraphError::MissingEntry),
            [entry] => entry.clone(),
            _ => return Err(GraphError::MultipleEntries { node_ids: triggers }),
        };
        if graph
            .edges_directed(index[&entry], Direction::Incoming)
            .next()
            .is_some()
        {
            return Err(GraphError::TriggerNotAtEntry { node_id: entry });
        }

        Ok(ValidatedGraph {
            graph,
            index,
            nodes,
            routes,
            entry,
        })
    }
}

/// A graph that passed validation.
#[derive(Debug, Clone)]
pub struct ValidatedGraph {
    graph: DiGraph<NodeId, String>,
    index: HashMap<NodeId, NodeIndex>,
    nodes: HashMap<NodeId, Node>,
    routes: HashMap<(NodeId, String), NodeId>,
    entry: NodeId,
}

impl ValidatedGraph {
    /// The trigger node where runs start.
    #[must_use]
    pub fn entry(&self) -> &NodeId {
        &self.entry
    }

    /// Looks up a node by ID.
    #[must_use]
    pub fn node(&self, node_id: &NodeId) -> Option<&Node> {
        self.nodes.get(node_id)
    }

    /// The node an edge from `(node_id, handle)` leads to.
    #[must_use]
    pub fn next(&self, node_id: &NodeId, handle: &str) -> Option<&NodeId> {
        self.routes.get(&(node_id.clone(), handle.to_string()))
    }

    /// Returns whether `(node_id, handle)` has an outgoing edge.
    #[must_use]
    pub fn has_route(&self, node_id: &NodeId, handle: &str) -> bool {
        self.next(node_id, handle).is_some()
    }

    /// Number of nodes.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Handles leaving a node, sorted.
    #[must_use]
    pub fn handles(&self, node_id: &NodeId) -> Vec<&str> {
        let Some(&idx) = self.index.get(node_id) else {
            return Vec::new();
        };
        let mut handles: Vec<&str> = self
            .graph
            .edges_directed(idx, Direction::Outgoing)
            .map(|e| e.weight().as_str())
            .collect();
        handles.sort_unstable();
        handles
    }

    /// Returns whether the graph contains a cycle.
    #[must_use]
    pub fn is_cyclic(&self) -> bool {
        petgraph::algo::is_cyclic_directed(&self.graph)
    }

    /// Number of nodes on the longest path from the entry node.
    ///
    /// Returns `None` when the graph is cyclic. For acyclic graphs this
    /// bounds the node executions of any single run.
    #[must_use]
    pub fn longest_path(&self) -> Option<usize> {
        let order = petgraph::algo::toposort(&self.graph, None).ok()?;
        let mut depth: HashMap<NodeIndex, usize> = HashMap::new();
        depth.insert(self.index[&self.entry], 1);
        let mut longest = 1;
        for idx in order {
            let Some(&d) = depth.get(&idx) else {
                continue;
            };
            longest = longest.max(d);
            for edge in self.graph.edges_directed(idx, Direction::Outgoing) {
                let slot = depth.entry(edge.target()).or_insert(0);
                *slot = (*slot).max(d + 1);
            }
        }
        Some(longest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::registry;
    use serde_json::json;

    fn linear() -> WorkflowGraph {
        WorkflowGraph::new()
            .with_node(Node::new("start", "manual"))
            .with_node(Node::new("a", "pass"))
            .with_node(Node::new("b", "pass"))
            .with_edge(Edge::new("start", "a"))
            .with_edge(Edge::new("a", "b"))
    }

    #[test]
    fn validates_linear_graph() {
        let graph = linear().validate(&registry()).expect("valid");
        assert_eq!(graph.entry().as_str(), "start");
        assert_eq!(graph.next(&"start".into(), "next"), Some(&NodeId::from("a")));
        assert!(graph.next(&"b".into(), "next").is_none());
        assert_eq!(graph.longest_path(), Some(3));
        assert!(!graph.is_cyclic());
    }

    #[test]
    fn rejects_unknown_kind() {
        let graph = linear().with_node(Node::new("x", "teleport"));
        assert!(matches!(
            graph.validate(&registry()),
            Err(GraphError::UnknownKind { kind, .. }) if kind == "teleport"
        ));
    }

    #[test]
    fn rejects_duplicate_route() {
        let graph = linear()
            .with_node(Node::new("c", "pass"))
            .with_edge(Edge::new("a", "c"));
        assert!(matches!(
            graph.validate(&registry()),
            Err(GraphError::DuplicateRoute { handle, .. }) if handle == "next"
        ));
    }

    #[test]
    fn rejects_empty_handle() {
        let graph = linear()
            .with_node(Node::new("c", "pass"))
            .with_edge(Edge::new("b", "c").on(" "));
        assert!(matches!(
            graph.validate(&registry()),
            Err(GraphError::EmptyHandle { node_id }) if node_id.as_str() == "b"
        ));
    }

    #[test]
    fn rejects_dangling_edge() {
        let graph = linear().with_edge(Edge::new("b", "ghost"));
        assert!(matches!(
            graph.validate(&registry()),
            Err(GraphError::DanglingEdge { node_id }) if node_id.as_str() == "ghost"
        ));
    }

    #[test]
    fn requires_single_trigger_entry() {
        let none = WorkflowGraph::new().with_node(Node::new("a", "pass"));
        assert_eq!(none.validate(&registry()).unwrap_err(), GraphError::MissingEntry);

        let two = linear().with_node(Node::new("start2", "manual"));
        assert!(matches!(
            two.validate(&registry()),
            Err(GraphError::MultipleEntries { .. })
        ));

        let into_trigger = linear().with_edge(Edge::new("b", "start"));
        assert!(matches!(
            into_trigger.validate(&registry()),
            Err(GraphError::TriggerNotAtEntry { .. })
        ));
    }

    #[test]
    fn rejects_invalid_config() {
        let graph = linear().with_node(Node::new("br", "branch").with_config(json!({})));
        assert!(matches!(
            graph.validate(&registry()),
            Err(GraphError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn branching_graph_longest_path() {
        let graph = WorkflowGraph::new()
            .with_node(Node::new("start", "manual"))
            .with_node(Node::new("br", "branch").with_config(json!({"handle": "true"})))
            .with_node(Node::new("short", "pass"))
            .with_node(Node::new("long1", "pass"))
            .with_node(Node::new("long2", "pass"))
            .with_edge(Edge::new("start", "br"))
            .with_edge(Edge::new("br", "short").on("false"))
            .with_edge(Edge::new("br", "long1").on("true"))
            .with_edge(Edge::new("long1", "long2"))
            .validate(&registry())
            .expect("valid");
        assert_eq!(graph.longest_path(), Some(4));
        assert_eq!(graph.handles(&"br".into()), vec!["false", "true"]);
    }

    #[test]
    fn cyclic_graph_has_no_longest_path() {
        let graph = linear()
            .with_edge(Edge::new("b", "a").on("again"))
            .validate(&registry())
            .expect("cycles are allowed");
        assert!(graph.is_cyclic());
        assert_eq!(graph.longest_path(), None);
    }

    #[test]
    fn graph_round_trips_through_json() {
        let json = serde_json::to_value(linear()).expect("serialize");
        let back: WorkflowGraph = serde_json::from_value(json).expect("deserialize");
        assert_eq!(back, linear());
    }
}
