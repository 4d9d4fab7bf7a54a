//! Edge types for workflow graphs.
//!
//! An edge routes control from a source node to a target node. The source
//! side is identified by an output handle: nodes that branch emit the handle
//! of the route they chose, all other nodes emit [`DEFAULT_HANDLE`].

use crate::node::NodeId;
use serde::{Deserialize, Serialize};

/// Handle followed when a node does not choose a branch.
pub const DEFAULT_HANDLE: &str = "next";

/// Handle followed when a node attempt fails.
pub const ERROR_HANDLE: &str = "error";

/// Handle a node selects to end the run without following any edge.
/// Validation rejects blank edge handles, so it never routes.
pub const DEAD_END_HANDLE: &str = "";

fn default_handle() -> String {
    DEFAULT_HANDLE.to_string()
}

/// An edge connecting two nodes in a workflow graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    /// The node control leaves.
    pub source: NodeId,
    /// The output handle on the source node.
    #[serde(default = "default_handle", alias = "source_handle", alias = "sourceHandle")]
    pub handle: String,
    /// The node control enters.
    pub target: NodeId,
}

impl Edge {
    /// Creates an edge on the default handle.
    #[must_use]
    pub fn new(source: impl Into<NodeId>, target: impl Into<NodeId>) -> Self {
        Self {
            source: source.into(),
            handle: default_handle(),
            target: target.into(),
        }
    }

    /// Sets the source handle.
    #[must_use]
    pub fn on(mut self, handle: impl Into<String>) -> Self {
        self.handle = handle.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn handle_defaults_to_next() {
        let edge: Edge = serde_json::from_value(json!({
            "source": "a",
            "target": "b"
        }))
        .expect("deserialize");
        assert_eq!(edge.handle, DEFAULT_HANDLE);
    }

    #[test]
    fn accepts_source_handle_alias() {
        let edge: Edge = serde_json::from_value(json!({
            "source": "a",
            "sourceHandle": "true",
            "target": "b"
        }))
        .expect("deserialize");
        assert_eq!(edge, Edge::new("a", "b").on("true"));
    }
}
