//! Workflow node types.
//!
//! A node is one step of a workflow graph. Each node has:
//! - An ID unique within its graph, chosen by the workflow author
//! - A kind naming the handler that executes it
//! - An optional display name, used as its alias in the run context
//! - Free-form JSON configuration interpreted by its kind

use crate::context::sanitize_identifier;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Identifier of a node within a workflow graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Wraps an author-supplied node identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// The family a node kind belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeFamily {
    /// Entry points; executed only as the first node of a run.
    Trigger,
    /// Control flow: branching, waiting, looping, stopping.
    Logic,
    /// Completion-backed classification and generation.
    Ai,
    /// Data manipulation and side effects.
    Utility,
}

impl NodeFamily {
    /// Returns the string representation of this family.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trigger => "trigger",
            Self::Logic => "logic",
            Self::Ai => "ai",
            Self::Utility => "utility",
        }
    }
}

/// A node in a workflow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Identifier unique within the graph.
    pub id: NodeId,
    /// Registered kind, e.g. `if-else` or `intent-detection`.
    pub kind: String,
    /// Optional human-readable name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Kind-specific configuration.
    #[serde(default)]
    pub config: JsonValue,
}

impl Node {
    /// Creates a node with empty configuration.
    #[must_use]
    pub fn new(id: impl Into<NodeId>, kind: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            name: None,
            config: JsonValue::Object(serde_json::Map::new()),
        }
    }

    /// Sets the display name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets the configuration.
    #[must_use]
    pub fn with_config(mut self, config: JsonValue) -> Self {
        self.config = config;
        self
    }

    /// Key under which this node's output is stored in the run context.
    ///
    /// Derived from the display name when present, otherwise the node ID.
    #[must_use]
    pub fn alias(&self) -> String {
        let source = self
            .name
            .as_deref()
            .filter(|n| !n.trim().is_empty())
            .unwrap_or(self.id.as_str());
        sanitize_identifier(source)
    }
}
