//! Node registry: the catalog of node kinds the executor can run.
//!
//! Each kind is implemented by a [`NodeHandler`]. Handlers receive their
//! node's configuration with templates already resolved against the run
//! context, plus a read-only view of the run, and report an [`Outcome`]
//! describing where control goes next.
//!
//! Handlers never mutate the run context directly. Any change they want
//! (variables, per-node state, clearing the error sentinel) is expressed
//! in the returned [`NodeOutput`] and applied by the executor.

use crate::context::RunContext;
use crate::error::NodeError;
use crate::node::{Node, NodeFamily};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use relayflow_core::{TenantId, WorkflowRunId};
use serde_json::{Map, Value as JsonValue};
use std::collections::HashMap;
use std::sync::Arc;

/// Change to a node's persisted per-run state.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum StateChange {
    /// Leave the state as it is.
    #[default]
    Keep,
    /// Replace the state.
    Set(JsonValue),
    /// Remove the state.
    Clear,
}

/// Result of a node that continues the run.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeOutput {
    /// Output handle to follow; `None` means the default handle.
    pub handle: Option<String>,
    /// Output value stored under the node's alias.
    pub output: JsonValue,
    /// Variables merged into the run's variable scope.
    pub variables: Map<String, JsonValue>,
    /// Change to this node's per-run state.
    pub state: StateChange,
    /// Clears the `last_error` sentinel.
    pub clears_error: bool,
}

impl NodeOutput {
    /// Output that follows the default handle.
    #[must_use]
    pub fn new(output: JsonValue) -> Self {
        Self {
            handle: None,
            output,
            variables: Map::new(),
            state: StateChange::Keep,
            clears_error: false,
        }
    }

    /// Output that follows the given handle.
    #[must_use]
    pub fn branch(handle: impl Into<String>, output: JsonValue) -> Self {
        Self {
            handle: Some(handle.into()),
            ..Self::new(output)
        }
    }

    /// Sets the handle to follow; `None` means the default handle.
    #[must_use]
    pub fn with_handle(mut self, handle: Option<String>) -> Self {
        self.handle = handle;
        self
    }

    /// Merges variables into the run scope.
    #[must_use]
    pub fn with_variables(mut self, variables: Map<String, JsonValue>) -> Self {
        self.variables.extend(variables);
        self
    }

    /// Changes this node's per-run state.
    #[must_use]
    pub fn with_state(mut self, state: StateChange) -> Self {
        self.state = state;
        self
    }

    /// Clears the `last_error` sentinel.
    #[must_use]
    pub fn clearing_error(mut self) -> Self {
        self.clears_error = true;
        self
    }
}

/// What the executor does after a node returns.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Record the output and follow a handle.
    Continue(NodeOutput),
    /// Suspend the run until `resume_at`, then follow the default handle.
    Wait {
        resume_at: DateTime<Utc>,
        output: JsonValue,
    },
    /// End the run with status `stopped`.
    Stop { reason: Option<String> },
}

impl Outcome {
    /// Continue on the default handle.
    #[must_use]
    pub fn next(output: JsonValue) -> Self {
        Self::Continue(NodeOutput::new(output))
    }

    /// Continue on a named handle.
    #[must_use]
    pub fn branch(handle: impl Into<String>, output: JsonValue) -> Self {
        Self::Continue(NodeOutput::branch(handle, output))
    }
}

/// Read-only view of the run passed to a handler.
#[derive(Debug, Clone, Copy)]
pub struct NodeContext<'a> {
    /// The run being executed.
    pub run_id: WorkflowRunId,
    /// The tenant that owns the run.
    pub tenant_id: &'a TenantId,
    /// The node being executed.
    pub node: &'a Node,
    /// Context snapshot before this node.
    pub context: &'a RunContext,
    /// Time the attempt started.
    pub now: DateTime<Utc>,
}

impl NodeContext<'_> {
    /// This node's persisted per-run state, if any.
    #[must_use]
    pub fn state(&self) -> Option<&JsonValue> {
        self.context.node_state(&self.node.id)
    }
}

/// Implementation of a node kind.
///
/// Handlers are registered once at startup and shared by all workers, so
/// they must be stateless with respect to individual runs.
#[async_trait]
pub trait NodeHandler: Send + Sync {
    /// Kind name used in graph definitions.
    fn kind(&self) -> &'static str;

    /// Family this kind belongs to.
    fn family(&self) -> NodeFamily;

    /// Checks a node's configuration when a graph is validated.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::InvalidConfig`] describing the problem.
    fn validate(&self, _config: &JsonValue) -> Result<(), NodeError> {
        Ok(())
    }

    /// Executes one attempt of the node.
    ///
    /// # Errors
    ///
    /// Returns a [`NodeError`] when the attempt fails. The executor routes
    /// the run along the node's `error` edge when one exists.
    async fn execute(&self, config: &JsonValue, ctx: &NodeContext<'_>)
    -> Result<Outcome, NodeError>;
}

/// Immutable catalog of node handlers keyed by kind.
#[derive(Clone, Default)]
pub struct NodeRegistry {
    handlers: HashMap<&'static str, Arc<dyn NodeHandler>>,
}

impl NodeRegistry {
    /// Starts building a registry.
    #[must_use]
    pub fn builder() -> NodeRegistryBuilder {
        NodeRegistryBuilder::default()
    }

    /// Looks up the handler for a kind.
    #[must_use]
    pub fn get(&self, kind: &str) -> Option<&Arc<dyn NodeHandler>> {
        self.handlers.get(kind)
    }

    /// Returns whether a kind is registered.
    #[must_use]
    pub fn contains(&self, kind: &str) -> bool {
        self.handlers.contains_key(kind)
    }

    /// Family of a registered kind.
    #[must_use]
    pub fn family(&self, kind: &str) -> Option<NodeFamily> {
        self.handlers.get(kind).map(|h| h.family())
    }

    /// Registered kinds, sorted.
    #[must_use]
    pub fn kinds(&self) -> Vec<&'static str> {
        let mut kinds: Vec<_> = self.handlers.keys().copied().collect();
        kinds.sort_unstable();
        kinds
    }

    /// Registered kinds belonging to a family, sorted.
    #[must_use]
    pub fn kinds_in(&self, family: NodeFamily) -> Vec<&'static str> {
        let mut kinds: Vec<_> = self
            .handlers
            .values()
            .filter(|h| h.family() == family)
            .map(|h| h.kind())
            .collect();
        kinds.sort_unstable();
        kinds
    }
}

impl std::fmt::Debug for NodeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

/// Builder for [`NodeRegistry`].
#[derive(Default)]
pub struct NodeRegistryBuilder {
    handlers: HashMap<&'static str, Arc<dyn NodeHandler>>,
}

impl NodeRegistryBuilder {
    /// Registers a handler. A later registration of the same kind replaces
    /// the earlier one.
    #[must_use]
    pub fn register(mut self, handler: impl NodeHandler + 'static) -> Self {
        let kind = handler.kind();
        if self.handlers.insert(kind, Arc::new(handler)).is_some() {
            tracing::warn!(kind, "node kind registered twice; keeping the later handler");
        }
        self
    }

    /// Finishes the registry.
    #[must_use]
    pub fn build(self) -> NodeRegistry {
        NodeRegistry {
            handlers: self.handlers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::registry;

    #[test]
    fn registry_lists_kinds_by_family() {
        let registry = registry();
        assert!(registry.contains("manual"));
        assert_eq!(registry.kinds_in(NodeFamily::Trigger), vec!["manual"]);
        assert!(registry.kinds().contains(&"pass"));
    }

    #[test]
    fn unknown_kind_is_absent() {
        assert!(registry().get("does-not-exist").is_none());
    }

    #[test]
    fn node_output_builders() {
        let out = NodeOutput::branch("true", JsonValue::Bool(true)).clearing_error();
        assert_eq!(out.handle.as_deref(), Some("true"));
        assert!(out.clears_error);
        assert_eq!(out.state, StateChange::Keep);
    }
}
