//! Error types for the workflow crate.
//!
//! Errors are designed for layered context using rootcause:
//! - `GraphError`: graph validation failures, raised before a version runs
//! - `NodeError`: a single node attempt failed; persisted with the attempt
//! - `StoreError`: the run or definition store could not be read or written
//! - `ExecutorError`: a run pass could not make progress for infrastructure reasons
//! - `PoolError`: the executor pool refused a submission

use crate::node::NodeId;
use relayflow_core::{WorkflowRunId, WorkflowVersionId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Errors from graph validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    /// Two nodes share the same ID.
    DuplicateNode { node_id: NodeId },
    /// A node references a kind that is not registered.
    UnknownKind { node_id: NodeId, kind: String },
    /// A node's configuration was rejected by its kind.
    InvalidConfig { node_id: NodeId, reason: String },
    /// An edge references a node that does not exist.
    DanglingEdge { node_id: NodeId },
    /// An edge has a blank source handle.
    EmptyHandle { node_id: NodeId },
    /// More than one edge leaves the same `(node, handle)` pair.
    DuplicateRoute { node_id: NodeId, handle: String },
    /// The graph has no trigger node.
    MissingEntry,
    /// The graph has more than one trigger node.
    MultipleEntries { node_ids: Vec<NodeId> },
    /// A trigger node has incoming edges.
    TriggerNotAtEntry { node_id: NodeId },
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateNode { node_id } => write!(f, "duplicate node id: {node_id}"),
            Self::UnknownKind { node_id, kind } => {
                write!(f, "node {node_id} has unknown kind '{kind}'")
            }
            Self::InvalidConfig { node_id, reason } => {
                write!(f, "node {node_id} has invalid config: {reason}")
            }
            Self::DanglingEdge { node_id } => {
                write!(f, "edge references missing node {node_id}")
            }
            Self::EmptyHandle { node_id } => {
                write!(f, "node {node_id} has an edge with a blank handle")
            }
            Self::DuplicateRoute { node_id, handle } => {
                write!(f, "node {node_id} has more than one edge for handle '{handle}'")
            }
            Self::MissingEntry => write!(f, "graph has no trigger node"),
            Self::MultipleEntries { node_ids } => {
                let ids: Vec<String> = node_ids.iter().map(ToString::to_string).collect();
                write!(f, "graph has multiple trigger nodes: {}", ids.join(", "))
            }
            Self::TriggerNotAtEntry { node_id } => {
                write!(f, "trigger node {node_id} has incoming edges")
            }
        }
    }
}

impl std::error::Error for GraphError {}

/// Errors raised by a node attempt.
///
/// These are persisted inside the failed node execution record and the
/// `last_error` context sentinel, so they are serializable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum NodeError {
    /// Configuration is missing a field or has the wrong shape.
    InvalidConfig { reason: String },
    /// A condition or value expression could not be parsed.
    Expression { reason: String },
    /// An `assert` node evaluated to false.
    AssertionFailed { message: String },
    /// Input could not be parsed as JSON.
    InvalidJson { reason: String },
    /// An outbound HTTP call could not be completed.
    Http { reason: String },
    /// The completion provider could not be reached.
    Provider { reason: String },
    /// An outbound instruction could not be enqueued.
    Publish { reason: String },
}

impl NodeError {
    /// Short machine-readable code for this error.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidConfig { .. } => "invalid_config",
            Self::Expression { .. } => "expression",
            Self::AssertionFailed { .. } => "assertion_failed",
            Self::InvalidJson { .. } => "invalid_json",
            Self::Http { .. } => "http",
            Self::Provider { .. } => "provider",
            Self::Publish { .. } => "publish",
        }
    }

    /// Shorthand for [`NodeError::InvalidConfig`].
    #[must_use]
    pub fn config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }
}

impl fmt::Display for NodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidConfig { reason } => write!(f, "invalid node config: {reason}"),
            Self::Expression { reason } => write!(f, "expression error: {reason}"),
            Self::AssertionFailed { message } => write!(f, "assertion failed: {message}"),
            Self::InvalidJson { reason } => write!(f, "invalid JSON: {reason}"),
            Self::Http { reason } => write!(f, "HTTP request failed: {reason}"),
            Self::Provider { reason } => write!(f, "completion provider error: {reason}"),
            Self::Publish { reason } => write!(f, "failed to enqueue outbound work: {reason}"),
        }
    }
}

impl std::error::Error for NodeError {}

/// Errors from run and definition stores.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The backing store is unreachable or returned an error.
    Unavailable { details: String },
    /// The run does not exist.
    RunNotFound { run_id: WorkflowRunId },
    /// A conditional write lost against a concurrent writer.
    Conflict { run_id: WorkflowRunId, details: String },
    /// A stored row could not be decoded.
    Corrupt { details: String },
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unavailable { details } => write!(f, "store unavailable: {details}"),
            Self::RunNotFound { run_id } => write!(f, "run not found: {run_id}"),
            Self::Conflict { run_id, details } => {
                write!(f, "conflicting write on run {run_id}: {details}")
            }
            Self::Corrupt { details } => write!(f, "corrupt stored data: {details}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Errors that stop a run pass from making progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutorError {
    /// The run's version could not be found.
    VersionNotFound { version_id: WorkflowVersionId },
    /// Reading or persisting run state failed.
    Persistence { run_id: WorkflowRunId, details: String },
    /// Another pass took the run over; this pass must not write again.
    ClaimLost { run_id: WorkflowRunId, details: String },
    /// The run's node references a kind missing from the registry.
    UnknownKind { kind: String },
    /// The run was handed to the executor without being claimed.
    NotClaimed { run_id: WorkflowRunId },
}

impl fmt::Display for ExecutorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::VersionNotFound { version_id } => {
                write!(f, "workflow version not found: {version_id}")
            }
            Self::Persistence { run_id, details } => {
                write!(f, "failed to persist progress for run {run_id}: {details}")
            }
            Self::ClaimLost { run_id, details } => {
                write!(f, "run {run_id} is owned by another pass: {details}")
            }
            Self::UnknownKind { kind } => write!(f, "no handler registered for kind '{kind}'"),
            Self::NotClaimed { run_id } => write!(f, "run {run_id} is not in running state"),
        }
    }
}

impl std::error::Error for ExecutorError {}


/// Errors from the executor pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// The pool has been shut down.
    Closed,
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "executor pool is closed"),
        }
    }
}

impl std::error::Error for PoolError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn graph_error_display() {
        let err = GraphError::DuplicateRoute {
            node_id: NodeId::from("branch"),
            handle: "true".to_string(),
        };
        assert!(err.to_string().contains("more than one edge"));
        assert!(err.to_string().contains("'true'"));
    }

    #[test]
    fn node_error_serializes_with_code() {
        let err = NodeError::AssertionFailed {
            message: "amount must be positive".to_string(),
        };
        let json = serde_json::to_value(&err).expect("serialize");
        assert_eq!(json["code"], "assertion_failed");
        assert_eq!(err.code(), "assertion_failed");
    }

    #[test]
    fn store_error_display() {
        let run_id = WorkflowRunId::new();
        let err = StoreError::RunNotFound { run_id };
        assert!(err.to_string().contains("run not found"));
    }
}
