//! Workflow engine for the relayflow platform.
//!
//! This crate provides the core workflow execution engine, including:
//!
//! - **Graph Model**: Directed graphs using petgraph with handle-routed edges
//! - **Node Registry**: The execution contract every node kind implements
//! - **Context**: Versioned run state with a restricted expression language
//! - **Execution**: The run executor and the bounded executor pool
//! - **Stores**: Persistence traits plus in-memory implementations

pub mod context;
pub mod definition;
pub mod edge;
pub mod error;
pub mod execution;
pub mod executor;
pub mod expression;
pub mod graph;
pub mod memory;
pub mod node;
pub mod pool;
pub mod registry;
pub mod store;
pub mod template;

pub use context::{LastError, RunContext, sanitize_identifier};
pub use definition::{
    DefinitionStatus, PublishedWorkflow, TriggerConfig, TriggerType, WorkflowDefinition,
    WorkflowVersion,
};
pub use edge::{DEAD_END_HANDLE, DEFAULT_HANDLE, ERROR_HANDLE, Edge};
pub use error::{ExecutorError, GraphError, NodeError, PoolError, StoreError};
pub use execution::{
    CreateRunResult, Cursor, NodeExecutionRecord, NodeExecutionStatus, RunStatus,
    ScheduledResumption, WorkflowRun,
};
pub use executor::{ExecutorConfig, RunExecutor, RunOutcome};
pub use expression::{
    Expression, ExpressionError, Scope, evaluate_condition, evaluate_value, loose_eq, truthy,
};
pub use graph::{ValidatedGraph, WorkflowGraph};
pub use node::{Node, NodeFamily, NodeId};
pub use pool::{ExecutorPool, PoolConfig, RunSubmitter};
pub use registry::{
    NodeContext, NodeHandler, NodeOutput, NodeRegistry, NodeRegistryBuilder, Outcome, StateChange,
};
pub use store::{DefinitionStore, RunStore};
pub use template::{render, resolve_config};
