//! Run executor: walks a workflow graph for one claimed run.
//!
//! A pass starts at the run's cursor, or at the trigger node when there is
//! none, and for each step:
//! 1. Resolves the node's configuration against the context
//! 2. Invokes the node's handler inside a `node` tracing span
//! 3. Appends a [`NodeExecutionRecord`]
//! 4. Applies the outcome and persists the new cursor and context
//!
//! The pass ends when a handle has no outgoing edge (`completed`), a node
//! stops the run (`stopped`), a node suspends it (`waiting`), or a node
//! fails without an `error` route (`failed`). Failed nodes are never
//! retried; an `error` edge hands control to a recovery node with
//! `last_error` set instead.

use crate::context::{LastError, RunContext};
use crate::edge::{DEFAULT_HANDLE, ERROR_HANDLE};
use crate::error::{ExecutorError, NodeError, StoreError};
use crate::execution::{
    Cursor, NodeExecutionRecord, NodeExecutionStatus, RunStatus, ScheduledResumption, WorkflowRun,
};
use crate::graph::ValidatedGraph;
use crate::node::{Node, NodeFamily};
use crate::registry::{NodeContext, NodeRegistry, Outcome};
use crate::store::{DefinitionStore, RunStore};
use crate::template::resolve_config;
use chrono::{DateTime, Utc};
use relayflow_core::{NodeExecutionId, WorkflowRunId, WorkflowVersionId};
use rootcause::prelude::Report;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{Instrument, debug, info, info_span, instrument, warn};

/// Default cap on node executions in a single pass.
pub const DEFAULT_MAX_STEPS: usize = 500;

/// Executor tuning.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Node executions allowed in one pass before the run is failed.
    pub max_steps: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_steps: DEFAULT_MAX_STEPS,
        }
    }
}

/// How a pass ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// A handle had no outgoing edge.
    Completed,
    /// A `stop` node ended the run.
    Stopped { reason: Option<String> },
    /// A node suspended the run.
    Waiting { resume_at: DateTime<Utc> },
    /// A node failed without an error route, or the run was unexecutable.
    Failed { error: String },
}

impl RunOutcome {
    /// Run status this outcome leaves behind.
    #[must_use]
    pub fn status(&self) -> RunStatus {
        match self {
            Self::Completed => RunStatus::Completed,
            Self::Stopped { .. } => RunStatus::Stopped,
            Self::Waiting { .. } => RunStatus::Waiting,
            Self::Failed { .. } => RunStatus::Failed,
        }
    }
}

enum GraphLookup {
    Ready(Arc<ValidatedGraph>),
    Unusable(String),
}

/// Executes claimed runs.
pub struct RunExecutor {
    registry: Arc<NodeRegistry>,
    runs: Arc<dyn RunStore>,
    definitions: Arc<dyn DefinitionStore>,
    graphs: RwLock<HashMap<WorkflowVersionId, Arc<ValidatedGraph>>>,
    config: ExecutorConfig,
}

impl RunExecutor {
    /// Creates an executor with default tuning.
    #[must_use]
    pub fn new(
        registry: Arc<NodeRegistry>,
        runs: Arc<dyn RunStore>,
        definitions: Arc<dyn DefinitionStore>,
    ) -> Self {
        Self {
            registry,
            runs,
            definitions,
            graphs: RwLock::new(HashMap::new()),
            config: ExecutorConfig::default(),
        }
    }

    /// Sets the tuning.
    #[must_use]
    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    /// The run store this executor writes to.
    #[must_use]
    pub fn runs(&self) -> &Arc<dyn RunStore> {
        &self.runs
    }

    /// Runs one pass of a claimed run.
    ///
    /// Node failures are part of the run's outcome, not errors of this
    /// method.
    ///
    /// # Errors
    ///
    /// Returns an error if the run is not `running` or if run state could
    /// not be read or persisted. The run is left as last persisted.
    #[instrument(
        skip_all,
        fields(run_id = %run.id, tenant_id = %run.tenant_id, version_id = %run.version_id)
    )]
    pub async fn execute(&self, run: WorkflowRun) -> Result<RunOutcome, Report<ExecutorError>> {
        if run.status != RunStatus::Running {
            return Err(ExecutorError::NotClaimed { run_id: run.id }.into());
        }

        let graph = match self.graph_for(run.id, run.version_id).await? {
            GraphLookup::Ready(graph) => graph,
            GraphLookup::Unusable(reason) => {
                warn!(%reason, "run cannot be executed");
                return self.fail(run.id, &run.context, reason).await;
            }
        };

        let mut context = run.context.clone();
        let mut current = match &run.cursor {
            None => Some(graph.entry().clone()),
            Some(cursor) => graph.next(&cursor.node_id, &cursor.handle).cloned(),
        };
        let mut steps = 0;

        while let Some(node_id) = current.take() {
            if steps >= self.config.max_steps {
                let reason = format!("step budget of {} exhausted", self.config.max_steps);
                warn!(steps, "run exceeded its step budget");
                return self.fail(run.id, &context, reason).await;
            }
            steps += 1;

            let Some(node) = graph.node(&node_id) else {
                let reason = format!("cursor references missing node {node_id}");
                return self.fail(run.id, &context, reason).await;
            };
            let Some(handler) = self.registry.get(&node.kind) else {
                return Err(ExecutorError::UnknownKind {
                    kind: node.kind.clone(),
                }
                .into());
            };

            let started_at = Utc::now();
            let input = if handler.family() == NodeFamily::Trigger {
                node.config.clone()
            } else {
                resolve_config(&node.config, &context)
            };
            let result = {
                let ctx = NodeContext {
                    run_id: run.id,
                    tenant_id: &run.tenant_id,
                    node,
                    context: &context,
                    now: started_at,
                };
                let span = info_span!("node", run_id = %run.id, node_id = %node.id, kind = %node.kind);
                handler.execute(&input, &ctx).instrument(span).await
            };
            let record = Attempt {
                run_id: run.id,
                node,
                input,
                started_at,
            };

            match result {
                Ok(Outcome::Continue(step)) => {
                    let handle = step
                        .handle
                        .clone()
                        .unwrap_or_else(|| DEFAULT_HANDLE.to_string());
                    self.append(record.completed(&handle, step.output.clone()))
                        .await?;
                    context = context.apply(node, &step);
                    let cursor = Cursor::new(node.id.clone(), handle.as_str());
                    self.runs
                        .save_progress(run.id, &cursor, &context)
                        .await
                        .map_err(|e| persistence(run.id, &e))?;
                    current = graph.next(&node.id, &handle).cloned();
                    if current.is_none() {
                        debug!(node_id = %node.id, %handle, "no outgoing edge");
                    }
                }
                Ok(Outcome::Wait { resume_at, output }) => {
                    self.append(record.finished(NodeExecutionStatus::Waiting, Some(output.clone())))
                        .await?;
                    context = context.with_output(node, output);
                    let cursor = Cursor::new(node.id.clone(), DEFAULT_HANDLE);
                    let resumption = ScheduledResumption::new(run.id, node.id.clone(), resume_at);
                    self.runs
                        .suspend_run(run.id, &cursor, &context, &resumption)
                        .await
                        .map_err(|e| persistence(run.id, &e))?;
                    info!(node_id = %node.id, %resume_at, steps, "run suspended");
                    return Ok(RunOutcome::Waiting { resume_at });
                }
                Ok(Outcome::Stop { reason }) => {
                    let output = reason.clone().map(JsonValue::String);
                    self.append(record.finished(NodeExecutionStatus::Stopped, output))
                        .await?;
                    self.runs
                        .finish_run(run.id, RunStatus::Stopped, Some(&context), reason.clone())
                        .await
                        .map_err(|e| persistence(run.id, &e))?;
                    info!(node_id = %node.id, steps, "run stopped");
                    return Ok(RunOutcome::Stopped { reason });
                }
                Err(error) => {
                    warn!(node_id = %node.id, kind = %node.kind, %error, "node failed");
                    self.append(record.failed(error.clone())).await?;
                    context = context.with_last_error(LastError::new(node, error.clone(), Utc::now()));
                    match graph.next(&node.id, ERROR_HANDLE) {
                        Some(target) => {
                            let cursor = Cursor::new(node.id.clone(), ERROR_HANDLE);
                            self.runs
                                .save_progress(run.id, &cursor, &context)
                                .await
                                .map_err(|e| persistence(run.id, &e))?;
                            debug!(node_id = %node.id, %target, "routing failure to error handler");
                            current = Some(target.clone());
                        }
                        None => return self.fail(run.id, &context, error.to_string()).await,
                    }
                }
            }
        }

        self.runs
            .finish_run(run.id, RunStatus::Completed, Some(&context), None)
            .await
            .map_err(|e| persistence(run.id, &e))?;
        info!(steps, "run completed");
        Ok(RunOutcome::Completed)
    }

    async fn graph_for(
        &self,
        run_id: WorkflowRunId,
        version_id: WorkflowVersionId,
    ) -> Result<GraphLookup, Report<ExecutorError>> {
        let cached = self
            .graphs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&version_id)
            .cloned();
        if let Some(graph) = cached {
            return Ok(GraphLookup::Ready(graph));
        }

        let Some(workflow) = self
            .definitions
            .load_version(version_id)
            .await
            .map_err(|e| persistence(run_id, &e))?
        else {
            return Ok(GraphLookup::Unusable(
                ExecutorError::VersionNotFound { version_id }.to_string(),
            ));
        };

        match workflow.version.graph.validate(&self.registry) {
            Ok(graph) => {
                let graph = Arc::new(graph);
                self.graphs
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(version_id, Arc::clone(&graph));
                Ok(GraphLookup::Ready(graph))
            }
            Err(e) => Ok(GraphLookup::Unusable(format!("invalid workflow graph: {e}"))),
        }
    }

    async fn append(&self, record: NodeExecutionRecord) -> Result<(), Report<ExecutorError>> {
        self.runs
            .append_node_record(&record)
            .await
            .map_err(|e| persistence(record.run_id, &e))?;
        Ok(())
    }

    async fn fail(
        &self,
        run_id: WorkflowRunId,
        context: &RunContext,
        reason: String,
    ) -> Result<RunOutcome, Report<ExecutorError>> {
        self.runs
            .finish_run(run_id, RunStatus::Failed, Some(context), Some(reason.clone()))
            .await
            .map_err(|e| persistence(run_id, &e))?;
        info!(%reason, "run failed");
        Ok(RunOutcome::Failed { error: reason })
    }
}

fn persistence(run_id: WorkflowRunId, e: &Report<StoreError>) -> ExecutorError {
    let details = e.to_string();
    match e.current_context() {
        StoreError::Conflict { .. } => ExecutorError::ClaimLost { run_id, details },
        _ => ExecutorError::Persistence { run_id, details },
    }
}

/// Fields shared by every record of one node attempt.
struct Attempt<'a> {
    run_id: WorkflowRunId,
    node: &'a Node,
    input: JsonValue,
    started_at: DateTime<Utc>,
}

impl Attempt<'_> {
    fn finished(self, status: NodeExecutionStatus, output: Option<JsonValue>) -> NodeExecutionRecord {
        NodeExecutionRecord {
            id: NodeExecutionId::new(),
            run_id: self.run_id,
            node_id: self.node.id.clone(),
            kind: self.node.kind.clone(),
            status,
            handle: None,
            input: self.input,
            output,
            error: None,
            started_at: self.started_at,
            finished_at: Utc::now(),
        }
    }

    fn completed(self, handle: &str, output: JsonValue) -> NodeExecutionRecord {
        NodeExecutionRecord {
            handle: Some(handle.to_string()),
            ..self.finished(NodeExecutionStatus::Completed, Some(output))
        }
    }

    fn failed(self, error: NodeError) -> NodeExecutionRecord {
        NodeExecutionRecord {
            error: Some(error),
            ..self.finished(NodeExecutionStatus::Failed, None)
        }
    }
}
