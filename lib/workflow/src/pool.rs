//! Executor pool: bounded-concurrency dispatch of run passes.
//!
//! Submissions are queued on a channel. A dispatcher task takes one slot
//! from a semaphore per submission and spawns a pass that:
//! 1. Claims the run in the store (`pending`/`waiting` → `running`)
//! 2. Hands the claimed run to the [`RunExecutor`]
//!
//! Claiming is the only mutual exclusion: a submission whose claim fails
//! (another worker, or another process, owns the run) is dropped. A pass
//! whose run was released and reclaimed elsewhere stops at its next write
//! and leaves the run alone.

use crate::error::{ExecutorError, PoolError};
use crate::execution::RunStatus;
use crate::executor::RunExecutor;
use async_trait::async_trait;
use chrono::Utc;
use relayflow_core::WorkflowRunId;
use rootcause::prelude::Report;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Semaphore, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

/// Anything that accepts run IDs for execution.
#[async_trait]
pub trait RunSubmitter: Send + Sync {
    /// Queues a run for an execution pass.
    async fn submit(&self, run_id: WorkflowRunId) -> Result<(), Report<PoolError>>;
}

/// Pool sizing.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Concurrent execution passes.
    pub workers: usize,
    /// Submissions buffered before `submit` waits.
    pub queue_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 8,
            queue_capacity: 1024,
        }
    }
}

/// Bounded pool of execution slots.
pub struct ExecutorPool {
    sender: Mutex<Option<mpsc::Sender<WorkflowRunId>>>,
    dispatcher: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ExecutorPool {
    /// Starts the dispatcher on the current runtime.
    #[must_use]
    pub fn start(executor: Arc<RunExecutor>, config: PoolConfig) -> Self {
        let workers = config.workers.max(1);
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        let dispatcher = tokio::spawn(dispatch(receiver, executor, workers));
        info!(workers, "executor pool started");
        Self {
            sender: Mutex::new(Some(sender)),
            dispatcher: tokio::sync::Mutex::new(Some(dispatcher)),
        }
    }

    /// Stops accepting submissions and waits for queued and in-flight
    /// passes to finish.
    pub async fn shutdown(&self) {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = self.dispatcher.lock().await.take() {
            if let Err(e) = handle.await {
                error!(error = %e, "executor pool dispatcher panicked");
            }
        }
        info!("executor pool stopped");
    }
}

#[async_trait]
impl RunSubmitter for ExecutorPool {
    async fn submit(&self, run_id: WorkflowRunId) -> Result<(), Report<PoolError>> {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(PoolError::Closed)?;
        sender.send(run_id).await.map_err(|_| PoolError::Closed)?;
        debug!(%run_id, "run submitted");
        Ok(())
    }
}

async fn dispatch(
    mut receiver: mpsc::Receiver<WorkflowRunId>,
    executor: Arc<RunExecutor>,
    workers: usize,
) {
    let slots = Arc::new(Semaphore::new(workers));
    let mut passes = JoinSet::new();

    while let Some(run_id) = receiver.recv().await {
        let Ok(permit) = Arc::clone(&slots).acquire_owned().await else {
            break;
        };
        let executor = Arc::clone(&executor);
        passes.spawn(async move {
            let _permit = permit;
            execute_pass(&executor, run_id).await;
        });
        while passes.try_join_next().is_some() {}
    }

    while passes.join_next().await.is_some() {}
}

async fn execute_pass(executor: &RunExecutor, run_id: WorkflowRunId) {
    let run = match executor.runs().try_claim(run_id, Utc::now()).await {
        Ok(Some(run)) => run,
        Ok(None) => {
            debug!(%run_id, "run not claimable; dropping submission");
            return;
        }
        Err(e) => {
            warn!(%run_id, error = %e, "failed to claim run");
            return;
        }
    };

    match executor.execute(run).await {
        Ok(outcome) => debug!(%run_id, status = %outcome.status(), "execution pass finished"),
        Err(e) if matches!(e.current_context(), ExecutorError::ClaimLost { .. }) => {
            warn!(%run_id, error = %e, "execution pass superseded; leaving run to its owner");
        }
        Err(e) => {
            error!(%run_id, error = %e, "execution pass aborted");
            let reason = format!("execution aborted: {e}");
            if let Err(e) = executor
                .runs()
                .finish_run(run_id, RunStatus::Failed, None, Some(reason))
                .await
            {
                error!(%run_id, error = %e, "failed to mark aborted run as failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edge::Edge;
    use crate::graph::WorkflowGraph;
    use crate::memory::{InMemoryDefinitionStore, InMemoryRunStore};
    use crate::node::Node;
    use crate::store::{DefinitionStore, RunStore};
    use crate::test_support::{publish, registry};
    use crate::execution::WorkflowRun;
    use serde_json::json;

    fn setup() -> (Arc<InMemoryRunStore>, Arc<InMemoryDefinitionStore>, Arc<RunExecutor>) {
        let runs = Arc::new(InMemoryRunStore::new());
        let definitions = Arc::new(InMemoryDefinitionStore::new());
        let executor = Arc::new(RunExecutor::new(
            Arc::new(registry()),
            runs.clone() as Arc<dyn RunStore>,
            definitions.clone() as Arc<dyn DefinitionStore>,
        ));
        (runs, definitions, executor)
    }

    fn graph() -> WorkflowGraph {
        WorkflowGraph::new()
            .with_node(Node::new("start", "manual"))
            .with_node(Node::new("a", "pass"))
            .with_edge(Edge::new("start", "a"))
    }

    #[tokio::test]
    async fn concurrent_submissions_execute_once() {
        let (runs, definitions, executor) = setup();
        let workflow = publish(&definitions, graph());
        let run = WorkflowRun::new(
            workflow.definition.id,
            workflow.version.id,
            workflow.definition.tenant_id.clone(),
            "manual",
            "evt-1",
            json!({}),
        );
        runs.create_run(&run).await.unwrap();

        let pool = ExecutorPool::start(
            executor,
            PoolConfig {
                workers: 4,
                queue_capacity: 8,
            },
        );
        let (a, b) = tokio::join!(pool.submit(run.id), pool.submit(run.id));
        a.unwrap();
        b.unwrap();
        pool.shutdown().await;

        let stored = runs.get_run(run.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Completed);
        let records = runs.list_node_records(run.id).await.unwrap();
        assert_eq!(records.len(), 2, "exactly one pass ran");
    }

    #[tokio::test]
    async fn pool_runs_many_runs() {
        let (runs, definitions, executor) = setup();
        let workflow = publish(&definitions, graph());
        let pool = ExecutorPool::start(executor, PoolConfig::default());

        let mut ids = Vec::new();
        for i in 0..20 {
            let run = WorkflowRun::new(
                workflow.definition.id,
                workflow.version.id,
                workflow.definition.tenant_id.clone(),
                "manual",
                format!("evt-{i}"),
                json!({}),
            );
            runs.create_run(&run).await.unwrap();
            pool.submit(run.id).await.unwrap();
            ids.push(run.id);
        }
        pool.shutdown().await;

        for id in ids {
            let run = runs.get_run(id).await.unwrap().unwrap();
            assert_eq!(run.status, RunStatus::Completed);
        }
    }

    #[tokio::test]
    async fn submit_after_shutdown_fails() {
        let (_, _, executor) = setup();
        let pool = ExecutorPool::start(executor, PoolConfig::default());
        pool.shutdown().await;
        assert!(pool.submit(WorkflowRunId::new()).await.is_err());
    }
}
