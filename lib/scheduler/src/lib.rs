//! Scheduler for relayflow workflows.
//!
//! This crate provides three duties run on a fixed polling interval:
//!
//! - **Resumption**: resubmits `waiting` runs whose wait has elapsed
//! - **Recovery**: resubmits runs abandoned by a crashed process
//! - **Cron triggers**: turns due `scheduled` versions into trigger events
//!
//! Resumption latency is bounded by the polling interval.

pub mod cron_trigger;
pub mod error;
pub mod recovery;
pub mod resumption;
pub mod schedule;
pub mod scheduler;

pub use cron_trigger::{CronTriggerEvaluator, tick_event_id};
pub use error::{ScheduleError, SchedulerError};
pub use recovery::{RecoverySummary, RunRecovery};
pub use resumption::ResumptionPoller;
pub use schedule::CronSchedule;
pub use scheduler::{Scheduler, SchedulerConfig};

#[cfg(test)]
pub(crate) mod test_support {
    use async_trait::async_trait;
    use relayflow_core::WorkflowRunId;
    use relayflow_workflow::{PoolError, RunSubmitter};
    use rootcause::prelude::Report;
    use std::sync::{Mutex, PoisonError};

    /// Records submissions without executing them.
    #[derive(Default)]
    pub struct RecordingSubmitter {
        submitted: Mutex<Vec<WorkflowRunId>>,
    }

    impl RecordingSubmitter {
        pub fn submitted(&self) -> Vec<WorkflowRunId> {
            self.submitted
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        }
    }

    #[async_trait]
    impl RunSubmitter for RecordingSubmitter {
        async fn submit(&self, run_id: WorkflowRunId) -> Result<(), Report<PoolError>> {
            self.submitted
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(run_id);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use relayflow_ai::ScriptedBackend;
    use relayflow_core::TenantId;
    use relayflow_ingest::{
        EventLog, InMemoryEventLog, InMemoryMessageLookup, RateLimitConfig, SlidingWindowLimiter,
        TriggerIngestor,
    };
    use relayflow_nodes::{InMemoryOutbox, NodeServices, builtin_registry};
    use relayflow_workflow::{
        Edge, ExecutorPool, Node, PoolConfig, PublishedWorkflow, RunExecutor, RunStatus, RunStore,
        TriggerConfig, TriggerType, WorkflowDefinition, WorkflowGraph, WorkflowVersion,
        memory::{InMemoryDefinitionStore, InMemoryRunStore},
    };
    use serde_json::json;
    use std::sync::Arc;

    struct Engine {
        runs: Arc<InMemoryRunStore>,
        definitions: Arc<InMemoryDefinitionStore>,
        log: Arc<InMemoryEventLog>,
        pool: Arc<ExecutorPool>,
        ingestor: TriggerIngestor,
    }

    fn engine() -> Engine {
        let services = NodeServices {
            llm: Arc::new(ScriptedBackend::new()),
            http: reqwest::Client::new(),
            outbound: Arc::new(InMemoryOutbox::new()),
        };
        let runs = Arc::new(InMemoryRunStore::new());
        let definitions = Arc::new(InMemoryDefinitionStore::new());
        let log = Arc::new(InMemoryEventLog::new());
        let executor = Arc::new(RunExecutor::new(
            Arc::new(builtin_registry(&services)),
            runs.clone(),
            definitions.clone(),
        ));
        let pool = Arc::new(ExecutorPool::start(executor, PoolConfig::default()));
        let ingestor = TriggerIngestor::new(
            log.clone(),
            definitions.clone(),
            runs.clone(),
            Arc::new(InMemoryMessageLookup::new()),
            Arc::new(SlidingWindowLimiter::new(RateLimitConfig::default())),
            pool.clone(),
        );
        Engine {
            runs,
            definitions,
            log,
            pool,
            ingestor,
        }
    }

    fn publish(engine: &Engine, trigger: &str, config: TriggerConfig, graph: WorkflowGraph) {
        let definition = WorkflowDefinition::new(TenantId::new("t1"), "flow");
        let version =
            WorkflowVersion::published(definition.id, vec![TriggerType::from(trigger)], graph)
                .with_trigger_config(config);
        engine.definitions.insert(PublishedWorkflow {
            definition,
            version,
        });
    }

    async fn settle(engine: &Engine, status: RunStatus) {
        for _ in 0..200 {
            if engine.runs.runs().iter().all(|r| r.status == status) {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        panic!("runs did not reach {status}");
    }

    #[tokio::test]
    async fn waiting_run_resumes_and_completes() {
        let e = engine();
        let graph = WorkflowGraph::new()
            .with_node(Node::new("start", "manual"))
            .with_node(
                Node::new("pause", "wait").with_config(json!({"duration": 1, "unit": "seconds"})),
            )
            .with_node(
                Node::new("after", "set-variable").with_config(json!({"name": "resumed", "value": true})),
            )
            .with_edge(Edge::new("start", "pause"))
            .with_edge(Edge::new("pause", "after"));
        publish(&e, TriggerType::MANUAL, TriggerConfig::default(), graph);

        e.log.append(
            json!({"event_type": "manual", "tenant_id": "t1", "payload": {}, "event_id": "evt-1"})
                .to_string(),
        );
        let entry = e.log.fetch(1, std::time::Duration::from_millis(5)).await.unwrap().remove(0);
        e.ingestor.process_entry(&entry).await.unwrap();
        settle(&e, RunStatus::Waiting).await;

        let poller = ResumptionPoller::new(e.runs.clone(), e.pool.clone(), 10);
        assert_eq!(poller.poll_once(Utc::now()).await.unwrap(), 0, "not due yet");
        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
        assert_eq!(poller.poll_once(Utc::now()).await.unwrap(), 1);
        settle(&e, RunStatus::Completed).await;
        assert_eq!(poller.poll_once(Utc::now()).await.unwrap(), 0, "resumption consumed by the claim");
        e.pool.shutdown().await;

        let run = e.runs.runs().remove(0);
        assert_eq!(run.context.variables["resumed"], true);
        let records = e.runs.list_node_records(run.id).await.unwrap();
        assert_eq!(records.len(), 3, "trigger and wait are not re-run");
    }

    #[tokio::test]
    async fn cron_tick_starts_scheduled_workflow_once() {
        let e = engine();
        let graph = WorkflowGraph::new()
            .with_node(Node::new("start", "scheduled"))
            .with_node(Node::new("mark", "set-variable").with_config(json!({"name": "ran", "value": 1})))
            .with_edge(Edge::new("start", "mark"));
        publish(
            &e,
            TriggerType::SCHEDULED,
            TriggerConfig {
                cron: Some("* * * * *".to_string()),
                ..TriggerConfig::default()
            },
            graph,
        );

        let cron = CronTriggerEvaluator::new(e.definitions.clone(), e.log.clone());
        let now = Utc::now();
        // two schedulers evaluating overlapping windows
        cron.evaluate(now - Duration::minutes(2), now).await.unwrap();
        cron.evaluate(now - Duration::seconds(90), now).await.unwrap();

        let entries = e.log.fetch(10, std::time::Duration::from_millis(5)).await.unwrap();
        assert_eq!(entries.len(), 2);
        for entry in &entries {
            e.ingestor.process_entry(entry).await.unwrap();
        }
        settle(&e, RunStatus::Completed).await;
        e.pool.shutdown().await;

        let runs = e.runs.runs();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].trigger_type, "scheduled");
        assert_eq!(runs[0].context.variables["ran"], 1);
    }
}
