//! Cron-driven `scheduled` triggers.
//!
//! When a scheduled version's cron expression ticks inside a poll window,
//! a direct trigger event targeted at that version is appended to the
//! trigger log; the ingestor then starts the run like any other event.
//! Only the latest tick in a window fires, so ticks missed while no
//! scheduler was running are skipped.

use crate::error::SchedulerError;
use crate::schedule::CronSchedule;
use chrono::{DateTime, Utc};
use relayflow_ingest::{DirectEvent, TriggerEvent, TriggerPublisher};
use relayflow_workflow::{DefinitionStore, PublishedWorkflow, TriggerType};
use rootcause::prelude::Report;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Deduplication identity of a cron tick.
///
/// Schedulers that evaluate the same tick produce the same id, so the
/// run is created once.
#[must_use]
pub fn tick_event_id(workflow: &PublishedWorkflow, tick: DateTime<Utc>) -> String {
    format!("cron:{}:{}", workflow.version.id, tick.timestamp())
}

/// Turns due cron ticks into trigger events.
pub struct CronTriggerEvaluator {
    definitions: Arc<dyn DefinitionStore>,
    publisher: Arc<dyn TriggerPublisher>,
}

impl CronTriggerEvaluator {
    /// Creates an evaluator publishing onto the trigger log.
    #[must_use]
    pub fn new(definitions: Arc<dyn DefinitionStore>, publisher: Arc<dyn TriggerPublisher>) -> Self {
        Self {
            definitions,
            publisher,
        }
    }

    /// Publishes one event per scheduled version that ticked in
    /// `(since, now]`; returns how many were published.
    ///
    /// Versions without a cron expression, or with an invalid one, are
    /// skipped with a warning.
    ///
    /// # Errors
    ///
    /// Returns an error if definitions cannot be listed or an event cannot
    /// be published.
    pub async fn evaluate(
        &self,
        since: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<usize, Report<SchedulerError>> {
        let scheduled = self
            .definitions
            .list_scheduled()
            .await
            .map_err(|e| SchedulerError::Store {
                details: e.to_string(),
            })?;

        let mut published = 0;
        for workflow in scheduled {
            let version_id = workflow.version.id;
            let Some(expression) = workflow.version.trigger_config.cron.as_deref() else {
                warn!(%version_id, "scheduled version has no cron expression");
                continue;
            };
            let schedule = match CronSchedule::parse(expression) {
                Ok(schedule) => schedule,
                Err(e) => {
                    warn!(%version_id, error = %e, "skipping invalid schedule");
                    continue;
                }
            };
            let Some(tick) = schedule.latest_between(since, now) else {
                continue;
            };

            let event = TriggerEvent::Direct(DirectEvent {
                event_type: TriggerType::SCHEDULED.to_string(),
                tenant_id: workflow.definition.tenant_id.clone(),
                payload: json!({
                    "scheduled_at": tick,
                    "cron": expression,
                    "workflow_id": workflow.definition.id.to_string(),
                }),
                timestamp: Some(tick),
                event_id: Some(tick_event_id(&workflow, tick)),
                version_id: Some(version_id),
            });
            self.publisher
                .publish(&event)
                .await
                .map_err(|e| SchedulerError::Publish {
                    details: e.to_string(),
                })?;
            info!(%version_id, %tick, "scheduled trigger published");
            published += 1;
        }
        debug!(published, "cron evaluation finished");
        Ok(published)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use relayflow_core::TenantId;
    use relayflow_ingest::{EventLog, InMemoryEventLog};
    use relayflow_workflow::{
        TriggerConfig, WorkflowDefinition, WorkflowGraph, WorkflowVersion,
        memory::InMemoryDefinitionStore,
    };

    fn scheduled(definitions: &InMemoryDefinitionStore, cron: Option<&str>) -> PublishedWorkflow {
        let definition = WorkflowDefinition::new(TenantId::new("t1"), "report");
        let version = WorkflowVersion::published(
            definition.id,
            vec![TriggerType::from(TriggerType::SCHEDULED)],
            WorkflowGraph::new(),
        )
        .with_trigger_config(TriggerConfig {
            cron: cron.map(str::to_string),
            ..TriggerConfig::default()
        });
        let workflow = PublishedWorkflow {
            definition,
            version,
        };
        definitions.insert(workflow.clone());
        workflow
    }

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, h, m, 0).unwrap()
    }

    #[tokio::test]
    async fn publishes_latest_tick_once_per_window() {
        let definitions = Arc::new(InMemoryDefinitionStore::new());
        let log = Arc::new(InMemoryEventLog::new());
        let workflow = scheduled(&definitions, Some("*/5 * * * *"));
        scheduled(&definitions, None);
        scheduled(&definitions, Some("not a cron"));
        let evaluator = CronTriggerEvaluator::new(definitions.clone(), log.clone());

        // window covers 09:05 and 09:10; only 09:10 fires
        assert_eq!(evaluator.evaluate(at(9, 1), at(9, 12)).await.unwrap(), 1);
        assert_eq!(evaluator.evaluate(at(9, 12), at(9, 14)).await.unwrap(), 0);

        let entries = log.fetch(10, std::time::Duration::from_millis(5)).await.unwrap();
        assert_eq!(entries.len(), 1);
        let TriggerEvent::Direct(event) = TriggerEvent::decode(&entries[0].payload).unwrap() else {
            panic!("expected direct event");
        };
        assert_eq!(event.event_type, "scheduled");
        assert_eq!(event.version_id, Some(workflow.version.id));
        assert_eq!(
            event.event_id.as_deref(),
            Some(tick_event_id(&workflow, at(9, 10)).as_str())
        );
    }

    #[tokio::test]
    async fn overlapping_windows_share_event_ids() {
        let definitions = Arc::new(InMemoryDefinitionStore::new());
        let log = Arc::new(InMemoryEventLog::new());
        scheduled(&definitions, Some("0 * * * *"));
        let evaluator = CronTriggerEvaluator::new(definitions.clone(), log.clone());

        evaluator
            .evaluate(at(9, 55), at(10, 0) + Duration::seconds(5))
            .await
            .unwrap();
        evaluator.evaluate(at(9, 58), at(10, 1)).await.unwrap();

        let entries = log.fetch(10, std::time::Duration::from_millis(5)).await.unwrap();
        let ids: Vec<_> = entries
            .iter()
            .map(|e| TriggerEvent::decode(&e.payload).unwrap().source_event_id(e.sequence))
            .collect();
        assert_eq!(ids.len(), 2);
        assert_eq!(ids[0], ids[1]);
    }
}
