//! In-process store implementations.
//!
//! These honor the same conditional-write rules as the Postgres stores, so
//! executor, pool, ingestor and scheduler behavior can be exercised without
//! a database.

use crate::context::RunContext;
use crate::definition::{PublishedWorkflow, TriggerType};
use crate::error::StoreError;
use crate::execution::{
    CreateRunResult, Cursor, NodeExecutionRecord, RunStatus, ScheduledResumption, WorkflowRun,
};
use crate::store::{DefinitionStore, RunStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use relayflow_core::{TenantId, WorkflowRunId, WorkflowVersionId};
use rootcause::prelude::Report;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Default)]
struct RunState {
    runs: HashMap<WorkflowRunId, WorkflowRun>,
    records: Vec<NodeExecutionRecord>,
    resumptions: Vec<ScheduledResumption>,
}

impl RunState {
    fn running_mut(&mut self, run_id: WorkflowRunId) -> Result<&mut WorkflowRun, StoreError> {
        let run = self
            .runs
            .get_mut(&run_id)
            .ok_or(StoreError::RunNotFound { run_id })?;
        if run.status != RunStatus::Running {
            return Err(StoreError::Conflict {
                run_id,
                details: format!("run is {}", run.status),
            });
        }
        Ok(run)
    }

    fn due_resumption_mut(
        &mut self,
        run_id: WorkflowRunId,
        now: DateTime<Utc>,
    ) -> Option<&mut ScheduledResumption> {
        self.resumptions
            .iter_mut()
            .find(|r| r.run_id == run_id && r.is_due(now))
    }

    fn ids_where(
        &self,
        limit: usize,
        keep: impl Fn(&WorkflowRun) -> bool,
    ) -> Vec<WorkflowRunId> {
        let mut matching: Vec<_> = self.runs.values().filter(|r| keep(r)).collect();
        matching.sort_by_key(|r| r.updated_at);
        matching.into_iter().take(limit).map(|r| r.id).collect()
    }
}

/// [`RunStore`] backed by a mutex-guarded map.
#[derive(Default)]
pub struct InMemoryRunStore {
    state: Mutex<RunState>,
}

impl InMemoryRunStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, RunState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// All runs, oldest first.
    #[must_use]
    pub fn runs(&self) -> Vec<WorkflowRun> {
        let mut runs: Vec<_> = self.state().runs.values().cloned().collect();
        runs.sort_by_key(|r| r.id);
        runs
    }

    /// All resumptions, including consumed ones.
    #[must_use]
    pub fn resumptions(&self) -> Vec<ScheduledResumption> {
        self.state().resumptions.clone()
    }
}

#[async_trait]
impl RunStore for InMemoryRunStore {
    async fn create_run(&self, run: &WorkflowRun) -> Result<CreateRunResult, Report<StoreError>> {
        let mut state = self.state();
        let duplicate = state.runs.values().find(|existing| {
            existing.version_id == run.version_id
                && existing.source_event_id == run.source_event_id
        });
        if let Some(existing) = duplicate {
            return Ok(CreateRunResult::Duplicate {
                existing: existing.id,
                status: existing.status,
            });
        }
        state.runs.insert(run.id, run.clone());
        Ok(CreateRunResult::Created)
    }

    async fn get_run(
        &self,
        run_id: WorkflowRunId,
    ) -> Result<Option<WorkflowRun>, Report<StoreError>> {
        Ok(self.state().runs.get(&run_id).cloned())
    }

    async fn find_by_source(
        &self,
        version_id: WorkflowVersionId,
        source_event_id: &str,
    ) -> Result<Option<WorkflowRun>, Report<StoreError>> {
        Ok(self
            .state()
            .runs
            .values()
            .find(|r| r.version_id == version_id && r.source_event_id == source_event_id)
            .cloned())
    }

    async fn try_claim(
        &self,
        run_id: WorkflowRunId,
        now: DateTime<Utc>,
    ) -> Result<Option<WorkflowRun>, Report<StoreError>> {
        let mut state = self.state();
        let status = state.runs.get(&run_id).map(|r| r.status);
        match status {
            Some(RunStatus::Pending) => {}
            Some(RunStatus::Waiting) => match state.due_resumption_mut(run_id, now) {
                Some(resumption) => resumption.consumed_at = Some(now),
                None => return Ok(None),
            },
            _ => return Ok(None),
        }
        let Some(run) = state.runs.get_mut(&run_id) else {
            return Ok(None);
        };
        run.status = RunStatus::Running;
        run.started_at.get_or_insert(now);
        run.updated_at = now;
        Ok(Some(run.clone()))
    }

    async fn save_progress(
        &self,
        run_id: WorkflowRunId,
        cursor: &Cursor,
        context: &RunContext,
    ) -> Result<(), Report<StoreError>> {
        let mut state = self.state();
        let run = state.running_mut(run_id)?;
        if run.context.version + 1 != context.version {
            return Err(StoreError::Conflict {
                run_id,
                details: format!(
                    "stored context version {} cannot advance to {}",
                    run.context.version, context.version
                ),
            }
            .into());
        }
        run.cursor = Some(cursor.clone());
        run.context = context.clone();
        run.updated_at = Utc::now();
        Ok(())
    }

    async fn suspend_run(
        &self,
        run_id: WorkflowRunId,
        cursor: &Cursor,
        context: &RunContext,
        resumption: &ScheduledResumption,
    ) -> Result<(), Report<StoreError>> {
        let mut state = self.state();
        let run = state.running_mut(run_id)?;
        run.status = RunStatus::Waiting;
        run.cursor = Some(cursor.clone());
        run.context = context.clone();
        run.updated_at = Utc::now();
        state.resumptions.push(resumption.clone());
        Ok(())
    }

    async fn finish_run(
        &self,
        run_id: WorkflowRunId,
        status: RunStatus,
        context: Option<&RunContext>,
        error: Option<String>,
    ) -> Result<(), Report<StoreError>> {
        let mut state = self.state();
        let run = state.running_mut(run_id)?;
        let now = Utc::now();
        run.status = status;
        if let Some(context) = context {
            run.context = context.clone();
        }
        run.error = error;
        run.updated_at = now;
        run.finished_at = Some(now);
        Ok(())
    }

    async fn append_node_record(
        &self,
        record: &NodeExecutionRecord,
    ) -> Result<(), Report<StoreError>> {
        self.state().records.push(record.clone());
        Ok(())
    }

    async fn list_node_records(
        &self,
        run_id: WorkflowRunId,
    ) -> Result<Vec<NodeExecutionRecord>, Report<StoreError>> {
        Ok(self
            .state()
            .records
            .iter()
            .filter(|r| r.run_id == run_id)
            .cloned()
            .collect())
    }

    async fn due_resumptions(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ScheduledResumption>, Report<StoreError>> {
        let state = self.state();
        let mut due: Vec<_> = state
            .resumptions
            .iter()
            .filter(|r| r.is_due(now))
            .filter(|r| {
                state
                    .runs
                    .get(&r.run_id)
                    .is_some_and(|run| run.status == RunStatus::Waiting)
            })
            .cloned()
            .collect();
        due.sort_by_key(|r| r.resume_at);
        due.truncate(limit);
        Ok(due)
    }

    async fn release_stalled(
        &self,
        stalled_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WorkflowRunId>, Report<StoreError>> {
        let mut state = self.state();
        let stalled = state.ids_where(limit, |r| {
            r.status == RunStatus::Running && r.updated_at < stalled_before
        });
        let now = Utc::now();
        for run_id in &stalled {
            if let Some(run) = state.runs.get_mut(run_id) {
                run.status = RunStatus::Pending;
                run.updated_at = now;
            }
        }
        Ok(stalled)
    }

    async fn stale_pending(
        &self,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WorkflowRunId>, Report<StoreError>> {
        Ok(self
            .state()
            .ids_where(limit, |r| r.status == RunStatus::Pending && r.updated_at < before))
    }

    async fn count_runs_since(
        &self,
        tenant_id: &TenantId,
        since: DateTime<Utc>,
    ) -> Result<u64, Report<StoreError>> {
        let count = self
            .state()
            .runs
            .values()
            .filter(|r| &r.tenant_id == tenant_id && r.created_at >= since)
            .count();
        Ok(count as u64)
    }
}

/// [`DefinitionStore`] over a fixed list of published workflows.
#[derive(Default)]
pub struct InMemoryDefinitionStore {
    workflows: Mutex<Vec<PublishedWorkflow>>,
}

impl InMemoryDefinitionStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a workflow by version ID.
    pub fn insert(&self, workflow: PublishedWorkflow) {
        let mut workflows = self.workflows.lock().unwrap_or_else(PoisonError::into_inner);
        workflows.retain(|w| w.version.id != workflow.version.id);
        workflows.push(workflow);
    }

    fn snapshot(&self) -> Vec<PublishedWorkflow> {
        self.workflows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl DefinitionStore for InMemoryDefinitionStore {
    async fn find_active(
        &self,
        tenant_id: &TenantId,
        trigger_type: &TriggerType,
    ) -> Result<Vec<PublishedWorkflow>, Report<StoreError>> {
        Ok(self
            .snapshot()
            .into_iter()
            .filter(|w| w.matches(tenant_id, trigger_type))
            .collect())
    }

    async fn load_version(
        &self,
        version_id: WorkflowVersionId,
    ) -> Result<Option<PublishedWorkflow>, Report<StoreError>> {
        Ok(self
            .snapshot()
            .into_iter()
            .find(|w| w.version.id == version_id))
    }

    async fn list_scheduled(&self) -> Result<Vec<PublishedWorkflow>, Report<StoreError>> {
        let scheduled = TriggerType::from(TriggerType::SCHEDULED);
        Ok(self
            .snapshot()
            .into_iter()
            .filter(|w| {
                w.definition.is_active() && w.version.published && w.version.accepts(&scheduled)
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use relayflow_core::{WorkflowId, WorkflowVersionId};
    use serde_json::json;

    fn pending_run(source: &str) -> WorkflowRun {
        WorkflowRun::new(
            WorkflowId::new(),
            WorkflowVersionId::from_ulid(ulid::Ulid::from_parts(1, 1)),
            TenantId::new("t1"),
            "manual",
            source,
            json!({}),
        )
    }

    #[tokio::test]
    async fn create_run_dedups_on_source_event() {
        let store = InMemoryRunStore::new();
        let first = pending_run("evt-1");
        let redelivered = pending_run("evt-1");
        assert_eq!(store.create_run(&first).await.unwrap(), CreateRunResult::Created);
        assert_eq!(
            store.create_run(&redelivered).await.unwrap(),
            CreateRunResult::Duplicate {
                existing: first.id,
                status: RunStatus::Pending,
            }
        );
        assert_eq!(store.runs().len(), 1);
    }

    #[tokio::test]
    async fn claim_is_exclusive() {
        let store = InMemoryRunStore::new();
        let run = pending_run("evt-1");
        store.create_run(&run).await.unwrap();

        assert!(store.try_claim(run.id, Utc::now()).await.unwrap().is_some());
        assert!(store.try_claim(run.id, Utc::now()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn save_progress_rejects_stale_version() {
        let store = InMemoryRunStore::new();
        let run = pending_run("evt-1");
        store.create_run(&run).await.unwrap();
        store.try_claim(run.id, Utc::now()).await.unwrap();

        let cursor = Cursor::new("a".into(), "next");
        let mut ctx = run.context.clone();
        ctx.version = 1;
        store.save_progress(run.id, &cursor, &ctx).await.unwrap();
        assert!(store.save_progress(run.id, &cursor, &ctx).await.is_err());
    }

    #[tokio::test]
    async fn claiming_a_waiting_run_consumes_its_due_resumption() {
        let store = InMemoryRunStore::new();
        let run = pending_run("evt-1");
        store.create_run(&run).await.unwrap();
        store.try_claim(run.id, Utc::now()).await.unwrap();

        let resume_at = Utc::now() + Duration::minutes(5);
        let resumption = ScheduledResumption::new(run.id, "wait".into(), resume_at);
        let cursor = Cursor::new("wait".into(), "next");
        store
            .suspend_run(run.id, &cursor, &run.context, &resumption)
            .await
            .unwrap();

        assert!(store.try_claim(run.id, Utc::now()).await.unwrap().is_none(), "not due");
        assert_eq!(store.due_resumptions(resume_at, 10).await.unwrap().len(), 1);

        let claimed = store.try_claim(run.id, resume_at).await.unwrap();
        assert_eq!(claimed.map(|r| r.status), Some(RunStatus::Running));
        assert!(store.resumptions()[0].consumed_at.is_some());
        assert!(store.due_resumptions(resume_at, 10).await.unwrap().is_empty());
        assert!(store.try_claim(run.id, resume_at).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stalled_running_run_is_released_for_reclaim() {
        let store = InMemoryRunStore::new();
        let run = pending_run("evt-1");
        store.create_run(&run).await.unwrap();
        store.try_claim(run.id, Utc::now()).await.unwrap();

        let now = Utc::now();
        assert!(store.release_stalled(now - Duration::minutes(10), 10).await.unwrap().is_empty());
        let released = store.release_stalled(now + Duration::seconds(1), 10).await.unwrap();
        assert_eq!(released, vec![run.id]);
        assert_eq!(store.get_run(run.id).await.unwrap().unwrap().status, RunStatus::Pending);
        assert!(store.try_claim(run.id, Utc::now()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn stale_pending_lists_only_old_pending_runs() {
        let store = InMemoryRunStore::new();
        let old = pending_run("evt-1");
        store.create_run(&old).await.unwrap();
        let claimed = pending_run("evt-2");
        store.create_run(&claimed).await.unwrap();
        store.try_claim(claimed.id, Utc::now()).await.unwrap();

        let later = Utc::now() + Duration::minutes(1);
        assert_eq!(store.stale_pending(later, 10).await.unwrap(), vec![old.id]);
        assert!(store.stale_pending(old.updated_at, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn find_by_source_returns_existing_run() {
        let store = InMemoryRunStore::new();
        let run = pending_run("evt-1");
        store.create_run(&run).await.unwrap();
        let found = store.find_by_source(run.version_id, "evt-1").await.unwrap();
        assert_eq!(found.map(|r| r.id), Some(run.id));
        assert!(store.find_by_source(run.version_id, "evt-2").await.unwrap().is_none());
    }
}
