//! Persistence seams for runs and workflow definitions.
//!
//! The engine binary implements these against Postgres; [`crate::memory`]
//! provides in-process implementations for tests and local development.
//!
//! Conditional writes carry the concurrency guarantees of the engine:
//! - [`RunStore::create_run`] is idempotent on `(version_id, source_event_id)`
//! - [`RunStore::try_claim`] is the single-writer guard for execution passes
//!   and consumes a waiting run's resumption in the same write
//! - [`RunStore::save_progress`] rejects stale context versions
//! - [`RunStore::release_stalled`] hands abandoned passes back through the
//!   same guard

use crate::context::RunContext;
use crate::definition::{PublishedWorkflow, TriggerType};
use crate::error::StoreError;
use crate::execution::{
    CreateRunResult, Cursor, NodeExecutionRecord, RunStatus, ScheduledResumption, WorkflowRun,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use relayflow_core::{TenantId, WorkflowRunId, WorkflowVersionId};
use rootcause::prelude::Report;

/// Storage for runs, node execution records and scheduled resumptions.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Stores a new pending run.
    ///
    /// Returns [`CreateRunResult::Duplicate`] without writing when a run for
    /// the same version and source event already exists.
    async fn create_run(&self, run: &WorkflowRun) -> Result<CreateRunResult, Report<StoreError>>;

    /// Loads a run.
    async fn get_run(&self, run_id: WorkflowRunId)
    -> Result<Option<WorkflowRun>, Report<StoreError>>;

    /// Loads the run created for a version and source event, if any.
    async fn find_by_source(
        &self,
        version_id: WorkflowVersionId,
        source_event_id: &str,
    ) -> Result<Option<WorkflowRun>, Report<StoreError>>;

    /// Moves a run to `running` and returns it.
    ///
    /// A `pending` run is always claimable. A `waiting` run is claimable
    /// only while its resumption is outstanding and due at `now`; the
    /// resumption is consumed by the same conditional write.
    ///
    /// Returns `None` when another worker holds the run, when it is
    /// terminal, or when its wait has not elapsed.
    async fn try_claim(
        &self,
        run_id: WorkflowRunId,
        now: DateTime<Utc>,
    ) -> Result<Option<WorkflowRun>, Report<StoreError>>;

    /// Persists the cursor and context of a running run.
    ///
    /// Fails with [`StoreError::Conflict`] unless the stored context version
    /// is exactly one behind `context.version`.
    async fn save_progress(
        &self,
        run_id: WorkflowRunId,
        cursor: &Cursor,
        context: &RunContext,
    ) -> Result<(), Report<StoreError>>;

    /// Atomically stores a resumption and moves the run to `waiting`.
    async fn suspend_run(
        &self,
        run_id: WorkflowRunId,
        cursor: &Cursor,
        context: &RunContext,
        resumption: &ScheduledResumption,
    ) -> Result<(), Report<StoreError>>;

    /// Moves a running run to a terminal status.
    ///
    /// When `context` is `None` the stored context is kept.
    async fn finish_run(
        &self,
        run_id: WorkflowRunId,
        status: RunStatus,
        context: Option<&RunContext>,
        error: Option<String>,
    ) -> Result<(), Report<StoreError>>;

    /// Appends a node execution record.
    async fn append_node_record(
        &self,
        record: &NodeExecutionRecord,
    ) -> Result<(), Report<StoreError>>;

    /// Lists a run's node execution records in execution order.
    async fn list_node_records(
        &self,
        run_id: WorkflowRunId,
    ) -> Result<Vec<NodeExecutionRecord>, Report<StoreError>>;

    /// Unconsumed resumptions due at `now` whose run is still waiting,
    /// oldest first.
    async fn due_resumptions(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ScheduledResumption>, Report<StoreError>>;

    /// Moves `running` runs not updated since `stalled_before` back to
    /// `pending`, keeping their cursor and context. Returns their IDs.
    async fn release_stalled(
        &self,
        stalled_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WorkflowRunId>, Report<StoreError>>;

    /// `pending` runs not updated since `before`, oldest first.
    async fn stale_pending(
        &self,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WorkflowRunId>, Report<StoreError>>;

    /// Number of runs created for a tenant since `since`.
    async fn count_runs_since(
        &self,
        tenant_id: &TenantId,
        since: DateTime<Utc>,
    ) -> Result<u64, Report<StoreError>>;
}

/// Read access to workflow definitions.
///
/// Authoring and versioning live outside the engine.
#[async_trait]
pub trait DefinitionStore: Send + Sync {
    /// Active definitions of a tenant whose published version accepts the
    /// trigger type.
    async fn find_active(
        &self,
        tenant_id: &TenantId,
        trigger_type: &TriggerType,
    ) -> Result<Vec<PublishedWorkflow>, Report<StoreError>>;

    /// Loads a version and its definition, published or not.
    async fn load_version(
        &self,
        version_id: WorkflowVersionId,
    ) -> Result<Option<PublishedWorkflow>, Report<StoreError>>;

    /// Active, published versions accepting `scheduled` triggers, across
    /// all tenants.
    async fn list_scheduled(&self) -> Result<Vec<PublishedWorkflow>, Report<StoreError>>;
}
