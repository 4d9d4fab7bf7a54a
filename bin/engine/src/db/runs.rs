//! Run store over `workflow_runs`, `node_executions` and
//! `scheduled_resumptions`.
//!
//! Every state transition is a single conditional statement, so concurrent
//! engine processes serialize on the run row:
//! - creation relies on the `(version_id, source_event_id)` unique key
//! - claiming a `waiting` row consumes its due resumption in the same
//!   transaction, and only matches while that resumption was outstanding
//! - progress writes compare the stored `context_version`
//! - releasing a stalled `running` row skips rows locked by a live claim

use super::{json_column, parse_column, store_error, to_json};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use relayflow_core::{
    NodeExecutionId, ResumptionId, TenantId, WorkflowId, WorkflowRunId, WorkflowVersionId,
};
use relayflow_workflow::{
    CreateRunResult, Cursor, NodeError, NodeExecutionRecord, NodeExecutionStatus, RunContext,
    RunStatus, RunStore, ScheduledResumption, StoreError, WorkflowRun,
};
use rootcause::prelude::Report;
use serde_json::Value as JsonValue;
use sqlx::{FromRow, PgPool};
use tracing::{debug, instrument};

const RUN_COLUMNS: &str = "id, workflow_id, version_id, tenant_id, status, trigger_type, \
    source_event_id, context, cursor, error, created_at, started_at, updated_at, finished_at";

/// Row type for run queries.
#[derive(FromRow)]
struct WorkflowRunRow {
    id: String,
    workflow_id: String,
    version_id: String,
    tenant_id: String,
    status: String,
    trigger_type: String,
    source_event_id: String,
    context: JsonValue,
    cursor: Option<JsonValue>,
    error: Option<String>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

impl WorkflowRunRow {
    fn try_into_record(self) -> Result<WorkflowRun, sqlx::Error> {
        Ok(WorkflowRun {
            id: parse_column("run id", &self.id)?,
            workflow_id: parse_column::<WorkflowId>("workflow id", &self.workflow_id)?,
            version_id: parse_column::<WorkflowVersionId>("version id", &self.version_id)?,
            tenant_id: TenantId::new(self.tenant_id),
            status: parse_column("run status", &self.status)?,
            trigger_type: self.trigger_type,
            source_event_id: self.source_event_id,
            context: json_column("run context", self.context)?,
            cursor: self
                .cursor
                .map(|cursor| json_column("run cursor", cursor))
                .transpose()?,
            error: self.error,
            created_at: self.created_at,
            started_at: self.started_at,
            updated_at: self.updated_at,
            finished_at: self.finished_at,
        })
    }
}

/// Row type for node execution queries.
#[derive(FromRow)]
struct NodeExecutionRow {
    id: String,
    run_id: String,
    node_id: String,
    kind: String,
    status: String,
    handle: Option<String>,
    input: JsonValue,
    output: Option<JsonValue>,
    error: Option<JsonValue>,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
}

impl NodeExecutionRow {
    fn try_into_record(self) -> Result<NodeExecutionRecord, sqlx::Error> {
        Ok(NodeExecutionRecord {
            id: parse_column::<NodeExecutionId>("node execution id", &self.id)?,
            run_id: parse_column("run id", &self.run_id)?,
            node_id: self.node_id.into(),
            kind: self.kind,
            status: parse_column::<NodeExecutionStatus>("node execution status", &self.status)?,
            handle: self.handle,
            input: self.input,
            output: self.output,
            error: self
                .error
                .map(|error| json_column::<NodeError>("node error", error))
                .transpose()?,
            started_at: self.started_at,
            finished_at: self.finished_at,
        })
    }
}

/// Row type for resumption queries.
#[derive(FromRow)]
struct ResumptionRow {
    id: String,
    run_id: String,
    node_id: String,
    resume_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    consumed_at: Option<DateTime<Utc>>,
}

impl ResumptionRow {
    fn try_into_record(self) -> Result<ScheduledResumption, sqlx::Error> {
        Ok(ScheduledResumption {
            id: parse_column::<ResumptionId>("resumption id", &self.id)?,
            run_id: parse_column("run id", &self.run_id)?,
            node_id: self.node_id.into(),
            resume_at: self.resume_at,
            created_at: self.created_at,
            consumed_at: self.consumed_at,
        })
    }
}

fn context_version(context: &RunContext) -> i64 {
    i64::try_from(context.version).unwrap_or(i64::MAX)
}

/// [`RunStore`] backed by Postgres.
#[derive(Clone)]
pub struct PgRunStore {
    pool: PgPool,
}

impl PgRunStore {
    /// Creates a new store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Explains a conditional write that matched no row.
    async fn missed_write(
        &self,
        run_id: WorkflowRunId,
        expected: &str,
    ) -> Result<StoreError, Report<StoreError>> {
        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM workflow_runs WHERE id = $1")
                .bind(run_id.to_string())
                .fetch_optional(&self.pool)
                .await
                .map_err(store_error)?;
        Ok(match status {
            None => StoreError::RunNotFound { run_id },
            Some(status) => StoreError::Conflict {
                run_id,
                details: format!("run is {status}, expected {expected}"),
            },
        })
    }
}

#[async_trait]
impl RunStore for PgRunStore {
    #[instrument(skip_all, fields(run_id = %run.id, version_id = %run.version_id))]
    async fn create_run(&self, run: &WorkflowRun) -> Result<CreateRunResult, Report<StoreError>> {
        let context = to_json("run context", &run.context)?;
        let cursor = run
            .cursor
            .as_ref()
            .map(|cursor| to_json("run cursor", cursor))
            .transpose()?;
        let inserted = sqlx::query(
            r#"
            INSERT INTO workflow_runs
                (id, workflow_id, version_id, tenant_id, status, trigger_type, source_event_id,
                 context, context_version, cursor, error, created_at, started_at, updated_at,
                 finished_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            ON CONFLICT (version_id, source_event_id) DO NOTHING
            "#,
        )
        .bind(run.id.to_string())
        .bind(run.workflow_id.to_string())
        .bind(run.version_id.to_string())
        .bind(run.tenant_id.as_str())
        .bind(run.status.as_str())
        .bind(&run.trigger_type)
        .bind(&run.source_event_id)
        .bind(context)
        .bind(context_version(&run.context))
        .bind(cursor)
        .bind(&run.error)
        .bind(run.created_at)
        .bind(run.started_at)
        .bind(run.updated_at)
        .bind(run.finished_at)
        .execute(&self.pool)
        .await
        .map_err(store_error)?;

        if inserted.rows_affected() == 1 {
            return Ok(CreateRunResult::Created);
        }

        let existing: Option<(String, String)> = sqlx::query_as(
            "SELECT id, status FROM workflow_runs WHERE version_id = $1 AND source_event_id = $2",
        )
        .bind(run.version_id.to_string())
        .bind(&run.source_event_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_error)?;
        let Some((id, status)) = existing else {
            return Err(StoreError::Conflict {
                run_id: run.id,
                details: "insert conflicted but no existing run was found".to_string(),
            }
            .into());
        };
        debug!(existing = %id, "run already exists for source event");
        Ok(CreateRunResult::Duplicate {
            existing: parse_column("run id", &id).map_err(store_error)?,
            status: parse_column::<RunStatus>("run status", &status).map_err(store_error)?,
        })
    }

    async fn get_run(
        &self,
        run_id: WorkflowRunId,
    ) -> Result<Option<WorkflowRun>, Report<StoreError>> {
        let row: Option<WorkflowRunRow> =
            sqlx::query_as(&format!("SELECT {RUN_COLUMNS} FROM workflow_runs WHERE id = $1"))
                .bind(run_id.to_string())
                .fetch_optional(&self.pool)
                .await
                .map_err(store_error)?;
        match row {
            Some(r) => Ok(Some(r.try_into_record().map_err(store_error)?)),
            None => Ok(None),
        }
    }

    async fn find_by_source(
        &self,
        version_id: WorkflowVersionId,
        source_event_id: &str,
    ) -> Result<Option<WorkflowRun>, Report<StoreError>> {
        let row: Option<WorkflowRunRow> = sqlx::query_as(&format!(
            "SELECT {RUN_COLUMNS} FROM workflow_runs WHERE version_id = $1 AND source_event_id = $2"
        ))
        .bind(version_id.to_string())
        .bind(source_event_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_error)?;
        match row {
            Some(r) => Ok(Some(r.try_into_record().map_err(store_error)?)),
            None => Ok(None),
        }
    }

    #[instrument(skip_all, fields(run_id = %run_id))]
    async fn try_claim(
        &self,
        run_id: WorkflowRunId,
        now: DateTime<Utc>,
    ) -> Result<Option<WorkflowRun>, Report<StoreError>> {
        let mut tx = self.pool.begin().await.map_err(store_error)?;

        // A concurrent claimer blocks on the row lock, then sees it consumed.
        let consumed = sqlx::query(
            r#"
            UPDATE scheduled_resumptions
            SET consumed_at = $2
            WHERE id = (
                SELECT s.id FROM scheduled_resumptions s
                JOIN workflow_runs r ON r.id = s.run_id
                WHERE s.run_id = $1 AND r.status = 'waiting'
                  AND s.consumed_at IS NULL AND s.resume_at <= $2
                ORDER BY s.resume_at ASC
                LIMIT 1
                FOR UPDATE OF s)
              AND consumed_at IS NULL
            "#,
        )
        .bind(run_id.to_string())
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(store_error)?
        .rows_affected()
            == 1;

        let row: Option<WorkflowRunRow> = sqlx::query_as(&format!(
            r#"
            UPDATE workflow_runs r
            SET status = 'running',
                started_at = COALESCE(r.started_at, $2),
                updated_at = $2
            WHERE r.id = $1
              AND (r.status = 'pending' OR (r.status = 'waiting' AND $3))
            RETURNING {RUN_COLUMNS}
            "#
        ))
        .bind(run_id.to_string())
        .bind(now)
        .bind(consumed)
        .fetch_optional(&mut *tx)
        .await
        .map_err(store_error)?;

        let Some(row) = row else {
            tx.rollback().await.map_err(store_error)?;
            return Ok(None);
        };
        tx.commit().await.map_err(store_error)?;
        Ok(Some(row.try_into_record().map_err(store_error)?))
    }

    async fn save_progress(
        &self,
        run_id: WorkflowRunId,
        cursor: &Cursor,
        context: &RunContext,
    ) -> Result<(), Report<StoreError>> {
        let version = context_version(context);
        let result = sqlx::query(
            r#"
            UPDATE workflow_runs
            SET cursor = $2, context = $3, context_version = $4, updated_at = NOW()
            WHERE id = $1 AND status = 'running' AND context_version = $4 - 1
            "#,
        )
        .bind(run_id.to_string())
        .bind(to_json("run cursor", cursor)?)
        .bind(to_json("run context", context)?)
        .bind(version)
        .execute(&self.pool)
        .await
        .map_err(store_error)?;

        if result.rows_affected() == 0 {
            let expected = format!("running at context version {}", version - 1);
            return Err(self.missed_write(run_id, &expected).await?.into());
        }
        Ok(())
    }

    #[instrument(skip_all, fields(run_id = %run_id))]
    async fn suspend_run(
        &self,
        run_id: WorkflowRunId,
        cursor: &Cursor,
        context: &RunContext,
        resumption: &ScheduledResumption,
    ) -> Result<(), Report<StoreError>> {
        let mut tx = self.pool.begin().await.map_err(store_error)?;
        let result = sqlx::query(
            r#"
            UPDATE workflow_runs
            SET status = 'waiting', cursor = $2, context = $3, context_version = $4,
                updated_at = NOW()
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(run_id.to_string())
        .bind(to_json("run cursor", cursor)?)
        .bind(to_json("run context", context)?)
        .bind(context_version(context))
        .execute(&mut *tx)
        .await
        .map_err(store_error)?;

        if result.rows_affected() == 0 {
            tx.rollback().await.map_err(store_error)?;
            return Err(self.missed_write(run_id, "running").await?.into());
        }

        sqlx::query(
            r#"
            INSERT INTO scheduled_resumptions (id, run_id, node_id, resume_at, created_at, consumed_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(resumption.id.to_string())
        .bind(resumption.run_id.to_string())
        .bind(resumption.node_id.as_str())
        .bind(resumption.resume_at)
        .bind(resumption.created_at)
        .bind(resumption.consumed_at)
        .execute(&mut *tx)
        .await
        .map_err(store_error)?;

        tx.commit().await.map_err(store_error)?;
        Ok(())
    }

    #[instrument(skip_all, fields(run_id = %run_id, status = %status))]
    async fn finish_run(
        &self,
        run_id: WorkflowRunId,
        status: RunStatus,
        context: Option<&RunContext>,
        error: Option<String>,
    ) -> Result<(), Report<StoreError>> {
        let encoded = context.map(|c| to_json("run context", c)).transpose()?;
        let result = sqlx::query(
            r#"
            UPDATE workflow_runs
            SET status = $2,
                context = COALESCE($3, context),
                context_version = COALESCE($4, context_version),
                error = $5,
                updated_at = NOW(),
                finished_at = NOW()
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(run_id.to_string())
        .bind(status.as_str())
        .bind(encoded)
        .bind(context.map(context_version))
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(store_error)?;

        if result.rows_affected() == 0 {
            return Err(self.missed_write(run_id, "running").await?.into());
        }
        Ok(())
    }

    async fn append_node_record(
        &self,
        record: &NodeExecutionRecord,
    ) -> Result<(), Report<StoreError>> {
        let error = record
            .error
            .as_ref()
            .map(|e| to_json("node error", e))
            .transpose()?;
        sqlx::query(
            r#"
            INSERT INTO node_executions
                (id, run_id, node_id, kind, status, handle, input, output, error, started_at,
                 finished_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(record.id.to_string())
        .bind(record.run_id.to_string())
        .bind(record.node_id.as_str())
        .bind(&record.kind)
        .bind(record.status.as_str())
        .bind(&record.handle)
        .bind(&record.input)
        .bind(&record.output)
        .bind(error)
        .bind(record.started_at)
        .bind(record.finished_at)
        .execute(&self.pool)
        .await
        .map_err(store_error)?;
        Ok(())
    }

    async fn list_node_records(
        &self,
        run_id: WorkflowRunId,
    ) -> Result<Vec<NodeExecutionRecord>, Report<StoreError>> {
        let rows: Vec<NodeExecutionRow> = sqlx::query_as(
            r#"
            SELECT id, run_id, node_id, kind, status, handle, input, output, error, started_at,
                   finished_at
            FROM node_executions
            WHERE run_id = $1
            ORDER BY seq ASC
            "#,
        )
        .bind(run_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(store_error)?;

        Ok(rows
            .into_iter()
            .map(|r| r.try_into_record())
            .collect::<Result<_, _>>()
            .map_err(store_error)?)
    }

    async fn due_resumptions(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ScheduledResumption>, Report<StoreError>> {
        let rows: Vec<ResumptionRow> = sqlx::query_as(
            r#"
            SELECT s.id, s.run_id, s.node_id, s.resume_at, s.created_at, s.consumed_at
            FROM scheduled_resumptions s
            JOIN workflow_runs r ON r.id = s.run_id
            WHERE s.consumed_at IS NULL AND s.resume_at <= $1 AND r.status = 'waiting'
            ORDER BY s.resume_at ASC
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(store_error)?;

        Ok(rows
            .into_iter()
            .map(|r| r.try_into_record())
            .collect::<Result<_, _>>()
            .map_err(store_error)?)
    }

    #[instrument(skip_all)]
    async fn release_stalled(
        &self,
        stalled_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WorkflowRunId>, Report<StoreError>> {
        let ids: Vec<String> = sqlx::query_scalar(
            r#"
            UPDATE workflow_runs
            SET status = 'pending', updated_at = NOW()
            WHERE id IN (
                SELECT id FROM workflow_runs
                WHERE status = 'running' AND updated_at < $1
                ORDER BY updated_at ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED)
              AND status = 'running'
            RETURNING id
            "#,
        )
        .bind(stalled_before)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(store_error)?;

        Ok(ids
            .iter()
            .map(|id| parse_column::<WorkflowRunId>("run id", id))
            .collect::<Result<_, _>>()
            .map_err(store_error)?)
    }

    async fn stale_pending(
        &self,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WorkflowRunId>, Report<StoreError>> {
        let ids: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT id FROM workflow_runs
            WHERE status = 'pending' AND updated_at < $1
            ORDER BY updated_at ASC
            LIMIT $2
            "#,
        )
        .bind(before)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(store_error)?;

        Ok(ids
            .iter()
            .map(|id| parse_column::<WorkflowRunId>("run id", id))
            .collect::<Result<_, _>>()
            .map_err(store_error)?)
    }

    async fn count_runs_since(
        &self,
        tenant_id: &TenantId,
        since: DateTime<Utc>,
    ) -> Result<u64, Report<StoreError>> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM workflow_runs WHERE tenant_id = $1 AND created_at >= $2",
        )
        .bind(tenant_id.as_str())
        .bind(since)
        .fetch_one(&self.pool)
        .await
        .map_err(store_error)?;
        Ok(u64::try_from(count).unwrap_or(0))
    }
}
