//! Definition store over `workflow_definitions` and `workflow_versions`.

use super::{json_column, parse_column, store_error};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use relayflow_core::{TenantId, WorkflowId, WorkflowVersionId};
use relayflow_workflow::{
    DefinitionStatus, DefinitionStore, PublishedWorkflow, StoreError, TriggerType,
    WorkflowDefinition, WorkflowVersion,
};
use rootcause::prelude::Report;
use serde_json::Value as JsonValue;
use sqlx::{FromRow, PgPool};

const SELECT_PUBLISHED: &str = r#"
    SELECT d.id AS definition_id, d.tenant_id, d.name, d.status,
           d.created_at AS definition_created_at, d.updated_at AS definition_updated_at,
           v.id AS version_id, v.number, v.published, v.trigger_types, v.trigger_config,
           v.graph, v.created_at AS version_created_at
    FROM workflow_versions v
    JOIN workflow_definitions d ON d.id = v.workflow_id
"#;

/// Row type joining a definition with one of its versions.
#[derive(FromRow)]
struct PublishedWorkflowRow {
    definition_id: String,
    tenant_id: String,
    name: String,
    status: String,
    definition_created_at: DateTime<Utc>,
    definition_updated_at: DateTime<Utc>,
    version_id: String,
    number: i32,
    published: bool,
    trigger_types: Vec<String>,
    trigger_config: JsonValue,
    graph: JsonValue,
    version_created_at: DateTime<Utc>,
}

impl PublishedWorkflowRow {
    fn try_into_record(self) -> Result<PublishedWorkflow, sqlx::Error> {
        let workflow_id: WorkflowId = parse_column("workflow id", &self.definition_id)?;
        Ok(PublishedWorkflow {
            definition: WorkflowDefinition {
                id: workflow_id,
                tenant_id: TenantId::new(self.tenant_id),
                name: self.name,
                status: parse_column::<DefinitionStatus>("definition status", &self.status)?,
                created_at: self.definition_created_at,
                updated_at: self.definition_updated_at,
            },
            version: WorkflowVersion {
                id: parse_column::<WorkflowVersionId>("version id", &self.version_id)?,
                workflow_id,
                number: self.number,
                published: self.published,
                trigger_types: self.trigger_types.into_iter().map(TriggerType::new).collect(),
                trigger_config: json_column("trigger config", self.trigger_config)?,
                graph: json_column("workflow graph", self.graph)?,
                created_at: self.version_created_at,
            },
        })
    }
}

fn into_records(rows: Vec<PublishedWorkflowRow>) -> Result<Vec<PublishedWorkflow>, StoreError> {
    rows.into_iter()
        .map(|r| r.try_into_record())
        .collect::<Result<_, _>>()
        .map_err(store_error)
}

/// Trigger type names whose versions may accept `event`.
fn candidate_types(event: &TriggerType) -> Vec<String> {
    let mut types = vec![event.as_str().to_string()];
    if event.is_channel_message() && event.as_str() != TriggerType::CHANNEL_MESSAGE {
        types.push(TriggerType::CHANNEL_MESSAGE.to_string());
    }
    types
}

/// [`DefinitionStore`] backed by Postgres.
#[derive(Clone)]
pub struct PgDefinitionStore {
    pool: PgPool,
}

impl PgDefinitionStore {
    /// Creates a new store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DefinitionStore for PgDefinitionStore {
    async fn find_active(
        &self,
        tenant_id: &TenantId,
        trigger_type: &TriggerType,
    ) -> Result<Vec<PublishedWorkflow>, Report<StoreError>> {
        let rows: Vec<PublishedWorkflowRow> = sqlx::query_as(&format!(
            r#"{SELECT_PUBLISHED}
            WHERE d.tenant_id = $1 AND d.status = 'active' AND v.published
              AND v.trigger_types && $2
            ORDER BY d.created_at ASC
            "#
        ))
        .bind(tenant_id.as_str())
        .bind(candidate_types(trigger_type))
        .fetch_all(&self.pool)
        .await
        .map_err(store_error)?;

        Ok(into_records(rows)?
            .into_iter()
            .filter(|w| w.matches(tenant_id, trigger_type))
            .collect())
    }

    async fn load_version(
        &self,
        version_id: WorkflowVersionId,
    ) -> Result<Option<PublishedWorkflow>, Report<StoreError>> {
        let row: Option<PublishedWorkflowRow> =
            sqlx::query_as(&format!("{SELECT_PUBLISHED} WHERE v.id = $1"))
                .bind(version_id.to_string())
                .fetch_optional(&self.pool)
                .await
                .map_err(store_error)?;
        match row {
            Some(r) => Ok(Some(r.try_into_record().map_err(store_error)?)),
            None => Ok(None),
        }
    }

    async fn list_scheduled(&self) -> Result<Vec<PublishedWorkflow>, Report<StoreError>> {
        let rows: Vec<PublishedWorkflowRow> = sqlx::query_as(&format!(
            r#"{SELECT_PUBLISHED}
            WHERE d.status = 'active' AND v.published AND $1 = ANY(v.trigger_types)
            ORDER BY d.created_at ASC
            "#
        ))
        .bind(TriggerType::SCHEDULED)
        .fetch_all(&self.pool)
        .await
        .map_err(store_error)?;

        Ok(into_records(rows)?)
    }
}
