//! Workflow definition types.
//!
//! A workflow definition is a tenant-owned automation consisting of:
//! - Metadata (name, status, timestamps)
//! - Published versions, each an immutable graph plus trigger metadata
//!
//! Only the single published version of an `active` definition is matched
//! against incoming events. Runs pin the version they were created with.

use crate::graph::WorkflowGraph;
use chrono::{DateTime, Utc};
use relayflow_core::{TenantId, WorkflowId, WorkflowVersionId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Category of event a workflow version reacts to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TriggerType(String);

impl TriggerType {
    /// Matches inbound messages on every channel.
    pub const CHANNEL_MESSAGE: &'static str = "channel-message";
    /// A support ticket was opened.
    pub const TICKET_CREATED: &'static str = "ticket-created";
    /// A lead was added to a pipeline.
    pub const LEAD_ADDED: &'static str = "lead-added";
    /// An inbound call was missed.
    pub const MISSED_CALL: &'static str = "missed-call";
    /// A cron schedule came due.
    pub const SCHEDULED: &'static str = "scheduled";
    /// A user started the workflow by hand.
    pub const MANUAL: &'static str = "manual";

    /// Wraps a trigger type name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns whether this is a channel-specific message type such as
    /// `whatsapp-message`.
    #[must_use]
    pub fn is_channel_message(&self) -> bool {
        self.0.ends_with("-message")
    }

    /// Returns whether a version configured with `self` reacts to `event`.
    ///
    /// `channel-message` matches every channel-specific message type.
    #[must_use]
    pub fn includes(&self, event: &TriggerType) -> bool {
        self == event || (self.0 == Self::CHANNEL_MESSAGE && event.is_channel_message())
    }
}

impl fmt::Display for TriggerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TriggerType {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Status of a workflow definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefinitionStatus {
    /// Eligible for event matching.
    Active,
    /// Ignored by the ingestor and scheduler.
    Paused,
}

impl DefinitionStatus {
    /// Returns the string representation of this status.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
        }
    }
}

impl std::str::FromStr for DefinitionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "paused" => Ok(Self::Paused),
            other => Err(format!("unknown definition status: {other}")),
        }
    }
}

/// Secondary trigger-match filters and schedule for a version.
///
/// Every configured filter must pass for an event to start a run; an
/// absent filter always passes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerConfig {
    /// Channels the event must arrive on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<Vec<String>>,
    /// Priorities the event payload must carry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priorities: Option<Vec<String>>,
    /// Pipeline the event payload must belong to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline_id: Option<String>,
    /// Cron expression for `scheduled` versions, evaluated in UTC.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron: Option<String>,
}

/// A workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Unique identifier for this workflow.
    pub id: WorkflowId,
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Human-readable name.
    pub name: String,
    /// Whether the definition is matched against events.
    pub status: DefinitionStatus,
    /// When this workflow was created.
    pub created_at: DateTime<Utc>,
    /// When this workflow was last updated.
    pub updated_at: DateTime<Utc>,
}

impl WorkflowDefinition {
    /// Creates an active definition.
    #[must_use]
    pub fn new(tenant_id: TenantId, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: WorkflowId::new(),
            tenant_id,
            name: name.into(),
            status: DefinitionStatus::Active,
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns whether this definition is eligible for matching.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status == DefinitionStatus::Active
    }
}

/// An immutable version of a workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowVersion {
    /// Unique identifier for this version.
    pub id: WorkflowVersionId,
    /// The definition this version belongs to.
    pub workflow_id: WorkflowId,
    /// Sequence number within the definition.
    pub number: i32,
    /// Whether this is the definition's executable version.
    pub published: bool,
    /// Event categories this version reacts to.
    pub trigger_types: Vec<TriggerType>,
    /// Filters and schedule.
    #[serde(default)]
    pub trigger_config: TriggerConfig,
    /// The node graph.
    pub graph: WorkflowGraph,
    /// When this version was created.
    pub created_at: DateTime<Utc>,
}

impl WorkflowVersion {
    /// Creates the published first version of a definition.
    #[must_use]
    pub fn published(
        workflow_id: WorkflowId,
        trigger_types: Vec<TriggerType>,
        graph: WorkflowGraph,
    ) -> Self {
        Self {
            id: WorkflowVersionId::new(),
            workflow_id,
            number: 1,
            published: true,
            trigger_types,
            trigger_config: TriggerConfig::default(),
            graph,
            created_at: Utc::now(),
        }
    }

    /// Sets the trigger configuration.
    #[must_use]
    pub fn with_trigger_config(mut self, config: TriggerConfig) -> Self {
        self.trigger_config = config;
        self
    }

    /// Returns whether any configured trigger type includes `event`.
    #[must_use]
    pub fn accepts(&self, event: &TriggerType) -> bool {
        self.trigger_types.iter().any(|t| t.includes(event))
    }
}

/// An active definition together with its published version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishedWorkflow {
    /// The definition.
    pub definition: WorkflowDefinition,
    /// Its published version.
    pub version: WorkflowVersion,
}

impl PublishedWorkflow {
    /// Returns whether this workflow should run for a tenant's event.
    #[must_use]
    pub fn matches(&self, tenant_id: &TenantId, event: &TriggerType) -> bool {
        self.definition.is_active()
            && self.version.published
            && &self.definition.tenant_id == tenant_id
            && self.version.accepts(event)
    }
}
