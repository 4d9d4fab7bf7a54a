//! Workflow run state.
//!
//! A run moves through:
//! `pending` → `running` ⇄ `waiting` → `completed` | `failed` | `stopped`.
//!
//! The `pending`/`waiting` → `running` transition is a compare-and-set in
//! the run store; whichever worker performs it owns that execution pass.
//! Each node attempt appends a [`NodeExecutionRecord`], which is never
//! updated afterwards.

use crate::context::RunContext;
use crate::error::NodeError;
use crate::node::NodeId;
use chrono::{DateTime, Utc};
use relayflow_core::{
    NodeExecutionId, ResumptionId, TenantId, WorkflowId, WorkflowRunId, WorkflowVersionId,
};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// The overall status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Created, not yet picked up.
    Pending,
    /// Owned by an executor pass.
    Running,
    /// Suspended until a scheduled resumption.
    Waiting,
    /// Reached a dead end.
    Completed,
    /// A node failed without an error route, or the step budget ran out.
    Failed,
    /// A `stop` node ended the run.
    Stopped,
}

impl RunStatus {
    /// Returns the string representation of this status.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Waiting => "waiting",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        }
    }

    /// Returns true if this is a terminal status.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Stopped)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "waiting" => Ok(Self::Waiting),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "stopped" => Ok(Self::Stopped),
            other => Err(format!("unknown run status: {other}")),
        }
    }
}

/// Position of a run: the last node that finished and the handle it chose.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    /// Last completed node.
    pub node_id: NodeId,
    /// Handle to follow from it.
    pub handle: String,
}

impl Cursor {
    /// Creates a cursor.
    #[must_use]
    pub fn new(node_id: NodeId, handle: impl Into<String>) -> Self {
        Self {
            node_id,
            handle: handle.into(),
        }
    }
}

/// A single execution of a workflow version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    /// Unique identifier for this run.
    pub id: WorkflowRunId,
    /// The definition being executed.
    pub workflow_id: WorkflowId,
    /// The version being executed.
    pub version_id: WorkflowVersionId,
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Current status.
    pub status: RunStatus,
    /// Event category that started the run.
    pub trigger_type: String,
    /// Identity of the source event; unique per version.
    pub source_event_id: String,
    /// Accumulated state.
    pub context: RunContext,
    /// Resumption position, `None` before the trigger node ran.
    pub cursor: Option<Cursor>,
    /// Failure or stop reason.
    pub error: Option<String>,
    /// When the run was created.
    pub created_at: DateTime<Utc>,
    /// When the run was first claimed.
    pub started_at: Option<DateTime<Utc>>,
    /// When the run was last written.
    pub updated_at: DateTime<Utc>,
    /// When the run reached a terminal status.
    pub finished_at: Option<DateTime<Utc>>,
}

impl WorkflowRun {
    /// Creates a pending run for a trigger payload.
    #[must_use]
    pub fn new(
        workflow_id: WorkflowId,
        version_id: WorkflowVersionId,
        tenant_id: TenantId,
        trigger_type: impl Into<String>,
        source_event_id: impl Into<String>,
        payload: JsonValue,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: WorkflowRunId::new(),
            workflow_id,
            version_id,
            tenant_id,
            status: RunStatus::Pending,
            trigger_type: trigger_type.into(),
            source_event_id: source_event_id.into(),
            context: RunContext::new(payload),
            cursor: None,
            error: None,
            created_at: now,
            started_at: None,
            updated_at: now,
            finished_at: None,
        }
    }
}

/// Result of creating a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateRunResult {
    /// The run was stored.
    Created,
    /// A run for the same version and source event already exists.
    Duplicate {
        /// The stored run.
        existing: WorkflowRunId,
        /// Its current status.
        status: RunStatus,
    },
}

/// Status of a node attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeExecutionStatus {
    /// The node returned an output and a handle.
    Completed,
    /// The node suspended the run.
    Waiting,
    /// The node stopped the run.
    Stopped,
    /// The node raised an error.
    Failed,
}

impl NodeExecutionStatus {
    /// Returns the string representation of this status.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Waiting => "waiting",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        }
    }
}

impl std::str::FromStr for NodeExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "completed" => Ok(Self::Completed),
            "waiting" => Ok(Self::Waiting),
            "stopped" => Ok(Self::Stopped),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown node execution status: {other}")),
        }
    }
}

/// Append-only record of one node attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeExecutionRecord {
    /// Unique identifier for this attempt.
    pub id: NodeExecutionId,
    /// The run.
    pub run_id: WorkflowRunId,
    /// The node.
    pub node_id: NodeId,
    /// The node's kind.
    pub kind: String,
    /// Outcome of the attempt.
    pub status: NodeExecutionStatus,
    /// Handle chosen, for completed attempts.
    pub handle: Option<String>,
    /// Resolved configuration the node ran with.
    pub input: JsonValue,
    /// Output, for attempts that produced one.
    pub output: Option<JsonValue>,
    /// Error, for failed attempts.
    pub error: Option<NodeError>,
    /// When the attempt started.
    pub started_at: DateTime<Utc>,
    /// When the attempt finished.
    pub finished_at: DateTime<Utc>,
}

/// A pending continuation of a suspended run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledResumption {
    /// Unique identifier.
    pub id: ResumptionId,
    /// The suspended run.
    pub run_id: WorkflowRunId,
    /// The node that suspended it.
    pub node_id: NodeId,
    /// When the run becomes due.
    pub resume_at: DateTime<Utc>,
    /// When the row was created.
    pub created_at: DateTime<Utc>,
    /// When the scheduler consumed it.
    pub consumed_at: Option<DateTime<Utc>>,
}

impl ScheduledResumption {
    /// Creates an unconsumed resumption.
    #[must_use]
    pub fn new(run_id: WorkflowRunId, node_id: NodeId, resume_at: DateTime<Utc>) -> Self {
        Self {
            id: ResumptionId::new(),
            run_id,
            node_id,
            resume_at,
            created_at: Utc::now(),
            consumed_at: None,
        }
    }

    /// Returns whether the resumption is due and unconsumed.
    #[must_use]
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.consumed_at.is_none() && self.resume_at <= now
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn run_status_round_trip() {
        for status in [
            RunStatus::Pending,
            RunStatus::Running,
            RunStatus::Waiting,
            RunStatus::Completed,
            RunStatus::Failed,
            RunStatus::Stopped,
        ] {
            assert_eq!(status.as_str().parse::<RunStatus>(), Ok(status));
        }
        assert!("paused".parse::<RunStatus>().is_err());
    }

    #[test]
    fn terminal_statuses() {
        assert!(RunStatus::Stopped.is_terminal());
        assert!(!RunStatus::Waiting.is_terminal());
    }

    #[test]
    fn new_run_is_pending_with_payload_context() {
        let run = WorkflowRun::new(
            WorkflowId::new(),
            WorkflowVersionId::new(),
            TenantId::new("t1"),
            "manual",
            "evt-1",
            serde_json::json!({"a": 1}),
        );
        assert_eq!(run.status, RunStatus::Pending);
        assert!(run.cursor.is_none());
        assert_eq!(run.context.trigger["a"], 1);
    }

    #[test]
    fn resumption_due() {
        let now = Utc::now();
        let mut r = ScheduledResumption::new(WorkflowRunId::new(), "w".into(), now);
        assert!(r.is_due(now));
        assert!(!r.is_due(now - Duration::seconds(1)));
        r.consumed_at = Some(now);
        assert!(!r.is_due(now));
    }
}
