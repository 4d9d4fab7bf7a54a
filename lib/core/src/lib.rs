//! Core types shared by every relayflow crate.
//!
//! This crate provides the strongly-typed identifiers used across the
//! workflow engine.

pub mod id;

pub use id::{
    NodeExecutionId, ParseIdError, ResumptionId, TenantId, WorkflowId, WorkflowRunId,
    WorkflowVersionId,
};
