//! Scheduler failures.
//!
//! [`ScheduleError`] covers cron expressions read from trigger config;
//! [`SchedulerError`] covers a poll that could not reach a collaborator.

use std::fmt;

/// A cron expression that cannot be used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    InvalidCronExpression { expression: String, reason: String },
}

impl fmt::Display for ScheduleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Self::InvalidCronExpression { expression, reason } = self;
        write!(f, "cron expression '{expression}' rejected: {reason}")
    }
}

impl std::error::Error for ScheduleError {}

/// A poll that failed partway. The next tick retries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    /// Run or definition storage was unreachable.
    Store { details: String },
    /// The executor pool refused a resumed run.
    Submit { details: String },
    /// A synthesized cron event could not be appended.
    Publish { details: String },
}

impl fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Store { details } => write!(f, "scheduler store access failed: {details}"),
            Self::Submit { details } => write!(f, "failed to resubmit run: {details}"),
            Self::Publish { details } => {
                write!(f, "failed to publish scheduled trigger: {details}")
            }
        }
    }
}

impl std::error::Error for SchedulerError {}
