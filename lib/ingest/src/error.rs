//! Error types for trigger ingestion.
//!
//! Errors are designed for layered context using rootcause:
//! - `EventLogError` for the durable trigger log and delivery logs
//! - `IngestError` for everything between a log entry and a submitted run

use std::fmt;

/// Errors from the durable event log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventLogError {
    /// Connecting to the log or setting up its streams failed.
    Connection { details: String },
    /// Reading a batch failed.
    Read { details: String },
    /// Acknowledging or rejecting an entry failed.
    Ack { sequence: u64, details: String },
    /// Appending to the log failed.
    Publish { details: String },
}

impl fmt::Display for EventLogError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection { details } => write!(f, "event log connection failed: {details}"),
            Self::Read { details } => write!(f, "failed to read from event log: {details}"),
            Self::Ack { sequence, details } => {
                write!(f, "failed to acknowledge entry {sequence}: {details}")
            }
            Self::Publish { details } => write!(f, "failed to publish to event log: {details}"),
        }
    }
}

impl std::error::Error for EventLogError {}

/// Errors from turning a log entry into runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestError {
    /// The entry is not a trigger event. Redelivery cannot fix it.
    Malformed { reason: String },
    /// Definition or run storage failed.
    Store { details: String },
    /// Message enrichment failed.
    Enrichment { message_id: String, details: String },
    /// The rate-limit counter could not be consulted.
    RateLimit { details: String },
    /// A created run could not be handed to the executor pool.
    Submit { details: String },
}

impl fmt::Display for IngestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Malformed { reason } => write!(f, "malformed trigger event: {reason}"),
            Self::Store { details } => write!(f, "store error during ingestion: {details}"),
            Self::Enrichment {
                message_id,
                details,
            } => write!(f, "failed to enrich message {message_id}: {details}"),
            Self::RateLimit { details } => write!(f, "rate limit check failed: {details}"),
            Self::Submit { details } => write!(f, "failed to submit run: {details}"),
        }
    }
}

impl std::error::Error for IngestError {}
