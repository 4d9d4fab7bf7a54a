//! Postgres implementations of the engine's store traits.
//!
//! This module provides data access for:
//! - Workflow runs, node execution records and scheduled resumptions
//! - Published workflow definitions
//! - Inbound messages owned by the surrounding CRM (read-only)

pub mod definitions;
pub mod messages;
pub mod runs;

pub use definitions::PgDefinitionStore;
pub use messages::PgMessageLookup;
pub use runs::PgRunStore;

use relayflow_workflow::StoreError;
use std::fmt::Display;
use std::str::FromStr;

/// Parses a stored identifier, reporting failures as decode errors.
fn parse_column<T>(column: &str, value: &str) -> Result<T, sqlx::Error>
where
    T: FromStr,
    T::Err: Display,
{
    T::from_str(value).map_err(|e| {
        sqlx::Error::Decode(Box::new(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("invalid {column} '{value}': {e}"),
        )))
    })
}

/// Decodes a JSON column into a typed value.
fn json_column<T>(column: &str, value: serde_json::Value) -> Result<T, sqlx::Error>
where
    T: serde::de::DeserializeOwned,
{
    serde_json::from_value(value).map_err(|e| {
        sqlx::Error::Decode(Box::new(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("invalid {column}: {e}"),
        )))
    })
}

/// Encodes a typed value for a JSON column.
fn to_json<T: serde::Serialize>(column: &str, value: &T) -> Result<serde_json::Value, StoreError> {
    serde_json::to_value(value).map_err(|e| StoreError::Corrupt {
        details: format!("failed to encode {column}: {e}"),
    })
}

fn store_error(e: sqlx::Error) -> StoreError {
    match e {
        sqlx::Error::Decode(source) => StoreError::Corrupt {
            details: source.to_string(),
        },
        other => StoreError::Unavailable {
            details: other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relayflow_core::WorkflowRunId;

    #[test]
    fn invalid_ids_are_decode_errors() {
        let err = parse_column::<WorkflowRunId>("run id", "not-a-ulid").unwrap_err();
        assert!(matches!(store_error(err), StoreError::Corrupt { .. }));
    }

    #[test]
    fn prefixed_ids_parse() {
        let id = WorkflowRunId::new();
        let parsed: WorkflowRunId = parse_column("run id", &id.to_string()).unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn connection_failures_are_unavailable() {
        assert!(matches!(
            store_error(sqlx::Error::PoolTimedOut),
            StoreError::Unavailable { .. }
        ));
    }
}
