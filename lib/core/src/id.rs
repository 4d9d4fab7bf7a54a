//! Strongly-typed identifiers for engine entities.
//!
//! Identifiers minted by the engine are ULIDs, which sort by creation time.
//! Tenants are owned by the surrounding CRM, so [`TenantId`] wraps whatever
//! opaque string that system hands us.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

/// A string that is not a valid identifier of the expected type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseIdError {
    /// Name of the identifier type.
    pub id_type: &'static str,
    /// What was wrong with the input.
    pub reason: String,
}

impl fmt::Display for ParseIdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid {}: {}", self.id_type, self.reason)
    }
}

impl std::error::Error for ParseIdError {}

/// Declares a ULID-backed identifier.
///
/// Displayed as `<prefix>_<ulid>`; parsing accepts that form or a bare
/// ULID and rejects any other prefix. Serialized as the bare ULID.
macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident, $prefix:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Ulid);

        impl $name {
            /// Mints a fresh identifier.
            #[must_use]
            pub fn new() -> Self {
                Self(Ulid::new())
            }

            /// Wraps an existing ULID.
            #[must_use]
            pub const fn from_ulid(ulid: Ulid) -> Self {
                Self(ulid)
            }

            #[must_use]
            pub const fn as_ulid(&self) -> Ulid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}_{}", $prefix, self.0)
            }
        }

        impl FromStr for $name {
            type Err = ParseIdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let invalid = |reason: String| ParseIdError {
                    id_type: stringify!($name),
                    reason,
                };
                let raw = match s.split_once('_') {
                    Some((prefix, rest)) if prefix == $prefix => rest,
                    Some((other, _)) => {
                        return Err(invalid(format!(
                            "expected prefix '{}', found '{other}'",
                            $prefix
                        )));
                    }
                    None => s,
                };
                Ulid::from_str(raw)
                    .map(Self)
                    .map_err(|e| invalid(format!("'{raw}': {e}")))
            }
        }
    };
}

define_id!(
    /// Unique identifier for a workflow definition.
    WorkflowId,
    "wf"
);

define_id!(
    /// Unique identifier for a published version of a workflow definition.
    WorkflowVersionId,
    "wfv"
);

define_id!(
    /// Unique identifier for a single execution (run) of a workflow version.
    WorkflowRunId,
    "run"
);

define_id!(
    /// Unique identifier for one node attempt within a run.
    NodeExecutionId,
    "nexec"
);

define_id!(
    /// Unique identifier for a scheduled resumption of a suspended run.
    ResumptionId,
    "resume"
);

/// Identifier of the tenant that owns workflows, runs and events.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    /// Wraps a tenant identifier issued by the CRM.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TenantId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TenantId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_id_display_format() {
        let id = WorkflowRunId::new();
        assert!(id.to_string().starts_with("run_"));
    }

    #[test]
    fn parse_with_prefix() {
        let id = WorkflowVersionId::new();
        let parsed: WorkflowVersionId = id.to_string().parse().expect("should parse");
        assert_eq!(id, parsed);
    }

    #[test]
    fn parse_without_prefix() {
        let ulid = Ulid::new();
        let id: WorkflowId = ulid.to_string().parse().expect("should parse");
        assert_eq!(id.as_ulid(), ulid);
    }

    #[test]
    fn parse_rejects_other_prefixes() {
        let run = WorkflowRunId::new().to_string();
        let err = run.parse::<WorkflowId>().unwrap_err();
        assert_eq!(err.id_type, "WorkflowId");
        assert!(err.reason.contains("'run'"));
    }

    #[test]
    fn parse_invalid_ulid() {
        let err = "resume_nope".parse::<ResumptionId>().unwrap_err();
        assert_eq!(err.id_type, "ResumptionId");
    }

    #[test]
    fn tenant_id_is_transparent() {
        let tenant = TenantId::new("acme");
        assert_eq!(tenant.to_string(), "acme");
        let json = serde_json::to_string(&tenant).expect("serialize");
        assert_eq!(json, "\"acme\"");
    }
}
