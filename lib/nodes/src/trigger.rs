//! Trigger node kinds.
//!
//! A trigger is the entry node of every graph. It runs once per run, before
//! any other node, and only normalizes the payload the run was created
//! with: nested objects are flattened into `parent_child` variables so
//! conditions can say `sender_phone` instead of `trigger.sender.phone`.

use async_trait::async_trait;
use relayflow_workflow::{
    NodeContext, NodeError, NodeFamily, NodeHandler, NodeOutput, Outcome, sanitize_identifier,
};
use serde_json::{Map, Value as JsonValue};

/// Kind names of every trigger node.
pub const TRIGGER_KINDS: [&str; 6] = [
    "channel-message",
    "ticket-created",
    "lead-added",
    "missed-call",
    "scheduled",
    "manual",
];

const MAX_DEPTH: usize = 3;

/// Entry node that normalizes the trigger payload.
#[derive(Debug, Clone, Copy)]
pub struct TriggerNode {
    kind: &'static str,
}

impl TriggerNode {
    /// Creates the trigger node for one kind.
    #[must_use]
    pub const fn new(kind: &'static str) -> Self {
        Self { kind }
    }

    /// One handler per trigger kind.
    pub fn all() -> impl Iterator<Item = Self> {
        TRIGGER_KINDS.into_iter().map(Self::new)
    }
}

#[async_trait]
impl NodeHandler for TriggerNode {
    fn kind(&self) -> &'static str {
        self.kind
    }

    fn family(&self) -> NodeFamily {
        NodeFamily::Trigger
    }

    async fn execute(
        &self,
        _config: &JsonValue,
        ctx: &NodeContext<'_>,
    ) -> Result<Outcome, NodeError> {
        let payload = &ctx.context.trigger;
        let variables = flatten_payload(payload);
        tracing::debug!(variables = variables.len(), "trigger payload normalized");
        Ok(Outcome::Continue(
            NodeOutput::new(payload.clone()).with_variables(variables),
        ))
    }
}

/// Flattens a payload into sanitized variables.
///
/// `{"sender": {"phone": "+1"}}` yields `sender_phone`. Arrays and values
/// nested deeper than a few levels are kept whole. A non-object payload
/// yields a single `payload` variable.
#[must_use]
pub fn flatten_payload(payload: &JsonValue) -> Map<String, JsonValue> {
    let mut out = Map::new();
    match payload {
        JsonValue::Object(map) => flatten_into(&mut out, "", map, 1),
        JsonValue::Null => {}
        other => {
            out.insert("payload".to_string(), other.clone());
        }
    }
    out
}

fn flatten_into(
    out: &mut Map<String, JsonValue>,
    prefix: &str,
    map: &Map<String, JsonValue>,
    depth: usize,
) {
    for (key, value) in map {
        let name = if prefix.is_empty() {
            sanitize_identifier(key)
        } else {
            format!("{prefix}_{}", sanitize_identifier(key))
        };
        match value {
            JsonValue::Object(inner) if depth < MAX_DEPTH => {
                flatten_into(out, &name, inner, depth + 1);
            }
            other => {
                out.insert(name, other.clone());
            }
        }
    }
}
