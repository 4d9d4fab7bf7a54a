//! Run context: the versioned JSON state a run carries between nodes.
//!
//! The context has a fixed set of roots:
//! - `trigger`: the payload the run was started with
//! - `variables`: flat variables written by triggers and `set-variable`
//! - `nodes`: each executed node's latest output, keyed by its alias
//! - `last_error`: set when a node fails, until a handler clears it
//!
//! Per-node state (such as loop cursors) lives beside the roots and is not
//! visible to expressions.
//!
//! Every applied step produces a new snapshot with `version + 1`; stores use
//! the version to reject writes that race with another worker.

use crate::error::NodeError;
use crate::node::{Node, NodeId};
use crate::registry::{NodeOutput, StateChange};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

/// Reduces a display name to a lowercase identifier usable in expressions.
///
/// Runs of characters outside `[a-z0-9_]` collapse to a single underscore,
/// and leading or trailing underscores are dropped. A leading digit gets an
/// underscore prefix. A name that reduces to nothing becomes `node`.
#[must_use]
pub fn sanitize_identifier(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut pending_sep = false;
    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() || ch == '_' {
            if pending_sep && !out.is_empty() {
                out.push('_');
            }
            pending_sep = false;
            out.push(ch.to_ascii_lowercase());
        } else {
            pending_sep = true;
        }
    }
    let trimmed = out.trim_matches('_');
    match trimmed.chars().next() {
        None => "node".to_string(),
        Some(c) if c.is_ascii_digit() => format!("_{trimmed}"),
        Some(_) => trimmed.to_string(),
    }
}

/// Details of the most recent failed node attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastError {
    /// Node that failed.
    pub node_id: NodeId,
    /// Kind of the failed node.
    pub kind: String,
    /// Human-readable message.
    pub message: String,
    /// Structured error.
    pub error: NodeError,
    /// When the attempt failed.
    pub occurred_at: DateTime<Utc>,
}

impl LastError {
    /// Captures a failure of `node`.
    #[must_use]
    pub fn new(node: &Node, error: NodeError, occurred_at: DateTime<Utc>) -> Self {
        Self {
            node_id: node.id.clone(),
            kind: node.kind.clone(),
            message: error.to_string(),
            error,
            occurred_at,
        }
    }
}

/// Versioned state of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunContext {
    /// Incremented on every applied step.
    #[serde(default)]
    pub version: u64,
    /// Payload the run was triggered with.
    #[serde(default)]
    pub trigger: JsonValue,
    /// Flat run variables.
    #[serde(default)]
    pub variables: Map<String, JsonValue>,
    /// Node outputs keyed by alias.
    #[serde(default)]
    pub nodes: Map<String, JsonValue>,
    /// Per-node state keyed by node ID.
    #[serde(default)]
    pub node_state: Map<String, JsonValue>,
    /// Most recent failure, if not yet handled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<LastError>,
}

impl RunContext {
    /// Creates the initial context for a trigger payload.
    #[must_use]
    pub fn new(trigger: JsonValue) -> Self {
        Self {
            version: 0,
            trigger,
            variables: Map::new(),
            nodes: Map::new(),
            node_state: Map::new(),
            last_error: None,
        }
    }

    /// Resolves a dotted path against the context.
    ///
    /// The first segment is looked up in `variables`, then `nodes`, then
    /// the `trigger` and `last_error` roots. Remaining segments index into
    /// objects by key and into arrays by position. Returns `None` when any
    /// segment is missing.
    #[must_use]
    pub fn lookup(&self, path: &str) -> Option<JsonValue> {
        let mut segments = path.split('.').map(str::trim);
        let head = segments.next().filter(|s| !s.is_empty())?;

        let root = if let Some(v) = self.variables.get(head) {
            v.clone()
        } else if let Some(v) = self.nodes.get(head) {
            v.clone()
        } else {
            match head {
                "trigger" => self.trigger.clone(),
                "variables" => JsonValue::Object(self.variables.clone()),
                "nodes" => JsonValue::Object(self.nodes.clone()),
                "last_error" => serde_json::to_value(self.last_error.as_ref()?).ok()?,
                _ => return None,
            }
        };

        segments.try_fold(root, |value, segment| descend(&value, segment))
    }

    /// Returns a node's per-run state.
    #[must_use]
    pub fn node_state(&self, node_id: &NodeId) -> Option<&JsonValue> {
        self.node_state.get(node_id.as_str())
    }

    /// Applies a successful step, returning the next snapshot.
    #[must_use]
    pub fn apply(&self, node: &Node, step: &NodeOutput) -> Self {
        let mut next = self.clone();
        next.version += 1;
        next.nodes.insert(node.alias(), step.output.clone());
        for (key, value) in &step.variables {
            next.variables.insert(key.clone(), value.clone());
        }
        match &step.state {
            StateChange::Keep => {}
            StateChange::Set(state) => {
                next.node_state
                    .insert(node.id.as_str().to_string(), state.clone());
            }
            StateChange::Clear => {
                next.node_state.remove(node.id.as_str());
            }
        }
        if step.clears_error {
            next.last_error = None;
        }
        next
    }

    /// Records a node's output without routing information.
    #[must_use]
    pub fn with_output(&self, node: &Node, output: JsonValue) -> Self {
        self.apply(node, &NodeOutput::new(output))
    }

    /// Records a failure, returning the next snapshot.
    #[must_use]
    pub fn with_last_error(&self, error: LastError) -> Self {
        let mut next = self.clone();
        next.version += 1;
        next.last_error = Some(error);
        next
    }
}

fn descend(value: &JsonValue, segment: &str) -> Option<JsonValue> {
    match value {
        JsonValue::Object(map) => map.get(segment).cloned(),
        JsonValue::Array(items) => segment
            .parse::<usize>()
            .ok()
            .and_then(|i| items.get(i).cloned()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sanitize_collapses_separators() {
        assert_eq!(sanitize_identifier("Detect Intent"), "detect_intent");
        assert_eq!(sanitize_identifier("  HTTP -> CRM!! "), "http_crm");
        assert_eq!(sanitize_identifier("already_ok_1"), "already_ok_1");
        assert_eq!(sanitize_identifier("!!!"), "node");
        assert_eq!(sanitize_identifier("2nd Step"), "_2nd_step");
    }

    #[test]
    fn lookup_prefers_variables_over_nodes() {
        let mut ctx = RunContext::new(json!({"message": {"text": "hi"}}));
        ctx.variables.insert("intent".into(), json!("billing"));
        ctx.nodes.insert("intent".into(), json!({"intent": "other"}));

        assert_eq!(ctx.lookup("intent"), Some(json!("billing")));
        assert_eq!(ctx.lookup("nodes.intent.intent"), Some(json!("other")));
        assert_eq!(ctx.lookup("trigger.message.text"), Some(json!("hi")));
        assert_eq!(ctx.lookup("missing"), None);
    }

    #[test]
    fn lookup_indexes_arrays() {
        let mut ctx = RunContext::new(JsonValue::Null);
        ctx.variables.insert("items".into(), json!(["a", "b"]));
        assert_eq!(ctx.lookup("items.1"), Some(json!("b")));
        assert_eq!(ctx.lookup("items.2"), None);
    }

    #[test]
    fn apply_bumps_version_and_merges() {
        let node = Node::new("n1", "set-variable").with_name("Set Foo");
        let ctx = RunContext::new(JsonValue::Null);
        let mut vars = Map::new();
        vars.insert("foo".into(), json!(1));
        let step = NodeOutput::new(json!({"foo": 1}))
            .with_variables(vars)
            .with_state(StateChange::Set(json!({"index": 0})));

        let next = ctx.apply(&node, &step);
        assert_eq!(next.version, 1);
        assert_eq!(next.lookup("foo"), Some(json!(1)));
        assert_eq!(next.lookup("set_foo.foo"), Some(json!(1)));
        assert_eq!(next.node_state(&node.id), Some(&json!({"index": 0})));
        assert_eq!(ctx.version, 0);
    }

    #[test]
    fn last_error_is_addressable() {
        let node = Node::new("call", "http-request");
        let ctx = RunContext::new(JsonValue::Null).with_last_error(LastError::new(
            &node,
            NodeError::Http {
                reason: "timeout".into(),
            },
            Utc::now(),
        ));
        assert_eq!(ctx.lookup("last_error.kind"), Some(json!("http-request")));
        assert_eq!(ctx.lookup("last_error.error.code"), Some(json!("http")));

        let handler = Node::new("recover", "error-handler");
        let cleared = ctx.apply(&handler, &NodeOutput::new(JsonValue::Null).clearing_error());
        assert!(cleared.last_error.is_none());
    }
}
