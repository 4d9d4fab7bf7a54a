//! Utility node kinds: `set-variable`, `json-parse`, `assert` and
//! `error-handler`.

use crate::config::{bool_field, expression, str_field, validate_expression};
use async_trait::async_trait;
use relayflow_workflow::{
    NodeContext, NodeError, NodeFamily, NodeHandler, NodeOutput, Outcome, sanitize_identifier,
};
use serde_json::{Map, Value as JsonValue, json};
use tracing::{debug, info};

/// Writes one or more run variables.
///
/// Config is either `{ "name", "value" }` or
/// `{ "variables": [{ "name", "value" }, ...] }`. Names are sanitized into
/// identifiers; values have already been through template resolution.
#[derive(Debug, Default, Clone, Copy)]
pub struct SetVariableNode;

fn assignments(config: &JsonValue) -> Result<Map<String, JsonValue>, NodeError> {
    let pairs: Vec<&JsonValue> = match config.get("variables") {
        Some(JsonValue::Array(items)) => items.iter().collect(),
        Some(JsonValue::Object(map)) => {
            return Ok(map
                .iter()
                .map(|(name, value)| (sanitize_identifier(name), value.clone()))
                .collect());
        }
        Some(_) => return Err(NodeError::config("`variables` must be a list")),
        None => vec![config],
    };

    let mut out = Map::new();
    for pair in pairs {
        let name = str_field(pair, "name")
            .ok_or_else(|| NodeError::config("every variable needs a `name`"))?;
        let value = pair.get("value").cloned().unwrap_or(JsonValue::Null);
        out.insert(sanitize_identifier(name), value);
    }
    if out.is_empty() {
        return Err(NodeError::config("no variables to set"));
    }
    Ok(out)
}

#[async_trait]
impl NodeHandler for SetVariableNode {
    fn kind(&self) -> &'static str {
        "set-variable"
    }

    fn family(&self) -> NodeFamily {
        NodeFamily::Utility
    }

    fn validate(&self, config: &JsonValue) -> Result<(), NodeError> {
        assignments(config).map(|_| ())
    }

    async fn execute(
        &self,
        config: &JsonValue,
        _ctx: &NodeContext<'_>,
    ) -> Result<Outcome, NodeError> {
        let variables = assignments(config)?;
        debug!(count = variables.len(), "setting variables");
        Ok(Outcome::Continue(
            NodeOutput::new(JsonValue::Object(variables.clone())).with_variables(variables),
        ))
    }
}

/// Parses a JSON string.
///
/// Config: `input` (the text; a value that is already structured passes
/// through) and optional `variable` to also store the result under.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonParseNode;

#[async_trait]
impl NodeHandler for JsonParseNode {
    fn kind(&self) -> &'static str {
        "json-parse"
    }

    fn family(&self) -> NodeFamily {
        NodeFamily::Utility
    }

    fn validate(&self, config: &JsonValue) -> Result<(), NodeError> {
        if config.get("input").is_none() {
            return Err(NodeError::config("`input` is required"));
        }
        Ok(())
    }

    async fn execute(
        &self,
        config: &JsonValue,
        _ctx: &NodeContext<'_>,
    ) -> Result<Outcome, NodeError> {
        let parsed = match config.get("input") {
            Some(JsonValue::String(text)) => {
                serde_json::from_str(text).map_err(|e| NodeError::InvalidJson {
                    reason: e.to_string(),
                })?
            }
            Some(value @ (JsonValue::Object(_) | JsonValue::Array(_))) => value.clone(),
            Some(JsonValue::Null) | None => {
                return Err(NodeError::InvalidJson {
                    reason: "input is empty".to_string(),
                });
            }
            Some(other) => {
                return Err(NodeError::InvalidJson {
                    reason: format!("expected a JSON string, got {other}"),
                });
            }
        };

        let mut step = NodeOutput::new(json!({ "data": parsed }));
        if let Some(name) = str_field(config, "variable") {
            let mut variables = Map::new();
            variables.insert(sanitize_identifier(name), parsed);
            step = step.with_variables(variables);
        }
        Ok(Outcome::Continue(step))
    }
}

/// Fails the node when a condition is false.
#[derive(Debug, Default, Clone, Copy)]
pub struct AssertNode;

const DEFAULT_ASSERT_MESSAGE: &str = "assertion failed";

#[async_trait]
impl NodeHandler for AssertNode {
    fn kind(&self) -> &'static str {
        "assert"
    }

    fn family(&self) -> NodeFamily {
        NodeFamily::Utility
    }

    fn validate(&self, config: &JsonValue) -> Result<(), NodeError> {
        validate_expression(config, "condition")
    }

    async fn execute(
        &self,
        config: &JsonValue,
        ctx: &NodeContext<'_>,
    ) -> Result<Outcome, NodeError> {
        let condition = expression(ctx, "condition")?;
        if condition.eval_bool(ctx.context) {
            return Ok(Outcome::next(json!({ "passed": true })));
        }
        let message = str_field(config, "message").unwrap_or(DEFAULT_ASSERT_MESSAGE);
        Err(NodeError::AssertionFailed {
            message: message.to_string(),
        })
    }
}

/// Handles the failure recorded in `last_error`.
///
/// Reached through a failed node's `error` edge. With `action: "continue"`
/// (the default) it clears the error and follows `next`; with
/// `action: "stop"` it stops the run, using `reason` or the error message.
#[derive(Debug, Default, Clone, Copy)]
pub struct ErrorHandlerNode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ErrorAction {
    Continue,
    Stop,
}

fn error_action(config: &JsonValue) -> Result<ErrorAction, NodeError> {
    if bool_field(config, "stop") == Some(true) {
        return Ok(ErrorAction::Stop);
    }
    match str_field(config, "action").unwrap_or("continue") {
        "continue" => Ok(ErrorAction::Continue),
        "stop" => Ok(ErrorAction::Stop),
        other => Err(NodeError::config(format!(
            "unknown error-handler action '{other}'"
        ))),
    }
}

#[async_trait]
impl NodeHandler for ErrorHandlerNode {
    fn kind(&self) -> &'static str {
        "error-handler"
    }

    fn family(&self) -> NodeFamily {
        NodeFamily::Utility
    }

    fn validate(&self, config: &JsonValue) -> Result<(), NodeError> {
        error_action(config).map(|_| ())
    }

    async fn execute(
        &self,
        config: &JsonValue,
        ctx: &NodeContext<'_>,
    ) -> Result<Outcome, NodeError> {
        let Some(last_error) = &ctx.context.last_error else {
            debug!("no error to handle");
            return Ok(Outcome::next(json!({ "handled": false })));
        };

        match error_action(config)? {
            ErrorAction::Continue => {
                info!(
                    failed_node = %last_error.node_id,
                    code = last_error.error.code(),
                    "error handled; continuing"
                );
                let error = serde_json::to_value(last_error).unwrap_or(JsonValue::Null);
                Ok(Outcome::Continue(
                    NodeOutput::new(json!({ "handled": true, "error": error })).clearing_error(),
                ))
            }
            ErrorAction::Stop => {
                let reason = str_field(config, "reason")
                    .map_or_else(|| last_error.message.clone(), str::to_string);
                info!(failed_node = %last_error.node_id, %reason, "error handled; stopping");
                Ok(Outcome::Stop {
                    reason: Some(reason),
                })
            }
        }
    }
}
