//! Helpers for reading node configuration.

use relayflow_workflow::{Expression, NodeContext, NodeError};
use serde_json::Value as JsonValue;

pub(crate) fn str_field<'a>(config: &'a JsonValue, key: &str) -> Option<&'a str> {
    config
        .get(key)
        .and_then(JsonValue::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

pub(crate) fn required_str<'a>(config: &'a JsonValue, key: &str) -> Result<&'a str, NodeError> {
    str_field(config, key).ok_or_else(|| NodeError::config(format!("`{key}` is required")))
}

pub(crate) fn bool_field(config: &JsonValue, key: &str) -> Option<bool> {
    match config.get(key)? {
        JsonValue::Bool(b) => Some(*b),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Numbers may arrive as strings once templates are resolved.
pub(crate) fn number_field(config: &JsonValue, key: &str) -> Option<f64> {
    match config.get(key)? {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Parses the expression stored under `key` in the node's authored config.
///
/// Expressions are read before template resolution, so resolved context
/// values are only ever operands and never grammar.
pub(crate) fn expression(ctx: &NodeContext<'_>, key: &str) -> Result<Expression, NodeError> {
    Ok(Expression::parse(required_str(&ctx.node.config, key)?)?)
}

/// Whether the authored config has a non-blank expression under `key`.
pub(crate) fn has_expression(ctx: &NodeContext<'_>, key: &str) -> bool {
    str_field(&ctx.node.config, key).is_some()
}

/// Checks an expression at validation time.
///
/// Expressions name context paths directly; `{{ }}` placeholders are
/// rejected.
pub(crate) fn validate_expression(config: &JsonValue, key: &str) -> Result<(), NodeError> {
    let source = required_str(config, key)?;
    if source.contains("{{") {
        return Err(NodeError::config(format!(
            "`{key}` must reference context paths directly, not through `{{{{ }}}}` placeholders"
        )));
    }
    Expression::parse(source)?;
    Ok(())
}

/// String list under `key`, skipping blanks.
pub(crate) fn string_list(config: &JsonValue, key: &str) -> Vec<String> {
    config
        .get(key)
        .and_then(JsonValue::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|v| match v {
                    JsonValue::String(s) => Some(s.trim().to_string()),
                    JsonValue::Object(o) => o
                        .get("name")
                        .and_then(JsonValue::as_str)
                        .map(|s| s.trim().to_string()),
                    _ => None,
                })
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}
