//! Strict parsing of model output as a single JSON object.

use crate::error::JsonObjectError;
use serde_json::{Map, Value as JsonValue};

/// Parses `text` as exactly one JSON object.
///
/// Surrounding whitespace and a single markdown code fence are tolerated.
/// Anything else (prose before or after, arrays, several objects) is
/// rejected so callers can fall back to a heuristic.
///
/// # Errors
///
/// Returns a [`JsonObjectError`] describing why the text was rejected.
pub fn parse_json_object(text: &str) -> Result<Map<String, JsonValue>, JsonObjectError> {
    let body = strip_fence(text.trim());
    if body.is_empty() {
        return Err(JsonObjectError::Empty);
    }
    let value: JsonValue =
        serde_json::from_str(body).map_err(|e| JsonObjectError::Malformed {
            reason: e.to_string(),
        })?;
    match value {
        JsonValue::Object(map) => Ok(map),
        JsonValue::Array(_) => Err(JsonObjectError::NotAnObject { found: "array" }),
        JsonValue::String(_) => Err(JsonObjectError::NotAnObject { found: "string" }),
        JsonValue::Number(_) => Err(JsonObjectError::NotAnObject { found: "number" }),
        JsonValue::Bool(_) => Err(JsonObjectError::NotAnObject { found: "boolean" }),
        JsonValue::Null => Err(JsonObjectError::NotAnObject { found: "null" }),
    }
}

fn strip_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    let Some(inner) = rest.strip_suffix("```") else {
        return text;
    };
    // Drop an info string such as `json` on the opening line.
    match inner.split_once('\n') {
        Some((info, body)) if !info.trim_start().starts_with('{') => body.trim(),
        _ => inner.trim(),
    }
}
