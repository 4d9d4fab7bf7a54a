//! `{{ path }}` substitution in node configuration.
//!
//! Before a node runs, every string in its configuration is scanned for
//! placeholders. A string that is exactly one placeholder is replaced by
//! the referenced value with its JSON type intact; placeholders embedded in
//! longer text are rendered as text. Missing paths render as `null` when
//! standalone and as an empty string when embedded.

use crate::expression::Scope;
use serde_json::Value as JsonValue;

/// Resolves all placeholders in a configuration value.
#[must_use]
pub fn resolve_config(config: &JsonValue, scope: &dyn Scope) -> JsonValue {
    match config {
        JsonValue::String(s) => resolve_str(s, scope),
        JsonValue::Array(items) => {
            JsonValue::Array(items.iter().map(|v| resolve_config(v, scope)).collect())
        }
        JsonValue::Object(map) => JsonValue::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_config(v, scope)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Resolves placeholders in a single string.
#[must_use]
pub fn resolve_str(template: &str, scope: &dyn Scope) -> JsonValue {
    if let Some(path) = sole_placeholder(template) {
        return scope.resolve(path).unwrap_or(JsonValue::Null);
    }
    if !template.contains("{{") {
        return JsonValue::String(template.to_string());
    }
    JsonValue::String(render(template, scope))
}

/// Renders a template as text.
#[must_use]
pub fn render(template: &str, scope: &dyn Scope) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find("{{") {
        out.push_str(&rest[..open]);
        let after = &rest[open + 2..];
        let Some(close) = after.find("}}") else {
            out.push_str(&rest[open..]);
            return out;
        };
        let path = after[..close].trim();
        if let Some(value) = scope.resolve(path) {
            match value {
                JsonValue::String(s) => out.push_str(&s),
                JsonValue::Null => {}
                other => out.push_str(&other.to_string()),
            }
        }
        rest = &after[close + 2..];
    }
    out.push_str(rest);
    out
}

fn sole_placeholder(template: &str) -> Option<&str> {
    let inner = template
        .trim()
        .strip_prefix("{{")?
        .strip_suffix("}}")?;
    (!inner.contains("{{") && !inner.contains("}}")).then(|| inner.trim())
}
