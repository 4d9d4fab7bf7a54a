//! The `http-request` node kind.

use crate::config::{number_field, required_str, str_field};
use async_trait::async_trait;
use relayflow_workflow::{NodeContext, NodeError, NodeFamily, NodeHandler, Outcome};
use reqwest::{Client, Method};
use serde_json::{Map, Value as JsonValue, json};
use std::time::Duration;
use tracing::debug;

const DEFAULT_TIMEOUT_SECONDS: f64 = 30.0;
const MAX_TIMEOUT_SECONDS: f64 = 300.0;

/// Performs an outbound HTTP call.
///
/// Config:
/// - `url` (required) and `method` (default `GET`)
/// - `headers`: object of header names to string values
/// - `body`: a string is sent as is, anything else as JSON
/// - `timeout_seconds`: default 30, capped at 300
///
/// Output is `{ status, ok, headers, body }`, where `body` is parsed JSON
/// when the response is JSON and text otherwise. Non-2xx responses are
/// returned, not raised; only transport failures fail the node.
#[derive(Debug, Clone)]
pub struct HttpRequestNode {
    client: Client,
}

impl HttpRequestNode {
    /// Creates the node over a shared client.
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

fn method(config: &JsonValue) -> Result<Method, NodeError> {
    let raw = str_field(config, "method").unwrap_or("GET");
    Method::from_bytes(raw.to_ascii_uppercase().as_bytes())
        .map_err(|_| NodeError::config(format!("invalid HTTP method '{raw}'")))
}

fn header_value(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        JsonValue::Null => String::new(),
        other => other.to_string(),
    }
}

#[async_trait]
impl NodeHandler for HttpRequestNode {
    fn kind(&self) -> &'static str {
        "http-request"
    }

    fn family(&self) -> NodeFamily {
        NodeFamily::Utility
    }

    fn validate(&self, config: &JsonValue) -> Result<(), NodeError> {
        required_str(config, "url")?;
        method(config)?;
        match config.get("headers") {
            None | Some(JsonValue::Null | JsonValue::Object(_)) => Ok(()),
            Some(_) => Err(NodeError::config("`headers` must be an object")),
        }
    }

    async fn execute(
        &self,
        config: &JsonValue,
        _ctx: &NodeContext<'_>,
    ) -> Result<Outcome, NodeError> {
        let url = required_str(config, "url")?;
        let method = method(config)?;
        let timeout = number_field(config, "timeout_seconds")
            .filter(|s| s.is_finite() && *s > 0.0)
            .unwrap_or(DEFAULT_TIMEOUT_SECONDS)
            .min(MAX_TIMEOUT_SECONDS);

        let mut request = self
            .client
            .request(method.clone(), url)
            .timeout(Duration::from_secs_f64(timeout));
        if let Some(JsonValue::Object(headers)) = config.get("headers") {
            for (name, value) in headers {
                request = request.header(name.as_str(), header_value(value));
            }
        }
        match config.get("body") {
            None | Some(JsonValue::Null) => {}
            Some(JsonValue::String(text)) => request = request.body(text.clone()),
            Some(body) => request = request.json(body),
        }

        let response = request.send().await.map_err(|e| NodeError::Http {
            reason: e.to_string(),
        })?;
        let status = response.status();
        let headers: Map<String, JsonValue> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), JsonValue::String(v.to_string())))
            })
            .collect();
        let text = response.text().await.map_err(|e| NodeError::Http {
            reason: e.to_string(),
        })?;
        let body = serde_json::from_str(&text).unwrap_or(JsonValue::String(text));
        debug!(%method, url, status = status.as_u16(), "http request finished");

        Ok(Outcome::next(json!({
            "status": status.as_u16(),
            "ok": status.is_success(),
            "headers": headers,
            "body": body,
        })))
    }
}
