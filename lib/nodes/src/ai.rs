//! AI node kinds.
//!
//! Each kind builds a prompt from its configuration and the text under
//! analysis, asks the completion provider for one JSON object, and reads
//! the fields it needs. Output the model gets wrong never fails the node:
//! a deterministic heuristic stands in and the output is marked with
//! `"fallback": true`. Only an unreachable provider is an error.

use crate::config::{bool_field, number_field, required_str, str_field, string_list};
use async_trait::async_trait;
use regex::Regex;
use relayflow_ai::{LlmBackend, LlmRequest, parse_json_object};
use relayflow_workflow::{
    NodeContext, NodeError, NodeFamily, NodeHandler, NodeOutput, Outcome, sanitize_identifier,
};
use serde_json::{Map, Value as JsonValue, json};
use std::sync::{Arc, LazyLock};
use tracing::{debug, warn};

/// Variable read when a node has no `text` configured.
pub const DEFAULT_TEXT_VARIABLE: &str = "message_text";

/// Intent reported when nothing matches.
pub const UNKNOWN_INTENT: &str = "unknown";

const DEFAULT_TEMPERATURE: f32 = 0.0;

/// Text the node analyzes: `text` from config, else the message text.
fn input_text(config: &JsonValue, ctx: &NodeContext<'_>) -> String {
    match config.get("text") {
        Some(JsonValue::String(s)) => s.clone(),
        Some(JsonValue::Null) | None => ctx
            .context
            .lookup(DEFAULT_TEXT_VARIABLE)
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default(),
        Some(other) => other.to_string(),
    }
}

fn request(config: &JsonValue, system: String, prompt: String) -> LlmRequest {
    let mut request = LlmRequest::new(prompt)
        .with_system(system)
        .json_object()
        .with_temperature(
            number_field(config, "temperature").map_or(DEFAULT_TEMPERATURE, |t| t as f32),
        );
    if let Some(max) = number_field(config, "max_tokens").filter(|m| *m >= 1.0) {
        request = request.with_max_tokens(max as u32);
    }
    request
}

/// Calls the provider and parses its reply.
///
/// `Ok(Err(raw))` carries the raw content when it was not one JSON object.
async fn complete(
    llm: &dyn LlmBackend,
    request: &LlmRequest,
) -> Result<Result<Map<String, JsonValue>, String>, NodeError> {
    let response = llm.generate(request).await.map_err(|e| NodeError::Provider {
        reason: e.to_string(),
    })?;
    debug!(
        model = %response.model,
        tokens = response.usage.total(),
        "completion received"
    );
    Ok(parse_json_object(&response.content).map_err(|e| {
        warn!(error = %e, "model output rejected; using fallback");
        response.content
    }))
}

fn confidence(map: &Map<String, JsonValue>) -> f64 {
    map.get("confidence")
        .and_then(JsonValue::as_f64)
        .map_or(0.5, |c| c.clamp(0.0, 1.0))
}

/// Classifies text into one of the configured intents.
///
/// Config: `intents` (list of names), optional `text` and `instructions`.
/// The chosen intent is also the output handle, so edges can branch on it;
/// `unknown` is used when no intent fits.
pub struct IntentDetectionNode {
    llm: Arc<dyn LlmBackend>,
}

impl IntentDetectionNode {
    /// Creates the node over a completion provider.
    #[must_use]
    pub fn new(llm: Arc<dyn LlmBackend>) -> Self {
        Self { llm }
    }
}

/// First candidate named in `haystack`, ignoring case.
fn match_intent(candidates: &[String], haystack: &str) -> Option<String> {
    let haystack = haystack.to_lowercase();
    candidates
        .iter()
        .find(|c| haystack.contains(&c.to_lowercase()))
        .cloned()
}

#[async_trait]
impl NodeHandler for IntentDetectionNode {
    fn kind(&self) -> &'static str {
        "intent-detection"
    }

    fn family(&self) -> NodeFamily {
        NodeFamily::Ai
    }

    fn validate(&self, config: &JsonValue) -> Result<(), NodeError> {
        match config.get("intents") {
            Some(JsonValue::String(s)) if s.contains("{{") => Ok(()),
            _ if string_list(config, "intents").is_empty() => {
                Err(NodeError::config("`intents` must list at least one intent"))
            }
            _ => Ok(()),
        }
    }

    async fn execute(
        &self,
        config: &JsonValue,
        ctx: &NodeContext<'_>,
    ) -> Result<Outcome, NodeError> {
        let intents = string_list(config, "intents");
        if intents.is_empty() {
            return Err(NodeError::config("`intents` must list at least one intent"));
        }
        let text = input_text(config, ctx);
        let mut system = format!(
            "Classify the customer's message into exactly one of these intents: {}. \
             If none fits, use \"{UNKNOWN_INTENT}\". Respond with a single JSON object \
             {{\"intent\": string, \"confidence\": number between 0 and 1}} and nothing else.",
            intents.join(", ")
        );
        if let Some(extra) = str_field(config, "instructions") {
            system.push_str("\n\n");
            system.push_str(extra);
        }

        let (intent, confidence, fallback) =
            match complete(self.llm.as_ref(), &request(config, system, text.clone())).await? {
                Ok(map) => {
                    let named = map.get("intent").and_then(JsonValue::as_str).unwrap_or("");
                    match intents.iter().find(|i| i.eq_ignore_ascii_case(named.trim())) {
                        Some(intent) => (intent.clone(), confidence(&map), false),
                        None if named.trim().eq_ignore_ascii_case(UNKNOWN_INTENT) => {
                            (UNKNOWN_INTENT.to_string(), confidence(&map), false)
                        }
                        None => intent_fallback(&intents, named, &text),
                    }
                }
                Err(raw) => intent_fallback(&intents, &raw, &text),
            };

        Ok(Outcome::Continue(NodeOutput::branch(
            intent.clone(),
            json!({ "intent": intent, "confidence": confidence, "fallback": fallback }),
        )))
    }
}

fn intent_fallback(intents: &[String], raw: &str, text: &str) -> (String, f64, bool) {
    match match_intent(intents, raw).or_else(|| match_intent(intents, text)) {
        Some(intent) => (intent, 0.3, true),
        None => (UNKNOWN_INTENT.to_string(), 0.0, true),
    }
}

/// Rates the sentiment of text as `positive`, `neutral` or `negative`.
///
/// The label is also the output handle.
pub struct SentimentDetectionNode {
    llm: Arc<dyn LlmBackend>,
}

impl SentimentDetectionNode {
    /// Creates the node over a completion provider.
    #[must_use]
    pub fn new(llm: Arc<dyn LlmBackend>) -> Self {
        Self { llm }
    }
}

const SENTIMENTS: [&str; 3] = ["positive", "neutral", "negative"];

#[async_trait]
impl NodeHandler for SentimentDetectionNode {
    fn kind(&self) -> &'static str {
        "sentiment-detection"
    }

    fn family(&self) -> NodeFamily {
        NodeFamily::Ai
    }

    async fn execute(
        &self,
        config: &JsonValue,
        ctx: &NodeContext<'_>,
    ) -> Result<Outcome, NodeError> {
        let text = input_text(config, ctx);
        let system = "Rate the sentiment of the customer's message. Respond with a single JSON \
                      object {\"sentiment\": \"positive\" | \"neutral\" | \"negative\", \
                      \"score\": number between -1 and 1} and nothing else."
            .to_string();

        let parsed = complete(self.llm.as_ref(), &request(config, system, text)).await?;
        let reading = parsed.ok().and_then(|map| {
            let label = map.get("sentiment")?.as_str()?.trim().to_lowercase();
            let label = SENTIMENTS.into_iter().find(|s| *s == label)?;
            let score = map
                .get("score")
                .and_then(JsonValue::as_f64)
                .map_or_else(|| default_score(label), |s| s.clamp(-1.0, 1.0));
            Some((label, score))
        });
        let fallback = reading.is_none();
        let (sentiment, score) = reading.unwrap_or(("neutral", 0.0));

        Ok(Outcome::Continue(NodeOutput::branch(
            sentiment,
            json!({ "sentiment": sentiment, "score": score, "fallback": fallback }),
        )))
    }
}

fn default_score(label: &str) -> f64 {
    match label {
        "positive" => 0.5,
        "negative" => -0.5,
        _ => 0.0,
    }
}

static EMAIL: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").ok());
static PHONE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\+?\d[\d\s().-]{6,}\d").ok());
static URL: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"https?://\S+").ok());

/// Extracts named entities from text.
///
/// Config: `entities` (names to extract). Output has an `entities` object
/// with one key per requested name, `null` when absent. Extracted values
/// are also merged into run variables under their sanitized names when
/// `store_variables` is true.
pub struct EntityExtractionNode {
    llm: Arc<dyn LlmBackend>,
}

impl EntityExtractionNode {
    /// Creates the node over a completion provider.
    #[must_use]
    pub fn new(llm: Arc<dyn LlmBackend>) -> Self {
        Self { llm }
    }
}

/// Pattern-based extraction for well-known entity names.
fn heuristic_entity(name: &str, text: &str) -> JsonValue {
    let lowered = name.to_lowercase();
    let pattern: &Option<Regex> = if lowered.contains("email") {
        &EMAIL
    } else if lowered.contains("phone") || lowered.contains("mobile") {
        &PHONE
    } else if lowered.contains("url") || lowered.contains("link") || lowered.contains("website") {
        &URL
    } else {
        return JsonValue::Null;
    };
    pattern
        .as_ref()
        .and_then(|re| re.find(text))
        .map_or(JsonValue::Null, |m| JsonValue::String(m.as_str().trim().to_string()))
}

#[async_trait]
impl NodeHandler for EntityExtractionNode {
    fn kind(&self) -> &'static str {
        "entity-extraction"
    }

    fn family(&self) -> NodeFamily {
        NodeFamily::Ai
    }

    async fn execute(
        &self,
        config: &JsonValue,
        ctx: &NodeContext<'_>,
    ) -> Result<Outcome, NodeError> {
        let names = string_list(config, "entities");
        if names.is_empty() {
            return Err(NodeError::config("`entities` must list at least one entity"));
        }
        let text = input_text(config, ctx);
        let system = format!(
            "Extract these entities from the customer's message: {}. Respond with a single \
             JSON object {{\"entities\": {{<name>: string or null}}}} using exactly those \
             names, and nothing else.",
            names.join(", ")
        );

        let extracted = match complete(self.llm.as_ref(), &request(config, system, text.clone()))
            .await?
        {
            Ok(map) => match map.get("entities") {
                Some(JsonValue::Object(found)) => Some(found.clone()),
                _ => None,
            },
            Err(_) => None,
        };
        let fallback = extracted.is_none();
        let entities: Map<String, JsonValue> = names
            .iter()
            .map(|name| {
                let value = match &extracted {
                    Some(found) => found.get(name).cloned().unwrap_or(JsonValue::Null),
                    None => heuristic_entity(name, &text),
                };
                (name.clone(), value)
            })
            .collect();

        let mut step = NodeOutput::new(json!({ "entities": entities, "fallback": fallback }));
        if bool_field(config, "store_variables") == Some(true) {
            step = step.with_variables(
                entities
                    .iter()
                    .filter(|(_, v)| !v.is_null())
                    .map(|(k, v)| (sanitize_identifier(k), v.clone()))
                    .collect(),
            );
        }
        Ok(Outcome::Continue(step))
    }
}

/// Free-form assistant turn.
///
/// Config: `prompt` (rendered against the context) and optional `system`.
/// The model must answer with an object holding at least `reply`; any
/// other fields it returns are kept in the output. Content that is not a
/// JSON object becomes the reply verbatim.
pub struct GeneralAgentNode {
    llm: Arc<dyn LlmBackend>,
}

impl GeneralAgentNode {
    /// Creates the node over a completion provider.
    #[must_use]
    pub fn new(llm: Arc<dyn LlmBackend>) -> Self {
        Self { llm }
    }
}

const AGENT_SYSTEM: &str = "You are a helpful customer service assistant for a business. \
                            Respond with a single JSON object {\"reply\": string} and nothing \
                            else. You may add other fields if asked to.";

#[async_trait]
impl NodeHandler for GeneralAgentNode {
    fn kind(&self) -> &'static str {
        "general-agent"
    }

    fn family(&self) -> NodeFamily {
        NodeFamily::Ai
    }

    fn validate(&self, config: &JsonValue) -> Result<(), NodeError> {
        required_str(config, "prompt").map(|_| ())
    }

    async fn execute(
        &self,
        config: &JsonValue,
        _ctx: &NodeContext<'_>,
    ) -> Result<Outcome, NodeError> {
        let prompt = required_str(config, "prompt")?.to_string();
        let mut system = str_field(config, "system").unwrap_or(AGENT_SYSTEM).to_string();
        if !system.contains("JSON") {
            system.push_str("\n\nRespond with a single JSON object {\"reply\": string}.");
        }

        let output = match complete(self.llm.as_ref(), &request(config, system, prompt)).await? {
            Ok(mut map) => {
                let fallback = !map.get("reply").is_some_and(JsonValue::is_string);
                if fallback {
                    let reply = map.get("reply").map(|v| v.to_string()).unwrap_or_default();
                    map.insert("reply".to_string(), JsonValue::String(reply));
                }
                map.insert("fallback".to_string(), JsonValue::Bool(fallback));
                map
            }
            Err(raw) => {
                let mut map = Map::new();
                map.insert("reply".to_string(), JsonValue::String(raw.trim().to_string()));
                map.insert("fallback".to_string(), JsonValue::Bool(true));
                map
            }
        };
        Ok(Outcome::next(JsonValue::Object(output)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::run_node;
    use relayflow_ai::{LlmError, ScriptedBackend};
    use relayflow_workflow::{Node, RunContext};

    fn message(text: &str) -> RunContext {
        let mut context = RunContext::new(JsonValue::Null);
        context
            .variables
            .insert(DEFAULT_TEXT_VARIABLE.to_string(), json!(text));
        context
    }

    fn continued(outcome: Outcome) -> NodeOutput {
        match outcome {
            Outcome::Continue(step) => step,
            other => panic!("expected continue, got {other:?}"),
        }
    }

    fn intent_node() -> Node {
        Node::new("intent", "intent-detection")
            .with_config(json!({"intents": ["billing", "support"]}))
    }

    #[tokio::test]
    async fn intent_from_model_becomes_handle() {
        let llm = Arc::new(
            ScriptedBackend::new().reply(r#"{"intent": "Billing", "confidence": 0.92}"#),
        );
        let handler = IntentDetectionNode::new(llm.clone());
        let step = continued(
            run_node(&handler, &intent_node(), &message("my invoice is wrong"))
                .await
                .unwrap(),
        );
        assert_eq!(step.handle.as_deref(), Some("billing"));
        assert_eq!(step.output["confidence"], 0.92);
        assert_eq!(step.output["fallback"], false);

        let sent = llm.requests();
        assert!(sent[0].json_object);
        assert_eq!(sent[0].prompt, "my invoice is wrong");
    }

    #[tokio::test]
    async fn intent_falls_back_to_substring_match() {
        let llm = Arc::new(ScriptedBackend::new().reply("I think this is about support."));
        let handler = IntentDetectionNode::new(llm);
        let step = continued(
            run_node(&handler, &intent_node(), &message("help"))
                .await
                .unwrap(),
        );
        assert_eq!(step.handle.as_deref(), Some("support"));
        assert_eq!(step.output["fallback"], true);
    }

    #[tokio::test]
    async fn intent_unmatched_is_unknown() {
        let llm = Arc::new(ScriptedBackend::new().reply(r#"{"intent": "weather"}"#));
        let handler = IntentDetectionNode::new(llm);
        let step = continued(
            run_node(&handler, &intent_node(), &message("is it sunny?"))
                .await
                .unwrap(),
        );
        assert_eq!(step.handle.as_deref(), Some(UNKNOWN_INTENT));
        assert_eq!(step.output["confidence"], 0.0);
    }

    #[tokio::test]
    async fn provider_failure_fails_node() {
        let llm = Arc::new(ScriptedBackend::new().fail(LlmError::Timeout));
        let handler = IntentDetectionNode::new(llm);
        let err = run_node(&handler, &intent_node(), &message("hi"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "provider");
    }

    #[tokio::test]
    async fn sentiment_reads_label_or_defaults_to_neutral() {
        let node = Node::new("mood", "sentiment-detection");
        let llm = Arc::new(
            ScriptedBackend::new()
                .reply(r#"{"sentiment": "NEGATIVE", "score": -0.8}"#)
                .reply("```json\n[\"angry\"]\n```"),
        );
        let handler = SentimentDetectionNode::new(llm);

        let step = continued(run_node(&handler, &node, &message("awful")).await.unwrap());
        assert_eq!(step.handle.as_deref(), Some("negative"));
        assert_eq!(step.output["score"], -0.8);

        let step = continued(run_node(&handler, &node, &message("meh")).await.unwrap());
        assert_eq!(step.handle.as_deref(), Some("neutral"));
        assert_eq!(step.output["fallback"], true);
    }

    #[tokio::test]
    async fn entities_fall_back_to_patterns() {
        let node = Node::new("extract", "entity-extraction").with_config(json!({
            "entities": ["email", "phone", "company"],
            "store_variables": true
        }));
        let llm = Arc::new(ScriptedBackend::new().reply("not json"));
        let handler = EntityExtractionNode::new(llm);
        let step = continued(
            run_node(
                &handler,
                &node,
                &message("reach me at ada@example.com or +1 555 010 9999"),
            )
            .await
            .unwrap(),
        );
        let entities = &step.output["entities"];
        assert_eq!(entities["email"], "ada@example.com");
        assert_eq!(entities["phone"], "+1 555 010 9999");
        assert_eq!(entities["company"], JsonValue::Null);
        assert_eq!(step.variables["email"], "ada@example.com");
        assert!(!step.variables.contains_key("company"));
    }

    #[tokio::test]
    async fn entities_from_model() {
        let node = Node::new("extract", "entity-extraction")
            .with_config(json!({"entities": ["company"], "text": "{{ note }}"}));
        let mut context = RunContext::new(JsonValue::Null);
        context.variables.insert("note".to_string(), json!("from Acme"));
        let llm = Arc::new(ScriptedBackend::new().reply(r#"{"entities": {"company": "Acme"}}"#));
        let handler = EntityExtractionNode::new(llm.clone());
        let step = continued(run_node(&handler, &node, &context).await.unwrap());
        assert_eq!(step.output["entities"]["company"], "Acme");
        assert_eq!(llm.requests()[0].prompt, "from Acme");
    }

    #[tokio::test]
    async fn agent_keeps_raw_text_as_reply() {
        let node = Node::new("agent", "general-agent")
            .with_config(json!({"prompt": "Greet {{ sender_name }}"}));
        let mut context = RunContext::new(JsonValue::Null);
        context.variables.insert("sender_name".to_string(), json!("Ada"));
        let llm = Arc::new(
            ScriptedBackend::new()
                .reply(r#"{"reply": "Hi Ada!", "tone": "warm"}"#)
                .reply("  Hello there  "),
        );
        let handler = GeneralAgentNode::new(llm.clone());

        let step = continued(run_node(&handler, &node, &context).await.unwrap());
        assert_eq!(step.output["reply"], "Hi Ada!");
        assert_eq!(step.output["tone"], "warm");
        assert_eq!(llm.requests()[0].prompt, "Greet Ada");

        let step = continued(run_node(&handler, &node, &context).await.unwrap());
        assert_eq!(step.output["reply"], "Hello there");
        assert_eq!(step.output["fallback"], true);
    }
}
