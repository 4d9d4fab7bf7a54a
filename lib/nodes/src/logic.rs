//! Logic node kinds: `if-else`, `switch`, `wait`, `loop` and `stop`.

use crate::config::{
    bool_field, expression, has_expression, number_field, required_str, str_field,
    validate_expression,
};
use async_trait::async_trait;
use chrono::Duration;
use relayflow_workflow::{
    DEAD_END_HANDLE, NodeContext, NodeError, NodeFamily, NodeHandler, NodeOutput, Outcome,
    StateChange, loose_eq,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};
use tracing::{debug, warn};

/// Handle a `switch` follows when no case matches.
pub const DEFAULT_CASE_HANDLE: &str = "default";

/// Handle a `loop` follows for each element.
pub const LOOP_ITEM_HANDLE: &str = "item";

/// Handle a `loop` follows once its elements are exhausted.
pub const LOOP_DONE_HANDLE: &str = "done";

/// Most elements a `loop` iterates over.
pub const MAX_LOOP_ITEMS: usize = 100;

/// Branches on a boolean condition, following `true` or `false`.
#[derive(Debug, Default, Clone, Copy)]
pub struct IfElseNode;

#[async_trait]
impl NodeHandler for IfElseNode {
    fn kind(&self) -> &'static str {
        "if-else"
    }

    fn family(&self) -> NodeFamily {
        NodeFamily::Logic
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
        let result = condition.eval_bool(ctx.context);
        debug!(condition = condition.source(), result, "condition evaluated");
        let handle = if result { "true" } else { "false" };
        Ok(Outcome::branch(handle, json!({ "result": result })))
    }
}

/// Selects the first case whose value loosely equals the switch value.
///
/// Config:
/// - `expression`: evaluated against the context, or
/// - `value`: used as is (after template resolution)
/// - `cases`: ordered `[{ "id", "value" }]`; a case without an id is
///   reached through `case_<index>`
/// - `fallback`: follow `default` when nothing matches (default `true`)
#[derive(Debug, Default, Clone, Copy)]
pub struct SwitchNode;

#[derive(Debug, Deserialize)]
struct SwitchCase {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    value: JsonValue,
}

impl SwitchCase {
    fn handle(&self, index: usize) -> String {
        match self.id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => format!("case_{index}"),
        }
    }
}

fn switch_cases(config: &JsonValue) -> Result<Vec<SwitchCase>, NodeError> {
    match config.get("cases") {
        None | Some(JsonValue::Null) => Ok(Vec::new()),
        Some(cases) => serde_json::from_value(cases.clone())
            .map_err(|e| NodeError::config(format!("`cases` must be a list of cases: {e}"))),
    }
}

#[async_trait]
impl NodeHandler for SwitchNode {
    fn kind(&self) -> &'static str {
        "switch"
    }

    fn family(&self) -> NodeFamily {
        NodeFamily::Logic
    }

    fn validate(&self, config: &JsonValue) -> Result<(), NodeError> {
        if str_field(config, "expression").is_some() {
            validate_expression(config, "expression")?;
        } else if config.get("value").is_none() {
            return Err(NodeError::config("`expression` or `value` is required"));
        }
        switch_cases(config).map(|_| ())
    }

    async fn execute(
        &self,
        config: &JsonValue,
        ctx: &NodeContext<'_>,
    ) -> Result<Outcome, NodeError> {
        let value = if has_expression(ctx, "expression") {
            expression(ctx, "expression")?.eval_value(ctx.context)
        } else {
            config.get("value").cloned().unwrap_or(JsonValue::Null)
        };
        let cases = switch_cases(config)?;

        let matched = cases
            .iter()
            .enumerate()
            .find(|(_, case)| loose_eq(&case.value, &value))
            .map(|(index, case)| case.handle(index));

        let handle = match &matched {
            Some(handle) => handle.clone(),
            None if bool_field(config, "fallback").unwrap_or(true) => {
                DEFAULT_CASE_HANDLE.to_string()
            }
            None => {
                warn!(
                    node_id = %ctx.node.id,
                    %value,
                    "no switch case matched and fallback is disabled"
                );
                DEAD_END_HANDLE.to_string()
            }
        };
        Ok(Outcome::branch(
            handle,
            json!({ "value": value, "matched": matched }),
        ))
    }
}

/// Suspends the run for a duration.
///
/// Config: `duration` (non-negative number) and `unit` (`seconds`,
/// `minutes`, `hours` or `days`; default `minutes`).
#[derive(Debug, Default, Clone, Copy)]
pub struct WaitNode;

fn wait_duration(config: &JsonValue) -> Result<Duration, NodeError> {
    let amount = number_field(config, "duration")
        .ok_or_else(|| NodeError::config("`duration` must be a number"))?;
    if !amount.is_finite() || amount < 0.0 {
        return Err(NodeError::config("`duration` must be non-negative"));
    }
    let unit = str_field(config, "unit").unwrap_or("minutes");
    let seconds_per_unit = match unit.to_ascii_lowercase().as_str() {
        "second" | "seconds" | "s" => 1.0,
        "minute" | "minutes" | "m" => 60.0,
        "hour" | "hours" | "h" => 3_600.0,
        "day" | "days" | "d" => 86_400.0,
        other => return Err(NodeError::config(format!("unknown wait unit '{other}'"))),
    };
    let millis = amount * seconds_per_unit * 1_000.0;
    // Cap at one year to stay well inside chrono's range.
    if millis > 31_536_000_000.0 {
        return Err(NodeError::config("wait is longer than one year"));
    }
    Ok(Duration::milliseconds(millis.round() as i64))
}

#[async_trait]
impl NodeHandler for WaitNode {
    fn kind(&self) -> &'static str {
        "wait"
    }

    fn family(&self) -> NodeFamily {
        NodeFamily::Logic
    }

    fn validate(&self, config: &JsonValue) -> Result<(), NodeError> {
        let templated = |key: &str| str_field(config, key).is_some_and(|s| s.contains("{{"));
        if templated("duration") || templated("unit") {
            return Ok(());
        }
        wait_duration(config).map(|_| ())
    }

    async fn execute(
        &self,
        config: &JsonValue,
        ctx: &NodeContext<'_>,
    ) -> Result<Outcome, NodeError> {
        let duration = wait_duration(config)?;
        let resume_at = ctx.now + duration;
        Ok(Outcome::Wait {
            resume_at,
            output: json!({
                "resume_at": resume_at,
                "wait_seconds": duration.num_seconds(),
            }),
        })
    }
}

/// Iteration state a `loop` node keeps between visits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopState {
    /// Elements captured on the first visit.
    pub items: Vec<JsonValue>,
    /// Position of the next element to emit.
    pub index: usize,
}

/// Iterates over an array, one element per visit.
///
/// The first visit evaluates `expression` (or takes `items` as is),
/// keeps at most [`MAX_LOOP_ITEMS`] elements, and stores them as node
/// state. Each visit emits the next element on `item`; the visit after the
/// last element clears the state and follows `done`. Body edges lead back
/// to the loop node.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoopNode;

#[async_trait]
impl NodeHandler for LoopNode {
    fn kind(&self) -> &'static str {
        "loop"
    }

    fn family(&self) -> NodeFamily {
        NodeFamily::Logic
    }

    fn validate(&self, config: &JsonValue) -> Result<(), NodeError> {
        if str_field(config, "expression").is_some() {
            validate_expression(config, "expression")
        } else if config.get("items").is_some() {
            Ok(())
        } else {
            Err(NodeError::config("`expression` or `items` is required"))
        }
    }

    async fn execute(
        &self,
        config: &JsonValue,
        ctx: &NodeContext<'_>,
    ) -> Result<Outcome, NodeError> {
        let state = match ctx.state() {
            Some(saved) => serde_json::from_value::<LoopState>(saved.clone())
                .map_err(|e| NodeError::config(format!("corrupt loop state: {e}")))?,
            None => {
                let source = if has_expression(ctx, "expression") {
                    expression(ctx, "expression")?.eval_value(ctx.context)
                } else {
                    config.get("items").cloned().unwrap_or(JsonValue::Null)
                };
                let mut items = match source {
                    JsonValue::Array(items) => items,
                    JsonValue::Null => Vec::new(),
                    other => vec![other],
                };
                if items.len() > MAX_LOOP_ITEMS {
                    warn!(total = items.len(), cap = MAX_LOOP_ITEMS, "loop input truncated");
                    items.truncate(MAX_LOOP_ITEMS);
                }
                LoopState { items, index: 0 }
            }
        };

        let total = state.items.len();
        let Some(item) = state.items.get(state.index).cloned() else {
            return Ok(Outcome::Continue(
                NodeOutput::branch(LOOP_DONE_HANDLE, json!({ "total": total }))
                    .with_state(StateChange::Clear),
            ));
        };
        let index = state.index;
        let next = LoopState {
            index: index + 1,
            ..state
        };
        let next_state = serde_json::to_value(&next)
            .map_err(|e| NodeError::config(format!("unserializable loop state: {e}")))?;
        Ok(Outcome::Continue(
            NodeOutput::branch(
                LOOP_ITEM_HANDLE,
                json!({
                    "item": item,
                    "index": index,
                    "total": total,
                    "is_last": index + 1 == total,
                }),
            )
            .with_state(StateChange::Set(next_state)),
        ))
    }
}

/// Ends the run with status `stopped`.
#[derive(Debug, Default, Clone, Copy)]
pub struct StopNode;

#[async_trait]
impl NodeHandler for StopNode {
    fn kind(&self) -> &'static str {
        "stop"
    }

    fn family(&self) -> NodeFamily {
        NodeFamily::Logic
    }

    async fn execute(
        &self,
        config: &JsonValue,
        _ctx: &NodeContext<'_>,
    ) -> Result<Outcome, NodeError> {
        Ok(Outcome::Stop {
            reason: required_str(config, "reason").ok().map(str::to_string),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::run_node;
    use chrono::Utc;
    use relayflow_workflow::{Node, RunContext};

    fn context(variables: JsonValue) -> RunContext {
        let mut context = RunContext::new(JsonValue::Null);
        if let JsonValue::Object(map) = variables {
            context.variables = map;
        }
        context
    }

    fn continued(outcome: Outcome) -> NodeOutput {
        match outcome {
            Outcome::Continue(step) => step,
            other => panic!("expected continue, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn if_else_selects_true_or_false() {
        let node = Node::new("check", "if-else")
            .with_config(json!({"condition": "sender_phone == '+1555'"}));
        let hit = run_node(&IfElseNode, &node, &context(json!({"sender_phone": "+1555"})))
            .await
            .unwrap();
        assert_eq!(continued(hit).handle.as_deref(), Some("true"));
        let miss = run_node(&IfElseNode, &node, &context(json!({"sender_phone": "+1999"})))
            .await
            .unwrap();
        assert_eq!(continued(miss).handle.as_deref(), Some("false"));
    }

    #[test]
    fn if_else_rejects_bad_condition() {
        assert!(IfElseNode.validate(&json!({"condition": "a == "})).is_err());
        assert!(IfElseNode.validate(&json!({})).is_err());
    }

    #[tokio::test]
    async fn if_else_treats_quoted_message_text_as_data() {
        let node = Node::new("check", "if-else")
            .with_config(json!({"condition": "message_text == 'refund'"}));
        let ctx = context(json!({"message_text": "x' == 'x' || 'a"}));
        let step = continued(run_node(&IfElseNode, &node, &ctx).await.unwrap());
        assert_eq!(step.handle.as_deref(), Some("false"));
    }

    #[test]
    fn if_else_rejects_placeholders_in_condition() {
        let spliced = json!({"condition": "'{{message_text}}' == 'refund'"});
        assert!(IfElseNode.validate(&spliced).is_err());
        assert!(IfElseNode.validate(&json!({"condition": "{{flag}}"})).is_err());
        assert!(IfElseNode.validate(&json!({"condition": "flag"})).is_ok());
    }

    #[tokio::test]
    async fn switch_first_match_wins() {
        let node = Node::new("route", "switch").with_config(json!({
            "expression": "choice",
            "cases": [{"value": "a"}, {"value": "b"}, {"id": "late", "value": "b"}]
        }));
        let step = continued(
            run_node(&SwitchNode, &node, &context(json!({"choice": "b"})))
                .await
                .unwrap(),
        );
        assert_eq!(step.handle.as_deref(), Some("case_1"));
        assert_eq!(step.output["matched"], "case_1");
    }

    #[tokio::test]
    async fn switch_matches_loosely_by_case_id() {
        let node = Node::new("route", "switch").with_config(json!({
            "value": "{{ count }}",
            "cases": [{"id": "one", "value": "1"}, {"id": "two", "value": 2}]
        }));
        let step = continued(
            run_node(&SwitchNode, &node, &context(json!({"count": 2})))
                .await
                .unwrap(),
        );
        assert_eq!(step.handle.as_deref(), Some("two"));
    }

    #[tokio::test]
    async fn switch_falls_back_or_dead_ends() {
        let with_default = Node::new("route", "switch")
            .with_config(json!({"value": "z", "cases": [{"id": "a", "value": "a"}]}));
        let step = continued(
            run_node(&SwitchNode, &with_default, &context(json!({})))
                .await
                .unwrap(),
        );
        assert_eq!(step.handle.as_deref(), Some(DEFAULT_CASE_HANDLE));

        let without = Node::new("route", "switch").with_config(
            json!({"value": "z", "fallback": false, "cases": [{"id": "a", "value": "a"}]}),
        );
        let step = continued(
            run_node(&SwitchNode, &without, &context(json!({})))
                .await
                .unwrap(),
        );
        assert_eq!(step.handle.as_deref(), Some(DEAD_END_HANDLE));
        assert_eq!(step.output["matched"], JsonValue::Null);
    }

    #[tokio::test]
    async fn wait_computes_resume_time() {
        let node = Node::new("pause", "wait").with_config(json!({"duration": 5, "unit": "minutes"}));
        let before = Utc::now();
        let outcome = run_node(&WaitNode, &node, &context(json!({}))).await.unwrap();
        let Outcome::Wait { resume_at, output } = outcome else {
            panic!("expected wait");
        };
        assert!(resume_at >= before + Duration::minutes(5));
        assert!(resume_at <= Utc::now() + Duration::minutes(5));
        assert_eq!(output["wait_seconds"], 300);
    }

    #[test]
    fn wait_validates_units() {
        assert!(WaitNode.validate(&json!({"duration": 1, "unit": "fortnights"})).is_err());
        assert!(WaitNode.validate(&json!({"duration": -1})).is_err());
        assert!(WaitNode.validate(&json!({"duration": "2", "unit": "days"})).is_ok());
        assert!(WaitNode.validate(&json!({"duration": "{{ delay }}"})).is_ok());
    }

    #[tokio::test]
    async fn loop_walks_items_then_finishes() {
        let node = Node::new("each", "loop").with_config(json!({"expression": "items"}));
        let mut ctx = context(json!({"items": ["a", "b"]}));

        let first = continued(run_node(&LoopNode, &node, &ctx).await.unwrap());
        assert_eq!(first.handle.as_deref(), Some(LOOP_ITEM_HANDLE));
        assert_eq!(first.output["item"], "a");
        assert_eq!(first.output["is_last"], false);
        ctx = ctx.apply(&node, &first);

        let second = continued(run_node(&LoopNode, &node, &ctx).await.unwrap());
        assert_eq!(second.output["item"], "b");
        assert_eq!(second.output["index"], 1);
        assert_eq!(second.output["is_last"], true);
        ctx = ctx.apply(&node, &second);

        let done = continued(run_node(&LoopNode, &node, &ctx).await.unwrap());
        assert_eq!(done.handle.as_deref(), Some(LOOP_DONE_HANDLE));
        assert_eq!(done.state, StateChange::Clear);
        ctx = ctx.apply(&node, &done);
        assert!(ctx.node_state(&node.id).is_none());
    }

    #[tokio::test]
    async fn loop_caps_items() {
        let items: Vec<u32> = (0..150).collect();
        let node = Node::new("each", "loop").with_config(json!({"items": items}));
        let step = continued(run_node(&LoopNode, &node, &context(json!({}))).await.unwrap());
        assert_eq!(step.output["total"], MAX_LOOP_ITEMS);
    }

    #[tokio::test]
    async fn loop_over_nothing_is_done() {
        let node = Node::new("each", "loop").with_config(json!({"expression": "missing"}));
        let step = continued(run_node(&LoopNode, &node, &context(json!({}))).await.unwrap());
        assert_eq!(step.handle.as_deref(), Some(LOOP_DONE_HANDLE));
    }

    #[tokio::test]
    async fn stop_carries_reason() {
        let node = Node::new("end", "stop").with_config(json!({"reason": "vip"}));
        let outcome = run_node(&StopNode, &node, &context(json!({}))).await.unwrap();
        assert_eq!(
            outcome,
            Outcome::Stop {
                reason: Some("vip".to_string())
            }
        );
    }
}
