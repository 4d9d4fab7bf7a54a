//! Built-in node kinds for relayflow workflows.
//!
//! Every kind implements [`relayflow_workflow::NodeHandler`]. Kinds fall
//! into four families:
//!
//! - **Trigger**: one per trigger type; normalizes the run's payload
//! - **Logic**: `if-else`, `switch`, `wait`, `loop`, `stop`
//! - **AI**: `intent-detection`, `sentiment-detection`,
//!   `entity-extraction`, `general-agent`
//! - **Utility**: `set-variable`, `json-parse`, `http-request`, `assert`,
//!   `error-handler`, `send-message`
//!
//! [`builtin_registry`] assembles all of them once at startup.

mod config;

pub mod ai;
pub mod error;
pub mod http;
pub mod logic;
pub mod outbound;
pub mod trigger;
pub mod utility;

pub use ai::{EntityExtractionNode, GeneralAgentNode, IntentDetectionNode, SentimentDetectionNode};
pub use error::OutboundError;
pub use http::HttpRequestNode;
pub use logic::{IfElseNode, LoopNode, LoopState, StopNode, SwitchNode, WaitNode};
pub use outbound::{InMemoryOutbox, OutboundInstruction, OutboundPublisher, SendMessageNode};
pub use trigger::{TRIGGER_KINDS, TriggerNode, flatten_payload};
pub use utility::{AssertNode, ErrorHandlerNode, JsonParseNode, SetVariableNode};

use relayflow_ai::LlmBackend;
use relayflow_workflow::NodeRegistry;
use std::sync::Arc;

/// External collaborators node kinds call out to.
#[derive(Clone)]
pub struct NodeServices {
    /// Completion provider for AI kinds.
    pub llm: Arc<dyn LlmBackend>,
    /// Client for `http-request`.
    pub http: reqwest::Client,
    /// Delivery log for `send-message`.
    pub outbound: Arc<dyn OutboundPublisher>,
}

/// Builds the registry of every built-in kind.
#[must_use]
pub fn builtin_registry(services: &NodeServices) -> NodeRegistry {
    let mut builder = NodeRegistry::builder();
    for trigger in TriggerNode::all() {
        builder = builder.register(trigger);
    }
    builder
        .register(IfElseNode)
        .register(SwitchNode)
        .register(WaitNode)
        .register(LoopNode)
        .register(StopNode)
        .register(IntentDetectionNode::new(Arc::clone(&services.llm)))
        .register(SentimentDetectionNode::new(Arc::clone(&services.llm)))
        .register(EntityExtractionNode::new(Arc::clone(&services.llm)))
        .register(GeneralAgentNode::new(Arc::clone(&services.llm)))
        .register(SetVariableNode)
        .register(JsonParseNode)
        .register(HttpRequestNode::new(services.http.clone()))
        .register(AssertNode)
        .register(ErrorHandlerNode)
        .register(SendMessageNode::new(Arc::clone(&services.outbound)))
        .build()
}

#[cfg(test)]
pub(crate) mod test_support {
    use chrono::Utc;
    use relayflow_core::{TenantId, WorkflowRunId};
    use relayflow_workflow::{
        Node, NodeContext, NodeError, NodeHandler, Outcome, RunContext, resolve_config,
    };

    /// Runs one attempt of `handler` the way the executor does.
    pub async fn run_node(
        handler: &dyn NodeHandler,
        node: &Node,
        context: &RunContext,
    ) -> Result<Outcome, NodeError> {
        let tenant = TenantId::new("t1");
        let config = resolve_config(&node.config, context);
        let ctx = NodeContext {
            run_id: WorkflowRunId::new(),
            tenant_id: &tenant,
            node,
            context,
            now: Utc::now(),
        };
        handler.execute(&config, &ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use relayflow_ai::ScriptedBackend;
    use relayflow_core::{TenantId, WorkflowRunId};
    use relayflow_workflow::{
        DefinitionStore, Edge, Node, NodeFamily, PublishedWorkflow, RunExecutor, RunOutcome,
        RunStatus, RunStore, TriggerType, WorkflowDefinition, WorkflowGraph, WorkflowRun,
        WorkflowVersion,
        memory::{InMemoryDefinitionStore, InMemoryRunStore},
    };
    use serde_json::{Value as JsonValue, json};

    struct Harness {
        runs: Arc<InMemoryRunStore>,
        definitions: Arc<InMemoryDefinitionStore>,
        executor: RunExecutor,
        outbox: Arc<InMemoryOutbox>,
    }

    fn harness() -> Harness {
        let outbox = Arc::new(InMemoryOutbox::new());
        let services = NodeServices {
            llm: Arc::new(ScriptedBackend::new()),
            http: reqwest::Client::new(),
            outbound: outbox.clone(),
        };
        let runs = Arc::new(InMemoryRunStore::new());
        let definitions = Arc::new(InMemoryDefinitionStore::new());
        let executor = RunExecutor::new(
            Arc::new(builtin_registry(&services)),
            runs.clone() as Arc<dyn RunStore>,
            definitions.clone() as Arc<dyn DefinitionStore>,
        );
        Harness {
            runs,
            definitions,
            executor,
            outbox,
        }
    }

    impl Harness {
        fn publish(&self, graph: WorkflowGraph) -> PublishedWorkflow {
            let definition = WorkflowDefinition::new(TenantId::new("t1"), "flow");
            let version = WorkflowVersion::published(
                definition.id,
                vec![TriggerType::from(TriggerType::CHANNEL_MESSAGE)],
                graph,
            );
            let workflow = PublishedWorkflow {
                definition,
                version,
            };
            self.definitions.insert(workflow.clone());
            workflow
        }

        async fn start(&self, workflow: &PublishedWorkflow, payload: JsonValue) -> RunOutcome {
            let run = WorkflowRun::new(
                workflow.definition.id,
                workflow.version.id,
                workflow.definition.tenant_id.clone(),
                "whatsapp-message",
                WorkflowRunId::new().to_string(),
                payload,
            );
            self.runs.create_run(&run).await.unwrap();
            let claimed = self.runs.try_claim(run.id, Utc::now()).await.unwrap().unwrap();
            self.executor.execute(claimed).await.unwrap()
        }
    }

    fn screening_graph() -> WorkflowGraph {
        WorkflowGraph::new()
            .with_node(Node::new("start", "channel-message"))
            .with_node(
                Node::new("vip", "if-else")
                    .with_config(json!({"condition": "sender_phone == '+1555'"})),
            )
            .with_node(Node::new("halt", "stop"))
            .with_node(
                Node::new("mark", "set-variable")
                    .with_name("Mark")
                    .with_config(json!({"name": "foo", "value": 1})),
            )
            .with_edge(Edge::new("start", "vip"))
            .with_edge(Edge::new("vip", "halt").on("true"))
            .with_edge(Edge::new("vip", "mark").on("false"))
    }

    #[test]
    fn registry_covers_every_family() {
        let services = NodeServices {
            llm: Arc::new(ScriptedBackend::new()),
            http: reqwest::Client::new(),
            outbound: Arc::new(InMemoryOutbox::new()),
        };
        let registry = builtin_registry(&services);
        assert_eq!(registry.kinds_in(NodeFamily::Trigger).len(), TRIGGER_KINDS.len());
        assert_eq!(registry.kinds_in(NodeFamily::Logic).len(), 5);
        assert_eq!(registry.kinds_in(NodeFamily::Ai).len(), 4);
        assert_eq!(registry.kinds_in(NodeFamily::Utility).len(), 6);
        assert_eq!(registry.family("switch"), Some(NodeFamily::Logic));
    }

    #[tokio::test]
    async fn matching_sender_stops_run() {
        let h = harness();
        let workflow = h.publish(screening_graph());
        let outcome = h
            .start(&workflow, json!({"sender": {"phone": "+1555"}}))
            .await;
        assert_eq!(outcome.status(), RunStatus::Stopped);
    }

    #[tokio::test]
    async fn other_sender_sets_variable_and_completes() {
        let h = harness();
        let workflow = h.publish(screening_graph());
        let outcome = h
            .start(&workflow, json!({"sender": {"phone": "+1999"}}))
            .await;
        assert_eq!(outcome, RunOutcome::Completed);

        let run = h.runs.runs().into_iter().next().unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.context.variables["foo"], 1);
        assert_eq!(run.context.lookup("mark.foo"), Some(json!(1)));
    }

    #[tokio::test]
    async fn wait_suspends_with_one_resumption() {
        let h = harness();
        let graph = WorkflowGraph::new()
            .with_node(Node::new("start", "channel-message"))
            .with_node(
                Node::new("pause", "wait").with_config(json!({"duration": 5, "unit": "minutes"})),
            )
            .with_edge(Edge::new("start", "pause"));
        let workflow = h.publish(graph);
        let outcome = h.start(&workflow, json!({})).await;

        let RunOutcome::Waiting { resume_at } = outcome else {
            panic!("expected waiting");
        };
        assert!(resume_at > Utc::now());
        let run = h.runs.runs().into_iter().next().unwrap();
        assert_eq!(run.status, RunStatus::Waiting);
        assert_eq!(h.runs.resumptions().len(), 1);
    }

    #[tokio::test]
    async fn error_handler_recovers_failed_node() {
        let h = harness();
        let graph = WorkflowGraph::new()
            .with_node(Node::new("start", "channel-message"))
            .with_node(
                Node::new("parse", "json-parse").with_config(json!({"input": "{{ body }}"})),
            )
            .with_node(Node::new("recover", "error-handler"))
            .with_node(
                Node::new("reply", "send-message")
                    .with_config(json!({"text": "sorry", "channel": "sms"})),
            )
            .with_edge(Edge::new("start", "parse"))
            .with_edge(Edge::new("parse", "recover").on("error"))
            .with_edge(Edge::new("recover", "reply"));
        let workflow = h.publish(graph);
        let outcome = h.start(&workflow, json!({"body": "not json"})).await;

        assert_eq!(outcome, RunOutcome::Completed);
        let run = h.runs.runs().into_iter().next().unwrap();
        assert!(run.context.last_error.is_none());
        assert_eq!(h.outbox.sent().len(), 1);
    }

    #[tokio::test]
    async fn loop_visits_each_item() {
        let h = harness();
        let graph = WorkflowGraph::new()
            .with_node(Node::new("start", "manual"))
            .with_node(Node::new("each", "loop").with_config(json!({"expression": "items"})))
            .with_node(Node::new("count", "set-variable").with_config(
                json!({"name": "last_seen", "value": "{{ each.item }}"}),
            ))
            .with_node(Node::new("end", "stop").with_config(json!({"reason": "done"})))
            .with_edge(Edge::new("start", "each"))
            .with_edge(Edge::new("each", "count").on("item"))
            .with_edge(Edge::new("count", "each"))
            .with_edge(Edge::new("each", "end").on("done"));
        let workflow = h.publish(graph);
        let outcome = h.start(&workflow, json!({"items": ["a", "b", "c"]})).await;

        assert_eq!(
            outcome,
            RunOutcome::Stopped {
                reason: Some("done".to_string())
            }
        );
        let run = h.runs.runs().into_iter().next().unwrap();
        assert_eq!(run.context.variables["last_seen"], "c");
        let records = h.runs.list_node_records(run.id).await.unwrap();
        // start, 3 x (each, count), each(done), end
        assert_eq!(records.len(), 9);
    }
}
