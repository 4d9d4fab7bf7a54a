//! Outbound delivery instructions.
//!
//! The engine never talks to messaging providers itself. Nodes that send
//! something build an [`OutboundInstruction`] and hand it to an
//! [`OutboundPublisher`], which enqueues it on the channel's delivery log
//! for an external worker to pick up.

use crate::config::{required_str, str_field};
use crate::error::OutboundError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use relayflow_core::{TenantId, WorkflowRunId};
use relayflow_workflow::{NodeContext, NodeError, NodeFamily, NodeHandler, Outcome};
use rootcause::prelude::Report;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::info;

/// A request to deliver a message through a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundInstruction {
    /// Tenant the message is sent on behalf of.
    pub tenant_id: TenantId,
    /// Run that produced the instruction.
    pub run_id: WorkflowRunId,
    /// Delivery channel, such as `whatsapp` or `sms`.
    pub channel: String,
    /// Conversation the reply belongs to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    /// Recipient address on the channel.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    /// Message body.
    pub text: String,
    /// When the instruction was built.
    pub created_at: DateTime<Utc>,
}

impl OutboundInstruction {
    /// Subject the instruction is published on.
    #[must_use]
    pub fn subject(&self, prefix: &str) -> String {
        format!("{prefix}.{}", self.channel)
    }
}

/// Enqueues outbound instructions onto a delivery log.
#[async_trait]
pub trait OutboundPublisher: Send + Sync {
    /// Publishes one instruction.
    async fn publish(&self, instruction: &OutboundInstruction) -> Result<(), Report<OutboundError>>;
}

/// Publisher that keeps instructions in memory.
#[derive(Debug, Default)]
pub struct InMemoryOutbox {
    sent: Mutex<Vec<OutboundInstruction>>,
}

impl InMemoryOutbox {
    /// Creates an empty outbox.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Instructions published so far.
    #[must_use]
    pub fn sent(&self) -> Vec<OutboundInstruction> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl OutboundPublisher for InMemoryOutbox {
    async fn publish(&self, instruction: &OutboundInstruction) -> Result<(), Report<OutboundError>> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(instruction.clone());
        Ok(())
    }
}

/// Queues a message for delivery.
///
/// Config: `text` (required), plus `channel`, `conversation_id` and `to`.
/// Missing addressing falls back to the variables a channel-message
/// trigger sets, so a reply needs nothing but `text`.
pub struct SendMessageNode {
    publisher: Arc<dyn OutboundPublisher>,
}

impl SendMessageNode {
    /// Creates the node over a publisher.
    #[must_use]
    pub fn new(publisher: Arc<dyn OutboundPublisher>) -> Self {
        Self { publisher }
    }
}

/// First of `key` in config, then each variable in `fallbacks`.
fn address(
    config: &JsonValue,
    ctx: &NodeContext<'_>,
    key: &str,
    fallbacks: &[&str],
) -> Option<String> {
    if let Some(value) = str_field(config, key) {
        return Some(value.to_string());
    }
    fallbacks.iter().find_map(|name| match ctx.context.lookup(name)? {
        JsonValue::String(s) if !s.trim().is_empty() => Some(s),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

#[async_trait]
impl NodeHandler for SendMessageNode {
    fn kind(&self) -> &'static str {
        "send-message"
    }

    fn family(&self) -> NodeFamily {
        NodeFamily::Utility
    }

    fn validate(&self, config: &JsonValue) -> Result<(), NodeError> {
        required_str(config, "text").map(|_| ())
    }

    async fn execute(
        &self,
        config: &JsonValue,
        ctx: &NodeContext<'_>,
    ) -> Result<Outcome, NodeError> {
        let text = required_str(config, "text")?;
        let channel = address(config, ctx, "channel", &["channel", "message_channel"])
            .ok_or_else(|| NodeError::config("no `channel` configured or in context"))?;
        let instruction = OutboundInstruction {
            tenant_id: ctx.tenant_id.clone(),
            run_id: ctx.run_id,
            channel,
            conversation_id: address(
                config,
                ctx,
                "conversation_id",
                &["conversation_id", "message_conversation_id"],
            ),
            to: address(config, ctx, "to", &["sender_phone", "sender_email"]),
            text: text.to_string(),
            created_at: ctx.now,
        };

        self.publisher
            .publish(&instruction)
            .await
            .map_err(|e| NodeError::Publish {
                reason: e.to_string(),
            })?;
        info!(channel = %instruction.channel, "outbound message queued");

        let output = serde_json::to_value(&instruction).map_err(|e| NodeError::Publish {
            reason: e.to_string(),
        })?;
        Ok(Outcome::next(output))
    }
}
