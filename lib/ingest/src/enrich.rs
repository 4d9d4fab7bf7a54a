//! Channel-message enrichment.
//!
//! A channel-message event only references a stored message. Before a run
//! starts, the message, its conversation and the sender's contact record
//! are joined into the trigger payload:
//!
//! ```json
//! {
//!   "sender":  { "phone", "name", "email", "contact_id" },
//!   "message": { "id", "text", "channel", "conversation_id" }
//! }
//! ```

use crate::error::IngestError;
use crate::event::ChannelMessageEvent;
use async_trait::async_trait;
use relayflow_core::TenantId;
use rootcause::prelude::Report;
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

/// Contact details of a message's sender.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderDetails {
    /// Phone number, if known.
    pub phone: Option<String>,
    /// Display name, if known.
    pub name: Option<String>,
    /// Email address, if known.
    pub email: Option<String>,
    /// CRM contact, if the sender is a known contact.
    pub contact_id: Option<String>,
}

/// A stored message joined with its conversation and contact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageDetails {
    /// Message identifier.
    pub message_id: String,
    /// Message body.
    pub text: String,
    /// Channel the message arrived on.
    pub channel: String,
    /// Conversation the message belongs to.
    pub conversation_id: String,
    /// Who sent it.
    pub sender: SenderDetails,
}

impl MessageDetails {
    /// Builds the run's trigger payload.
    #[must_use]
    pub fn to_payload(&self) -> JsonValue {
        json!({
            "sender": {
                "phone": self.sender.phone,
                "name": self.sender.name,
                "email": self.sender.email,
                "contact_id": self.sender.contact_id,
            },
            "message": {
                "id": self.message_id,
                "text": self.text,
                "channel": self.channel,
                "conversation_id": self.conversation_id,
            },
        })
    }
}

/// Payload for a message that could not be found.
///
/// Carries only what the event itself knows.
#[must_use]
pub fn bare_payload(event: &ChannelMessageEvent) -> JsonValue {
    json!({
        "sender": {},
        "message": {
            "id": event.message_id,
            "channel": event.channel,
            "conversation_id": event.conversation_id,
        },
    })
}

/// Reads message, conversation and contact records.
#[async_trait]
pub trait MessageLookup: Send + Sync {
    /// Loads a tenant's message with its sender, or `None` if it does not
    /// exist.
    async fn message_details(
        &self,
        tenant_id: &TenantId,
        message_id: &str,
    ) -> Result<Option<MessageDetails>, Report<IngestError>>;
}

/// Message lookup over an in-memory table.
#[derive(Debug, Default)]
pub struct InMemoryMessageLookup {
    messages: Mutex<HashMap<(TenantId, String), MessageDetails>>,
}

impl InMemoryMessageLookup {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a message for a tenant.
    pub fn insert(&self, tenant_id: TenantId, details: MessageDetails) {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((tenant_id, details.message_id.clone()), details);
    }
}

#[async_trait]
impl MessageLookup for InMemoryMessageLookup {
    async fn message_details(
        &self,
        tenant_id: &TenantId,
        message_id: &str,
    ) -> Result<Option<MessageDetails>, Report<IngestError>> {
        Ok(self
            .messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(tenant_id.clone(), message_id.to_string()))
            .cloned())
    }
}
