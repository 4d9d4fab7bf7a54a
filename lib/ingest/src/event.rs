//! Trigger event shapes carried by the event log.
//!
//! Two shapes share one log:
//! - channel messages, which reference a stored message and need
//!   enrichment before a run can start
//! - direct events, which carry their trigger type and payload inline

use crate::error::IngestError;
use chrono::{DateTime, Utc};
use relayflow_core::{TenantId, WorkflowVersionId};
use relayflow_workflow::TriggerType;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// An inbound message on a customer channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelMessageEvent {
    /// Stored message the event refers to.
    pub message_id: String,
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Conversation the message belongs to.
    pub conversation_id: String,
    /// Channel the message arrived on, such as `whatsapp`.
    pub channel: String,
}

/// A named trigger with an inline payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectEvent {
    /// Trigger type, used verbatim.
    pub event_type: String,
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Event payload.
    #[serde(default)]
    pub payload: JsonValue,
    /// When the event happened.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    /// Producer-assigned identity used to deduplicate runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    /// Restricts matching to one workflow version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_id: Option<WorkflowVersionId>,
}

impl DirectEvent {
    /// Creates an event stamped with the current time.
    #[must_use]
    pub fn new(event_type: impl Into<String>, tenant_id: TenantId, payload: JsonValue) -> Self {
        Self {
            event_type: event_type.into(),
            tenant_id,
            payload,
            timestamp: Some(Utc::now()),
            event_id: None,
            version_id: None,
        }
    }

    /// Sets the deduplication identity.
    #[must_use]
    pub fn with_event_id(mut self, event_id: impl Into<String>) -> Self {
        self.event_id = Some(event_id.into());
        self
    }

    /// Targets a single workflow version.
    #[must_use]
    pub fn for_version(mut self, version_id: WorkflowVersionId) -> Self {
        self.version_id = Some(version_id);
        self
    }
}

/// One entry of the trigger log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TriggerEvent {
    /// `{message_id, tenant_id, conversation_id, channel}`
    ChannelMessage(ChannelMessageEvent),
    /// `{event_type, tenant_id, payload, timestamp}`
    Direct(DirectEvent),
}

impl TriggerEvent {
    /// Decodes a log entry payload.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError::Malformed`] when the bytes are not JSON, match
    /// neither shape, or name an empty tenant or trigger type.
    pub fn decode(bytes: &[u8]) -> Result<Self, IngestError> {
        let event: Self = serde_json::from_slice(bytes).map_err(|e| IngestError::Malformed {
            reason: e.to_string(),
        })?;
        if event.tenant_id().as_str().trim().is_empty() {
            return Err(IngestError::Malformed {
                reason: "tenant_id is empty".to_string(),
            });
        }
        if let Self::Direct(direct) = &event {
            if direct.event_type.trim().is_empty() {
                return Err(IngestError::Malformed {
                    reason: "event_type is empty".to_string(),
                });
            }
        }
        Ok(event)
    }

    /// Encodes the event for appending to the log.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be serialized.
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Owning tenant.
    #[must_use]
    pub fn tenant_id(&self) -> &TenantId {
        match self {
            Self::ChannelMessage(event) => &event.tenant_id,
            Self::Direct(event) => &event.tenant_id,
        }
    }

    /// Trigger type workflows are matched against.
    #[must_use]
    pub fn trigger_type(&self) -> TriggerType {
        match self {
            Self::ChannelMessage(event) => channel_trigger_type(&event.channel),
            Self::Direct(event) => TriggerType::new(event.event_type.trim()),
        }
    }

    /// The only version this event may start, if it is targeted.
    #[must_use]
    pub fn target_version(&self) -> Option<WorkflowVersionId> {
        match self {
            Self::ChannelMessage(_) => None,
            Self::Direct(event) => event.version_id,
        }
    }

    /// Channel the event arrived on, if it names one.
    #[must_use]
    pub fn channel(&self) -> Option<&str> {
        match self {
            Self::ChannelMessage(event) => Some(event.channel.as_str()),
            Self::Direct(event) => event
                .payload
                .get("channel")
                .or_else(|| event.payload.pointer("/message/channel"))
                .and_then(JsonValue::as_str),
        }
    }

    /// Identity that makes run creation idempotent on redelivery.
    ///
    /// Channel messages use their message id and direct events their
    /// `event_id`; anything else falls back to the log sequence.
    #[must_use]
    pub fn source_event_id(&self, sequence: u64) -> String {
        match self {
            Self::ChannelMessage(event) => format!("message:{}", event.message_id),
            Self::Direct(DirectEvent {
                event_id: Some(id), ..
            }) if !id.trim().is_empty() => id.clone(),
            Self::Direct(_) => format!("seq:{sequence}"),
        }
    }
}

/// Maps a channel name to its message trigger type.
///
/// Known channels and their aliases map to `<channel>-message`; anything
/// else maps to the generic `channel-message`.
#[must_use]
pub fn channel_trigger_type(channel: &str) -> TriggerType {
    let normalized = channel.trim().to_ascii_lowercase();
    let name = match normalized.as_str() {
        "whatsapp" | "wa" => "whatsapp",
        "sms" | "text" => "sms",
        "email" | "mail" => "email",
        "instagram" | "ig" => "instagram",
        "facebook" | "messenger" => "facebook",
        "telegram" => "telegram",
        "webchat" | "web" | "widget" => "webchat",
        _ => return TriggerType::from(TriggerType::CHANNEL_MESSAGE),
    };
    TriggerType::new(format!("{name}-message"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_channel_message() {
        let bytes = br#"{"message_id":"m1","tenant_id":"t1","conversation_id":"c1","channel":"WhatsApp"}"#;
        let event = TriggerEvent::decode(bytes).unwrap();
        assert!(matches!(event, TriggerEvent::ChannelMessage(_)));
        assert_eq!(event.trigger_type().as_str(), "whatsapp-message");
        assert_eq!(event.channel(), Some("WhatsApp"));
        assert_eq!(event.source_event_id(7), "message:m1");
    }

    #[test]
    fn decodes_direct_event() {
        let bytes = br#"{"event_type":"lead-added","tenant_id":"t1","payload":{"pipeline_id":"p1"},"timestamp":"2026-01-01T00:00:00Z"}"#;
        let event = TriggerEvent::decode(bytes).unwrap();
        let TriggerEvent::Direct(direct) = &event else {
            panic!("expected direct event");
        };
        assert_eq!(direct.payload["pipeline_id"], "p1");
        assert_eq!(event.trigger_type().as_str(), "lead-added");
        assert_eq!(event.source_event_id(7), "seq:7");
    }

    #[test]
    fn direct_event_id_wins_over_sequence() {
        let event = TriggerEvent::Direct(
            DirectEvent::new("manual", TenantId::new("t1"), json!({})).with_event_id("evt-1"),
        );
        assert_eq!(event.source_event_id(3), "evt-1");
    }

    #[test]
    fn rejects_malformed_entries() {
        assert!(matches!(
            TriggerEvent::decode(b"not json"),
            Err(IngestError::Malformed { .. })
        ));
        assert!(TriggerEvent::decode(br#"{"tenant_id":"t1"}"#).is_err());
        assert!(TriggerEvent::decode(br#"{"event_type":" ","tenant_id":"t1"}"#).is_err());
        assert!(TriggerEvent::decode(br#"{"event_type":"manual","tenant_id":""}"#).is_err());
    }

    #[test]
    fn unknown_channels_map_to_generic_type() {
        assert_eq!(channel_trigger_type("sms").as_str(), "sms-message");
        assert_eq!(channel_trigger_type(" messenger ").as_str(), "facebook-message");
        assert_eq!(channel_trigger_type("pigeon").as_str(), "channel-message");
    }

    #[test]
    fn encode_round_trips_shape() {
        let event = TriggerEvent::Direct(DirectEvent::new("manual", TenantId::new("t1"), json!({"a": 1})));
        let decoded = TriggerEvent::decode(&event.encode().unwrap()).unwrap();
        assert_eq!(decoded, event);
    }
}
