//! Message enrichment from the CRM's tables.
//!
//! `messages`, `conversations` and `contacts` are owned by the surrounding
//! CRM; the engine only reads them.

use async_trait::async_trait;
use relayflow_core::TenantId;
use relayflow_ingest::{IngestError, MessageDetails, MessageLookup, SenderDetails};
use rootcause::prelude::Report;
use sqlx::{FromRow, PgPool};

#[derive(FromRow)]
struct MessageRow {
    message_id: String,
    body: Option<String>,
    channel: String,
    conversation_id: String,
    sender_phone: Option<String>,
    contact_id: Option<String>,
    contact_name: Option<String>,
    contact_phone: Option<String>,
    contact_email: Option<String>,
}

impl MessageRow {
    fn into_details(self) -> MessageDetails {
        MessageDetails {
            message_id: self.message_id,
            text: self.body.unwrap_or_default(),
            channel: self.channel,
            conversation_id: self.conversation_id,
            sender: SenderDetails {
                phone: self.contact_phone.or(self.sender_phone),
                name: self.contact_name,
                email: self.contact_email,
                contact_id: self.contact_id,
            },
        }
    }
}

/// [`MessageLookup`] joining a message with its conversation and contact.
#[derive(Clone)]
pub struct PgMessageLookup {
    pool: PgPool,
}

impl PgMessageLookup {
    /// Creates a new lookup.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MessageLookup for PgMessageLookup {
    async fn message_details(
        &self,
        tenant_id: &TenantId,
        message_id: &str,
    ) -> Result<Option<MessageDetails>, Report<IngestError>> {
        let row: Option<MessageRow> = sqlx::query_as(
            r#"
            SELECT m.id AS message_id, m.body, c.channel, c.id AS conversation_id,
                   m.sender_phone, ct.id AS contact_id, ct.name AS contact_name,
                   ct.phone AS contact_phone, ct.email AS contact_email
            FROM messages m
            JOIN conversations c ON c.id = m.conversation_id AND c.tenant_id = m.tenant_id
            LEFT JOIN contacts ct ON ct.id = c.contact_id AND ct.tenant_id = c.tenant_id
            WHERE m.tenant_id = $1 AND m.id = $2
            "#,
        )
        .bind(tenant_id.as_str())
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| IngestError::Enrichment {
            message_id: message_id.to_string(),
            details: e.to_string(),
        })?;

        Ok(row.map(MessageRow::into_details))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contact_phone_wins_over_sender_phone() {
        let row = MessageRow {
            message_id: "m1".to_string(),
            body: Some("hi".to_string()),
            channel: "whatsapp".to_string(),
            conversation_id: "c1".to_string(),
            sender_phone: Some("+1000".to_string()),
            contact_id: Some("ct1".to_string()),
            contact_name: Some("Ana".to_string()),
            contact_phone: Some("+1555".to_string()),
            contact_email: None,
        };
        let details = row.into_details();
        assert_eq!(details.sender.phone.as_deref(), Some("+1555"));
        assert_eq!(details.text, "hi");
    }

    #[test]
    fn unknown_sender_keeps_message_phone() {
        let row = MessageRow {
            message_id: "m2".to_string(),
            body: None,
            channel: "sms".to_string(),
            conversation_id: "c2".to_string(),
            sender_phone: Some("+1999".to_string()),
            contact_id: None,
            contact_name: None,
            contact_phone: None,
            contact_email: None,
        };
        let details = row.into_details();
        assert_eq!(details.sender.phone.as_deref(), Some("+1999"));
        assert!(details.sender.contact_id.is_none());
        assert_eq!(details.text, "");
    }
}
