//! NATS JetStream implementations of the trigger and delivery logs.
//!
//! - Trigger log: stream `TRIGGER_EVENTS` on `triggers.>`, read through a
//!   durable pull consumer shared by every ingestor process (the consumer
//!   group). Each process connects under its own client name.
//! - Delivery log: stream `OUTBOUND` on `outbound.>`, one subject per
//!   channel, consumed by external delivery workers.

use crate::error::EventLogError;
use crate::event::TriggerEvent;
use crate::log::{EventLog, LogEntry, TriggerPublisher};
use async_nats::jetstream::{self, AckKind, consumer::pull};
use async_trait::async_trait;
use futures::StreamExt;
use relayflow_nodes::{OutboundError, OutboundInstruction, OutboundPublisher};
use rootcause::prelude::Report;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default stream name for trigger events.
pub const TRIGGER_STREAM_NAME: &str = "TRIGGER_EVENTS";

/// Default subject prefix for trigger events.
pub const TRIGGER_SUBJECT_PREFIX: &str = "triggers";

/// Default stream name for outbound instructions.
pub const OUTBOUND_STREAM_NAME: &str = "OUTBOUND";

/// Default subject prefix for outbound instructions.
pub const OUTBOUND_SUBJECT_PREFIX: &str = "outbound";

/// Connection and naming for the JetStream logs.
#[derive(Debug, Clone)]
pub struct NatsLogConfig {
    /// NATS server URL.
    pub url: String,
    /// Stream holding trigger events.
    pub trigger_stream: String,
    /// Subject prefix trigger events are published under.
    pub trigger_subject: String,
    /// Durable consumer shared by all ingestors.
    pub consumer_group: String,
    /// This process's identity within the group.
    pub consumer_name: String,
    /// How long a delivered entry may stay unacknowledged before redelivery.
    pub ack_wait: Duration,
    /// Stream holding outbound instructions.
    pub outbound_stream: String,
    /// Subject prefix outbound instructions are published under.
    pub outbound_subject: String,
}

impl NatsLogConfig {
    /// Creates a config with default stream and subject names.
    #[must_use]
    pub fn new(url: impl Into<String>, consumer_name: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            trigger_stream: TRIGGER_STREAM_NAME.to_string(),
            trigger_subject: TRIGGER_SUBJECT_PREFIX.to_string(),
            consumer_group: "relayflow-ingest".to_string(),
            consumer_name: consumer_name.into(),
            ack_wait: Duration::from_secs(30),
            outbound_stream: OUTBOUND_STREAM_NAME.to_string(),
            outbound_subject: OUTBOUND_SUBJECT_PREFIX.to_string(),
        }
    }

    fn trigger_subject_for(&self, event: &TriggerEvent) -> String {
        format!("{}.{}", self.trigger_subject, event.tenant_id())
    }
}

fn connection_error(context: &str, e: impl std::fmt::Display) -> EventLogError {
    EventLogError::Connection {
        details: format!("{context}: {e}"),
    }
}

/// Connects to NATS under this process's identity.
///
/// # Errors
///
/// Returns an error if the server cannot be reached.
pub async fn connect(config: &NatsLogConfig) -> Result<jetstream::Context, Report<EventLogError>> {
    let client = async_nats::ConnectOptions::new()
        .name(config.consumer_name.clone())
        .connect(config.url.as_str())
        .await
        .map_err(|e| connection_error("failed to connect", e))?;
    info!(url = %config.url, name = %config.consumer_name, "connected to NATS");
    Ok(jetstream::new(client))
}

async fn ensure_stream(
    jetstream: &jetstream::Context,
    name: &str,
    subject_prefix: &str,
) -> Result<jetstream::stream::Stream, Report<EventLogError>> {
    let config = jetstream::stream::Config {
        name: name.to_string(),
        subjects: vec![format!("{subject_prefix}.>")],
        storage: jetstream::stream::StorageType::File,
        retention: jetstream::stream::RetentionPolicy::Limits,
        ..Default::default()
    };
    let stream = jetstream
        .get_or_create_stream(config)
        .await
        .map_err(|e| connection_error(&format!("failed to create stream {name}"), e))?;
    Ok(stream)
}

/// The trigger log read through the shared durable consumer.
///
/// Delivered messages are held until acknowledged so [`EventLog::ack`] can
/// answer the exact delivery.
pub struct NatsEventLog {
    consumer: jetstream::consumer::Consumer<pull::Config>,
    in_flight: Mutex<HashMap<u64, jetstream::Message>>,
}

impl NatsEventLog {
    /// Ensures the trigger stream and the group's consumer exist.
    ///
    /// # Errors
    ///
    /// Returns an error if stream or consumer setup fails.
    pub async fn new(
        jetstream: &jetstream::Context,
        config: &NatsLogConfig,
    ) -> Result<Self, Report<EventLogError>> {
        let stream =
            ensure_stream(jetstream, &config.trigger_stream, &config.trigger_subject).await?;
        let consumer_config = pull::Config {
            durable_name: Some(config.consumer_group.clone()),
            filter_subject: format!("{}.>", config.trigger_subject),
            ack_policy: jetstream::consumer::AckPolicy::Explicit,
            ack_wait: config.ack_wait,
            ..Default::default()
        };
        let consumer = stream
            .get_or_create_consumer(&config.consumer_group, consumer_config)
            .await
            .map_err(|e| connection_error("failed to create consumer", e))?;
        info!(
            stream = %config.trigger_stream,
            group = %config.consumer_group,
            "trigger log consumer ready"
        );
        Ok(Self {
            consumer,
            in_flight: Mutex::new(HashMap::new()),
        })
    }

    fn take(&self, sequence: u64) -> Result<jetstream::Message, Report<EventLogError>> {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&sequence)
            .ok_or_else(|| {
                EventLogError::Ack {
                    sequence,
                    details: "entry is not in flight".to_string(),
                }
                .into()
            })
    }
}

#[async_trait]
impl EventLog for NatsEventLog {
    async fn fetch(
        &self,
        max: usize,
        wait: Duration,
    ) -> Result<Vec<LogEntry>, Report<EventLogError>> {
        let mut messages = self
            .consumer
            .batch()
            .max_messages(max)
            .expires(wait)
            .messages()
            .await
            .map_err(|e| EventLogError::Read {
                details: e.to_string(),
            })?;

        let mut entries = Vec::new();
        while let Some(message) = messages.next().await {
            let message = message.map_err(|e| EventLogError::Read {
                details: e.to_string(),
            })?;
            let (sequence, delivered) = match message.info() {
                Ok(info) => (info.stream_sequence, u64::try_from(info.delivered).unwrap_or(1)),
                Err(e) => {
                    warn!(error = %e, "message without JetStream metadata; skipping");
                    continue;
                }
            };
            entries.push(LogEntry {
                sequence,
                payload: message.payload.to_vec(),
                delivered,
            });
            self.in_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(sequence, message);
        }
        if !entries.is_empty() {
            debug!(count = entries.len(), "fetched trigger entries");
        }
        Ok(entries)
    }

    async fn ack(&self, entry: &LogEntry) -> Result<(), Report<EventLogError>> {
        let message = self.take(entry.sequence)?;
        message.ack().await.map_err(|e| EventLogError::Ack {
            sequence: entry.sequence,
            details: e.to_string(),
        })?;
        Ok(())
    }

    async fn nak(&self, entry: &LogEntry, delay: Duration) -> Result<(), Report<EventLogError>> {
        let message = self.take(entry.sequence)?;
        message
            .ack_with(AckKind::Nak(Some(delay)))
            .await
            .map_err(|e| EventLogError::Ack {
                sequence: entry.sequence,
                details: e.to_string(),
            })?;
        Ok(())
    }
}

/// Publishes trigger events onto the trigger stream.
pub struct NatsTriggerPublisher {
    jetstream: jetstream::Context,
    config: NatsLogConfig,
}

impl NatsTriggerPublisher {
    /// Ensures the trigger stream exists.
    ///
    /// # Errors
    ///
    /// Returns an error if stream setup fails.
    pub async fn new(
        jetstream: jetstream::Context,
        config: NatsLogConfig,
    ) -> Result<Self, Report<EventLogError>> {
        ensure_stream(&jetstream, &config.trigger_stream, &config.trigger_subject).await?;
        Ok(Self { jetstream, config })
    }
}

#[async_trait]
impl TriggerPublisher for NatsTriggerPublisher {
    async fn publish(&self, event: &TriggerEvent) -> Result<(), Report<EventLogError>> {
        let subject = self.config.trigger_subject_for(event);
        let bytes = event.encode().map_err(|e| EventLogError::Publish {
            details: format!("failed to serialize event: {e}"),
        })?;
        self.jetstream
            .publish(subject, bytes.into())
            .await
            .map_err(|e| EventLogError::Publish {
                details: e.to_string(),
            })?
            .await
            .map_err(|e| EventLogError::Publish {
                details: e.to_string(),
            })?;
        Ok(())
    }
}

/// Publishes outbound instructions onto per-channel delivery subjects.
pub struct NatsOutboundPublisher {
    jetstream: jetstream::Context,
    subject_prefix: String,
}

impl NatsOutboundPublisher {
    /// Ensures the outbound stream exists.
    ///
    /// # Errors
    ///
    /// Returns an error if stream setup fails.
    pub async fn new(
        jetstream: jetstream::Context,
        config: &NatsLogConfig,
    ) -> Result<Self, Report<EventLogError>> {
        ensure_stream(&jetstream, &config.outbound_stream, &config.outbound_subject).await?;
        Ok(Self {
            jetstream,
            subject_prefix: config.outbound_subject.clone(),
        })
    }
}

#[async_trait]
impl OutboundPublisher for NatsOutboundPublisher {
    async fn publish(
        &self,
        instruction: &OutboundInstruction,
    ) -> Result<(), Report<OutboundError>> {
        let subject = instruction.subject(&self.subject_prefix);
        let bytes = serde_json::to_vec(instruction).map_err(|e| OutboundError::Encode {
            details: e.to_string(),
        })?;
        self.jetstream
            .publish(subject.clone(), bytes.into())
            .await
            .map_err(|e| OutboundError::Unavailable {
                details: e.to_string(),
            })?
            .await
            .map_err(|e| OutboundError::Unavailable {
                details: e.to_string(),
            })?;
        debug!(%subject, run_id = %instruction.run_id, "outbound instruction enqueued");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::DirectEvent;
    use relayflow_core::TenantId;
    use serde_json::json;

    #[test]
    fn default_names() {
        let config = NatsLogConfig::new("nats://localhost:4222", "ingest-1");
        assert_eq!(config.trigger_stream, "TRIGGER_EVENTS");
        assert_eq!(config.outbound_subject, "outbound");
        assert_eq!(config.consumer_name, "ingest-1");
    }

    #[test]
    fn trigger_subject_is_per_tenant() {
        let config = NatsLogConfig::new("nats://localhost:4222", "ingest-1");
        let event = TriggerEvent::Direct(DirectEvent::new("manual", TenantId::new("t1"), json!({})));
        assert_eq!(config.trigger_subject_for(&event), "triggers.t1");
    }
}
