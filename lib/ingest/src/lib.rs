//! Trigger ingestion for relayflow.
//!
//! The [`TriggerIngestor`] reads the durable trigger log, matches events to
//! active workflow versions, enforces per-tenant rate limits and hands new
//! runs to the executor pool. Delivery is at-least-once; run creation is
//! idempotent on `(version_id, source_event_id)`.

pub mod enrich;
pub mod error;
pub mod event;
pub mod filter;
pub mod ingestor;
pub mod log;
pub mod nats;
pub mod rate_limit;

pub use enrich::{InMemoryMessageLookup, MessageDetails, MessageLookup, SenderDetails};
pub use error::{EventLogError, IngestError};
pub use event::{ChannelMessageEvent, DirectEvent, TriggerEvent, channel_trigger_type};
pub use filter::{EventAttributes, TriggerFilters};
pub use ingestor::{EntryOutcome, IngestConfig, IngestSummary, TriggerIngestor};
pub use log::{EventLog, InMemoryEventLog, LogEntry, TriggerPublisher};
pub use nats::{NatsEventLog, NatsLogConfig, NatsOutboundPublisher, NatsTriggerPublisher};
pub use rate_limit::{
    RateLimitConfig, RateLimitDecision, RunRateLimiter, SlidingWindowLimiter, StoreRateLimiter,
};
