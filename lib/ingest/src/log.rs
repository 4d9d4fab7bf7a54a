//! The durable trigger log seam.
//!
//! The log has consumer-group semantics: every process reading the same
//! group shares delivery, and an entry stays eligible for redelivery until
//! it is acknowledged.

use crate::error::EventLogError;
use crate::event::TriggerEvent;
use async_trait::async_trait;
use rootcause::prelude::Report;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;

/// One delivered log entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// Position in the log; unique per entry.
    pub sequence: u64,
    /// Raw entry body.
    pub payload: Vec<u8>,
    /// Number of times the entry has been delivered, starting at 1.
    pub delivered: u64,
}

/// A consumer-group reader over the trigger log.
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Reads up to `max` entries, waiting at most `wait` for the first one.
    ///
    /// An empty batch means the wait elapsed.
    async fn fetch(&self, max: usize, wait: Duration)
    -> Result<Vec<LogEntry>, Report<EventLogError>>;

    /// Marks an entry processed.
    async fn ack(&self, entry: &LogEntry) -> Result<(), Report<EventLogError>>;

    /// Returns an entry for redelivery after `delay`.
    async fn nak(&self, entry: &LogEntry, delay: Duration) -> Result<(), Report<EventLogError>>;
}

/// Appends trigger events to the log.
#[async_trait]
pub trait TriggerPublisher: Send + Sync {
    /// Appends one event.
    async fn publish(&self, event: &TriggerEvent) -> Result<(), Report<EventLogError>>;
}

#[derive(Debug, Default)]
struct LogState {
    next_sequence: u64,
    pending: VecDeque<LogEntry>,
    in_flight: HashMap<u64, LogEntry>,
    acked: Vec<u64>,
}

/// Single-group event log held in memory.
///
/// Nak'd entries are redelivered immediately; the delay is ignored.
#[derive(Debug, Default)]
pub struct InMemoryEventLog {
    state: Mutex<LogState>,
    appended: Notify,
}

impl InMemoryEventLog {
    /// Creates an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, LogState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends raw bytes and returns the entry's sequence.
    pub fn append(&self, payload: impl Into<Vec<u8>>) -> u64 {
        let sequence = {
            let mut state = self.state();
            state.next_sequence += 1;
            let sequence = state.next_sequence;
            state.pending.push_back(LogEntry {
                sequence,
                payload: payload.into(),
                delivered: 0,
            });
            sequence
        };
        self.appended.notify_one();
        sequence
    }

    /// Sequences acknowledged so far, in acknowledgement order.
    #[must_use]
    pub fn acked(&self) -> Vec<u64> {
        self.state().acked.clone()
    }

    /// Number of entries waiting for delivery.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.state().pending.len()
    }

    /// Number of delivered, unacknowledged entries.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.state().in_flight.len()
    }

    fn take(&self, max: usize) -> Vec<LogEntry> {
        let mut state = self.state();
        let count = max.min(state.pending.len());
        let batch: Vec<LogEntry> = state
            .pending
            .drain(..count)
            .map(|mut entry| {
                entry.delivered += 1;
                entry
            })
            .collect();
        for entry in &batch {
            state.in_flight.insert(entry.sequence, entry.clone());
        }
        batch
    }
}

#[async_trait]
impl EventLog for InMemoryEventLog {
    async fn fetch(
        &self,
        max: usize,
        wait: Duration,
    ) -> Result<Vec<LogEntry>, Report<EventLogError>> {
        let batch = self.take(max);
        if !batch.is_empty() {
            return Ok(batch);
        }
        let _ = tokio::time::timeout(wait, self.appended.notified()).await;
        Ok(self.take(max))
    }

    async fn ack(&self, entry: &LogEntry) -> Result<(), Report<EventLogError>> {
        let mut state = self.state();
        if state.in_flight.remove(&entry.sequence).is_none() {
            return Err(EventLogError::Ack {
                sequence: entry.sequence,
                details: "entry is not in flight".to_string(),
            }
            .into());
        }
        state.acked.push(entry.sequence);
        Ok(())
    }

    async fn nak(&self, entry: &LogEntry, _delay: Duration) -> Result<(), Report<EventLogError>> {
        {
            let mut state = self.state();
            let Some(entry) = state.in_flight.remove(&entry.sequence) else {
                return Err(EventLogError::Ack {
                    sequence: entry.sequence,
                    details: "entry is not in flight".to_string(),
                }
                .into());
            };
            state.pending.push_front(entry);
        }
        self.appended.notify_one();
        Ok(())
    }
}

#[async_trait]
impl TriggerPublisher for InMemoryEventLog {
    async fn publish(&self, event: &TriggerEvent) -> Result<(), Report<EventLogError>> {
        let bytes = event.encode().map_err(|e| EventLogError::Publish {
            details: e.to_string(),
        })?;
        self.append(bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_in_order_and_tracks_acks() {
        let log = InMemoryEventLog::new();
        log.append("a");
        log.append("b");
        log.append("c");

        let batch = log.fetch(2, Duration::from_millis(10)).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].payload, b"a");
        assert_eq!(log.in_flight(), 2);

        log.ack(&batch[0]).await.unwrap();
        assert!(log.ack(&batch[0]).await.is_err(), "double ack is rejected");
        assert_eq!(log.acked(), vec![1]);
        assert_eq!(log.pending(), 1);
    }

    #[tokio::test]
    async fn nak_redelivers() {
        let log = InMemoryEventLog::new();
        log.append("a");
        let first = log.fetch(1, Duration::from_millis(10)).await.unwrap();
        log.nak(&first[0], Duration::ZERO).await.unwrap();

        let again = log.fetch(1, Duration::from_millis(10)).await.unwrap();
        assert_eq!(again[0].sequence, first[0].sequence);
        assert_eq!(again[0].delivered, 2);
    }

    #[tokio::test]
    async fn empty_fetch_waits_then_returns_nothing() {
        let log = InMemoryEventLog::new();
        let batch = log.fetch(5, Duration::from_millis(5)).await.unwrap();
        assert!(batch.is_empty());
    }
}
