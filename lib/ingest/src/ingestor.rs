//! Trigger Ingestor: turns log entries into submitted runs.
//!
//! For each entry:
//! 1. Decode it; undecodable entries are acknowledged and dropped
//! 2. Find the tenant's active workflows accepting the trigger type
//! 3. Build the trigger payload, enriching channel messages
//! 4. Per workflow: apply filters, skip to resubmission when a run already
//!    exists for the event, then apply the tenant rate limit, then create
//!    the run (idempotent on `(version_id, source_event_id)`) and submit it
//! 5. Acknowledge the entry
//!
//! Any infrastructure failure in steps 2-4 leaves the entry unacknowledged
//! and returns it for redelivery.

use crate::enrich::{MessageLookup, bare_payload};
use crate::error::IngestError;
use crate::event::TriggerEvent;
use crate::filter::{EventAttributes, TriggerFilters};
use crate::log::{EventLog, LogEntry};
use crate::rate_limit::{RateLimitDecision, RunRateLimiter};
use chrono::Utc;
use relayflow_core::WorkflowRunId;
use relayflow_workflow::{
    CreateRunResult, DefinitionStore, RunStatus, RunStore, RunSubmitter, WorkflowRun,
};
use rootcause::prelude::Report;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{Instrument, debug, error, info, info_span, warn};

/// Ingestor tuning.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Entries read per fetch.
    pub batch_size: usize,
    /// How long a fetch blocks waiting for entries.
    pub block: Duration,
    /// Delay before a failed entry is redelivered.
    pub redelivery_delay: Duration,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            block: Duration::from_secs(5),
            redelivery_delay: Duration::from_secs(5),
        }
    }
}

/// What happened to one log entry's candidate workflows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestSummary {
    /// Active workflows accepting the trigger type.
    pub matched: usize,
    /// Workflows skipped by their trigger filters.
    pub filtered: usize,
    /// Runs dropped by the tenant rate limit.
    pub rate_limited: usize,
    /// Runs created and submitted.
    pub created: usize,
    /// Runs that already existed for this event.
    pub duplicates: usize,
}

/// Disposition of a processed entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryOutcome {
    /// The entry was a trigger event and every candidate was handled.
    Processed(IngestSummary),
    /// The entry could never be processed.
    Malformed { reason: String },
}

/// Consumes the trigger log and starts runs.
pub struct TriggerIngestor {
    log: Arc<dyn EventLog>,
    definitions: Arc<dyn DefinitionStore>,
    runs: Arc<dyn RunStore>,
    messages: Arc<dyn MessageLookup>,
    limiter: Arc<dyn RunRateLimiter>,
    submitter: Arc<dyn RunSubmitter>,
    config: IngestConfig,
}

fn store_error(e: impl std::fmt::Display) -> IngestError {
    IngestError::Store {
        details: e.to_string(),
    }
}

impl TriggerIngestor {
    /// Creates an ingestor with default tuning.
    #[must_use]
    pub fn new(
        log: Arc<dyn EventLog>,
        definitions: Arc<dyn DefinitionStore>,
        runs: Arc<dyn RunStore>,
        messages: Arc<dyn MessageLookup>,
        limiter: Arc<dyn RunRateLimiter>,
        submitter: Arc<dyn RunSubmitter>,
    ) -> Self {
        Self {
            log,
            definitions,
            runs,
            messages,
            limiter,
            submitter,
            config: IngestConfig::default(),
        }
    }

    /// Replaces the tuning.
    #[must_use]
    pub fn with_config(mut self, config: IngestConfig) -> Self {
        self.config = config;
        self
    }

    /// Reads and processes entries until `shutdown` flips to `true`.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(batch_size = self.config.batch_size, "trigger ingestor started");
        while !*shutdown.borrow() {
            let fetched = tokio::select! {
                _ = shutdown.changed() => break,
                fetched = self.log.fetch(self.config.batch_size, self.config.block) => fetched,
            };
            match fetched {
                Ok(entries) => {
                    for entry in entries {
                        self.handle(entry).await;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "failed to read trigger log");
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        () = tokio::time::sleep(self.config.redelivery_delay) => {}
                    }
                }
            }
        }
        info!("trigger ingestor stopped");
    }

    async fn handle(&self, entry: LogEntry) {
        let span = info_span!("ingest", sequence = entry.sequence, delivered = entry.delivered);
        async {
            match self.process_entry(&entry).await {
                Ok(EntryOutcome::Processed(summary)) => {
                    debug!(?summary, "entry processed");
                    if let Err(e) = self.log.ack(&entry).await {
                        warn!(error = %e, "failed to acknowledge entry; it will be redelivered");
                    }
                }
                Ok(EntryOutcome::Malformed { reason }) => {
                    error!(%reason, "dropping malformed trigger entry");
                    if let Err(e) = self.log.ack(&entry).await {
                        warn!(error = %e, "failed to acknowledge malformed entry");
                    }
                }
                Err(e) => {
                    warn!(error = %e, "failed to process entry; leaving it for redelivery");
                    if let Err(e) = self.log.nak(&entry, self.config.redelivery_delay).await {
                        warn!(error = %e, "failed to return entry to the log");
                    }
                }
            }
        }
        .instrument(span)
        .await;
    }

    /// Processes one entry without acknowledging it.
    ///
    /// # Errors
    ///
    /// Returns an error on store, enrichment, rate-limit or submission
    /// failure; the entry should then be redelivered. Runs created before
    /// the failure are deduplicated on redelivery.
    pub async fn process_entry(
        &self,
        entry: &LogEntry,
    ) -> Result<EntryOutcome, Report<IngestError>> {
        let event = match TriggerEvent::decode(&entry.payload) {
            Ok(event) => event,
            Err(e) => {
                return Ok(EntryOutcome::Malformed {
                    reason: e.to_string(),
                });
            }
        };
        let tenant_id = event.tenant_id().clone();
        let trigger_type = event.trigger_type();
        let mut summary = IngestSummary::default();

        let target = event.target_version();
        let candidates: Vec<_> = self
            .definitions
            .find_active(&tenant_id, &trigger_type)
            .await
            .map_err(store_error)?
            .into_iter()
            .filter(|w| target.is_none_or(|version_id| w.version.id == version_id))
            .collect();
        if candidates.is_empty() {
            debug!(%tenant_id, %trigger_type, "no workflow matches event");
            return Ok(EntryOutcome::Processed(summary));
        }

        let payload = self.payload(&event).await?;
        let attributes = EventAttributes::extract(event.channel(), &payload);
        let source_event_id = event.source_event_id(entry.sequence);

        for workflow in candidates {
            let workflow_id = workflow.definition.id;
            summary.matched += 1;

            if !TriggerFilters::new(&workflow.version.trigger_config).matches(&attributes) {
                info!(%tenant_id, %workflow_id, "event skipped by trigger filters");
                summary.filtered += 1;
                continue;
            }

            // Redeliveries must not spend the tenant's budget.
            if let Some(existing) = self
                .runs
                .find_by_source(workflow.version.id, &source_event_id)
                .await
                .map_err(store_error)?
            {
                self.resubmit_duplicate(existing.id, existing.status).await?;
                summary.duplicates += 1;
                continue;
            }

            let decision = self.limiter.try_acquire(&tenant_id, Utc::now()).await?;
            if let RateLimitDecision::Exceeded { retry_after } = decision {
                info!(
                    %tenant_id,
                    %workflow_id,
                    retry_after_secs = retry_after.num_seconds(),
                    "tenant over run rate limit; dropping run"
                );
                summary.rate_limited += 1;
                continue;
            }

            let run = WorkflowRun::new(
                workflow_id,
                workflow.version.id,
                tenant_id.clone(),
                trigger_type.as_str(),
                source_event_id.clone(),
                payload.clone(),
            );
            match self.runs.create_run(&run).await.map_err(store_error)? {
                CreateRunResult::Created => {
                    info!(run_id = %run.id, %tenant_id, %workflow_id, "run created");
                    self.submit(&run).await?;
                    summary.created += 1;
                }
                // Another ingestor created it between the lookup and the insert.
                CreateRunResult::Duplicate { existing, status } => {
                    self.resubmit_duplicate(existing, status).await?;
                    summary.duplicates += 1;
                }
            }
        }

        Ok(EntryOutcome::Processed(summary))
    }

    async fn submit(&self, run: &WorkflowRun) -> Result<(), Report<IngestError>> {
        self.submitter
            .submit(run.id)
            .await
            .map_err(|e| IngestError::Submit {
                details: e.to_string(),
            })?;
        Ok(())
    }

    /// A crash between create and submit leaves the run pending; its
    /// redelivered event submits it again.
    async fn resubmit_duplicate(
        &self,
        existing: WorkflowRunId,
        status: RunStatus,
    ) -> Result<(), Report<IngestError>> {
        debug!(run_id = %existing, %status, "run already exists for event");
        if status == RunStatus::Pending {
            self.submitter
                .submit(existing)
                .await
                .map_err(|e| IngestError::Submit {
                    details: e.to_string(),
                })?;
        }
        Ok(())
    }

    async fn payload(&self, event: &TriggerEvent) -> Result<JsonValue, Report<IngestError>> {
        match event {
            TriggerEvent::Direct(direct) => Ok(direct.payload.clone()),
            TriggerEvent::ChannelMessage(message) => {
                let details = self
                    .messages
                    .message_details(&message.tenant_id, &message.message_id)
                    .await?;
                Ok(match details {
                    Some(details) => details.to_payload(),
                    None => {
                        warn!(
                            message_id = %message.message_id,
                            "message not found; starting run without sender details"
                        );
                        bare_payload(message)
                    }
                })
            }
        }
    }
}
