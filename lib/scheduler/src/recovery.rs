//! Recovery of runs abandoned by crashed processes.
//!
//! Two cases are swept each poll:
//! - `running` runs whose pass stopped writing for longer than the lease
//!   are released back to `pending` through the store's conditional write
//! - `pending` runs older than the grace period (their submission was
//!   lost with a process's in-memory queue) are submitted again
//!
//! Extra submissions are harmless: only one claim can succeed.

use crate::error::SchedulerError;
use chrono::{DateTime, Duration, Utc};
use relayflow_core::WorkflowRunId;
use relayflow_workflow::{RunStore, RunSubmitter};
use rootcause::prelude::Report;
use std::sync::Arc;
use tracing::{debug, warn};

/// Counts from one recovery sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoverySummary {
    /// Stalled `running` runs handed back to `pending`.
    pub released: usize,
    /// Runs submitted to the pool.
    pub resubmitted: usize,
}

/// Resubmits runs no live pass is working on.
pub struct RunRecovery {
    runs: Arc<dyn RunStore>,
    submitter: Arc<dyn RunSubmitter>,
    pending_grace: Duration,
    running_lease: Duration,
    batch_size: usize,
}

impl RunRecovery {
    /// `running_lease` must exceed the longest single node attempt; a pass
    /// refreshes its lease on every step it persists.
    #[must_use]
    pub fn new(
        runs: Arc<dyn RunStore>,
        submitter: Arc<dyn RunSubmitter>,
        pending_grace: Duration,
        running_lease: Duration,
        batch_size: usize,
    ) -> Self {
        Self {
            runs,
            submitter,
            pending_grace,
            running_lease,
            batch_size: batch_size.max(1),
        }
    }

    /// Runs one sweep at `now`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read or the pool rejects a
    /// submission. Anything left over is picked up by the next sweep.
    pub async fn recover_once(
        &self,
        now: DateTime<Utc>,
    ) -> Result<RecoverySummary, Report<SchedulerError>> {
        let store = |e: Report<_>| SchedulerError::Store {
            details: e.to_string(),
        };

        let released = self
            .runs
            .release_stalled(now - self.running_lease, self.batch_size)
            .await
            .map_err(store)?;
        for run_id in &released {
            warn!(%run_id, "released run stalled in running");
        }

        let mut candidates: Vec<WorkflowRunId> = released.clone();
        for run_id in self
            .runs
            .stale_pending(now - self.pending_grace, self.batch_size)
            .await
            .map_err(store)?
        {
            if !candidates.contains(&run_id) {
                candidates.push(run_id);
            }
        }

        let mut summary = RecoverySummary {
            released: released.len(),
            resubmitted: 0,
        };
        for run_id in candidates {
            self.submitter
                .submit(run_id)
                .await
                .map_err(|e| SchedulerError::Submit {
                    details: e.to_string(),
                })?;
            debug!(%run_id, "recovered run resubmitted");
            summary.resubmitted += 1;
        }
        Ok(summary)
    }
}
