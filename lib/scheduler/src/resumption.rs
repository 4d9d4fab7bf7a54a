//! Resumption of waiting runs.

use crate::error::SchedulerError;
use chrono::{DateTime, Utc};
use relayflow_workflow::{RunStore, RunSubmitter};
use rootcause::prelude::Report;
use std::sync::Arc;
use tracing::{info, warn};

/// Resubmits runs whose wait has elapsed.
///
/// The poller never consumes a resumption itself. The executor pool's
/// claim consumes it in the same conditional write that moves the run to
/// `running`, so a due row stays visible until some pass owns the run.
/// A failed submission, or one lost with a crashed process, is retried by
/// the next poll; extra submissions lose the claim and are dropped.
pub struct ResumptionPoller {
    runs: Arc<dyn RunStore>,
    submitter: Arc<dyn RunSubmitter>,
    batch_size: usize,
}

impl ResumptionPoller {
    /// Creates a poller handling up to `batch_size` resumptions per poll.
    #[must_use]
    pub fn new(runs: Arc<dyn RunStore>, submitter: Arc<dyn RunSubmitter>, batch_size: usize) -> Self {
        Self {
            runs,
            submitter,
            batch_size: batch_size.max(1),
        }
    }

    /// Submits every run due at `now`; returns how many were submitted.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read or the pool rejects a
    /// submission. Unsubmitted resumptions stay due for the next poll.
    pub async fn poll_once(&self, now: DateTime<Utc>) -> Result<usize, Report<SchedulerError>> {
        let due = self
            .runs
            .due_resumptions(now, self.batch_size)
            .await
            .map_err(|e| SchedulerError::Store {
                details: e.to_string(),
            })?;

        let mut submitted = 0;
        for resumption in due {
            if let Err(e) = self.submitter.submit(resumption.run_id).await {
                warn!(run_id = %resumption.run_id, error = %e, "failed to resubmit resumed run");
                return Err(SchedulerError::Submit {
                    details: e.to_string(),
                }
                .into());
            }
            info!(
                run_id = %resumption.run_id,
                node_id = %resumption.node_id,
                due = %resumption.resume_at,
                "run resubmitted"
            );
            submitted += 1;
        }
        Ok(submitted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::RecordingSubmitter;
    use async_trait::async_trait;
    use chrono::Duration;
    use relayflow_core::{TenantId, WorkflowId, WorkflowRunId, WorkflowVersionId};
    use relayflow_workflow::{
        Cursor, PoolError, RunStatus, ScheduledResumption, WorkflowRun, memory::InMemoryRunStore,
    };
    use serde_json::json;

    struct ClosedPool;

    #[async_trait]
    impl RunSubmitter for ClosedPool {
        async fn submit(&self, _run_id: WorkflowRunId) -> Result<(), Report<PoolError>> {
            Err(PoolError::Closed.into())
        }
    }

    async fn waiting_run(runs: &InMemoryRunStore, resume_at: DateTime<Utc>) -> WorkflowRun {
        let run = WorkflowRun::new(
            WorkflowId::new(),
            WorkflowVersionId::new(),
            TenantId::new("t1"),
            "manual",
            "evt-1",
            json!({}),
        );
        runs.create_run(&run).await.unwrap();
        let claimed = runs.try_claim(run.id, Utc::now()).await.unwrap().unwrap();
        runs.suspend_run(
            run.id,
            &Cursor::new("pause".into(), "next"),
            &claimed.context,
            &ScheduledResumption::new(run.id, "pause".into(), resume_at),
        )
        .await
        .unwrap();
        claimed
    }

    #[tokio::test]
    async fn consumed_resumption_is_not_resubmitted() {
        let runs = Arc::new(InMemoryRunStore::new());
        let submitter = Arc::new(RecordingSubmitter::default());
        let poller = ResumptionPoller::new(runs.clone(), submitter.clone(), 10);
        let now = Utc::now();
        let run = waiting_run(&runs, now - Duration::seconds(1)).await;

        assert_eq!(poller.poll_once(now).await.unwrap(), 1);
        assert!(runs.try_claim(run.id, now).await.unwrap().is_some());
        assert!(runs.resumptions()[0].consumed_at.is_some());

        assert_eq!(poller.poll_once(now).await.unwrap(), 0);
        assert_eq!(submitter.submitted(), vec![run.id]);
    }

    #[tokio::test]
    async fn failed_submission_is_retried_by_next_poll() {
        let runs = Arc::new(InMemoryRunStore::new());
        let now = Utc::now();
        let run = waiting_run(&runs, now - Duration::seconds(1)).await;

        let broken = ResumptionPoller::new(runs.clone(), Arc::new(ClosedPool), 10);
        assert!(broken.poll_once(now).await.is_err());
        let stored = runs.get_run(run.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Waiting);
        assert!(runs.resumptions()[0].consumed_at.is_none(), "still outstanding");

        let submitter = Arc::new(RecordingSubmitter::default());
        let healthy = ResumptionPoller::new(runs.clone(), submitter.clone(), 10);
        let later = now + Duration::hours(1);
        assert_eq!(healthy.poll_once(later).await.unwrap(), 1);
        assert_eq!(submitter.submitted(), vec![run.id]);
        assert!(runs.try_claim(run.id, later).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn future_resumptions_wait() {
        let runs = Arc::new(InMemoryRunStore::new());
        let submitter = Arc::new(RecordingSubmitter::default());
        let poller = ResumptionPoller::new(runs.clone(), submitter.clone(), 10);
        let now = Utc::now();
        let run = waiting_run(&runs, now + Duration::minutes(5)).await;

        assert_eq!(poller.poll_once(now).await.unwrap(), 0);
        assert_eq!(
            runs.get_run(run.id).await.unwrap().unwrap().status,
            RunStatus::Waiting
        );
        assert_eq!(poller.poll_once(now + Duration::minutes(5)).await.unwrap(), 1);
    }
}
