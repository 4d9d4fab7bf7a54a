//! The scheduler loop.

use crate::cron_trigger::CronTriggerEvaluator;
use crate::recovery::RunRecovery;
use crate::resumption::ResumptionPoller;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

/// Scheduler tuning.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Time between polls; bounds resumption latency.
    pub poll_interval: Duration,
    /// Resumptions and recovered runs handled per poll.
    pub batch_size: usize,
    /// Age after which a `pending` run is submitted again.
    pub pending_grace: Duration,
    /// Silence after which a `running` run is presumed abandoned.
    pub running_lease: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            batch_size: 100,
            pending_grace: Duration::from_secs(60),
            running_lease: Duration::from_secs(15 * 60),
        }
    }
}

/// Runs the resumption, recovery and cron duties on a fixed interval.
///
/// The duties are independent: a failing poll of one does not skip the
/// others.
pub struct Scheduler {
    resumptions: ResumptionPoller,
    recovery: RunRecovery,
    cron: CronTriggerEvaluator,
    poll_interval: Duration,
}

impl Scheduler {
    #[must_use]
    pub fn new(
        resumptions: ResumptionPoller,
        recovery: RunRecovery,
        cron: CronTriggerEvaluator,
        poll_interval: Duration,
    ) -> Self {
        Self {
            resumptions,
            recovery,
            cron,
            poll_interval,
        }
    }

    /// Runs one round of every duty; returns the new cron watermark.
    ///
    /// The watermark only advances when cron evaluation succeeds, so a
    /// failed round is retried over the widened window.
    pub async fn tick(&self, since: DateTime<Utc>, now: DateTime<Utc>) -> DateTime<Utc> {
        if let Err(e) = self.resumptions.poll_once(now).await {
            warn!(error = %e, "resumption poll failed");
        }
        match self.recovery.recover_once(now).await {
            Ok(summary) if summary.resubmitted > 0 => {
                info!(
                    released = summary.released,
                    resubmitted = summary.resubmitted,
                    "recovered abandoned runs"
                );
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "run recovery failed"),
        }
        match self.cron.evaluate(since, now).await {
            Ok(_) => now,
            Err(e) => {
                warn!(error = %e, "cron evaluation failed");
                since
            }
        }
    }

    /// Polls until `shutdown` flips to `true`.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let lookback = chrono::Duration::from_std(self.poll_interval)
            .unwrap_or_else(|_| chrono::Duration::seconds(5));
        let mut watermark = Utc::now() - lookback;
        info!(interval_ms = self.poll_interval.as_millis(), "scheduler started");

        while !*shutdown.borrow() {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = interval.tick() => {}
            }
            watermark = self.tick(watermark, Utc::now()).await;
        }
        info!("scheduler stopped");
    }
}
