//! Per-tenant run-creation rate limiting.
//!
//! Each tenant may create at most `max_runs` runs in any rolling window.
//! Rejections are final: the ingestor drops the run and moves on.

use crate::error::IngestError;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use relayflow_core::TenantId;
use relayflow_workflow::RunStore;
use rootcause::prelude::Report;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

/// Rate limit configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Maximum runs per window.
    pub max_runs: u32,
    /// Window length in seconds.
    pub window_seconds: u32,
}

impl RateLimitConfig {
    /// Creates a new rate limit configuration.
    #[must_use]
    pub fn new(max_runs: u32, window_seconds: u32) -> Self {
        Self {
            max_runs,
            window_seconds,
        }
    }

    /// `max_runs` per rolling minute.
    #[must_use]
    pub fn per_minute(max_runs: u32) -> Self {
        Self::new(max_runs, 60)
    }

    fn window(&self) -> Duration {
        Duration::seconds(i64::from(self.window_seconds))
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self::per_minute(60)
    }
}

/// Result of a rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitDecision {
    /// The run may be created.
    Allowed { remaining: u32 },
    /// The tenant is over its limit.
    Exceeded { retry_after: Duration },
}

impl RateLimitDecision {
    /// Returns true if the run may be created.
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. })
    }
}

/// Decides whether a tenant may create another run.
#[async_trait]
pub trait RunRateLimiter: Send + Sync {
    /// Checks the limit and, when allowed, counts one run against it.
    async fn try_acquire(
        &self,
        tenant_id: &TenantId,
        now: DateTime<Utc>,
    ) -> Result<RateLimitDecision, Report<IngestError>>;
}

/// In-process sliding-window limiter.
///
/// Keeps the creation times of each tenant's runs inside the window.
#[derive(Debug)]
pub struct SlidingWindowLimiter {
    config: RateLimitConfig,
    state: Mutex<HashMap<TenantId, VecDeque<DateTime<Utc>>>>,
}

impl SlidingWindowLimiter {
    /// Creates a limiter with the given configuration.
    #[must_use]
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            state: Mutex::new(HashMap::new()),
        }
    }

    /// Checks the limit at `now` and records an acquisition when allowed.
    pub fn acquire(&self, tenant_id: &TenantId, now: DateTime<Utc>) -> RateLimitDecision {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let window = self.config.window();
        let times = state.entry(tenant_id.clone()).or_default();

        while times.front().is_some_and(|t| now - *t >= window) {
            times.pop_front();
        }

        let used = u32::try_from(times.len()).unwrap_or(u32::MAX);
        if used >= self.config.max_runs {
            let retry_after = times
                .front()
                .map_or(Duration::zero(), |oldest| *oldest + window - now);
            return RateLimitDecision::Exceeded { retry_after };
        }

        times.push_back(now);
        RateLimitDecision::Allowed {
            remaining: self.config.max_runs - used - 1,
        }
    }

    /// Forgets a tenant's history.
    pub fn reset(&self, tenant_id: &TenantId) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(tenant_id);
    }

    /// Returns the current configuration.
    #[must_use]
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }
}

#[async_trait]
impl RunRateLimiter for SlidingWindowLimiter {
    async fn try_acquire(
        &self,
        tenant_id: &TenantId,
        now: DateTime<Utc>,
    ) -> Result<RateLimitDecision, Report<IngestError>> {
        Ok(self.acquire(tenant_id, now))
    }
}

/// Cluster-wide limiter that counts the tenant's stored runs.
///
/// Every ingestor process shares the run table, so the count covers runs
/// created anywhere in the cluster.
///
/// This is a soft limit. The count and the later `create_run` are separate
/// statements, so ingestors acquiring for the same tenant at the same time
/// can each see room and together overshoot `max_runs` by up to the number
/// of concurrent ingestors. Use [`SlidingWindowLimiter`] where a single
/// process must enforce an exact bound.
pub struct StoreRateLimiter {
    config: RateLimitConfig,
    runs: Arc<dyn RunStore>,
}

impl StoreRateLimiter {
    /// Creates a limiter over a run store.
    #[must_use]
    pub fn new(config: RateLimitConfig, runs: Arc<dyn RunStore>) -> Self {
        Self { config, runs }
    }
}

#[async_trait]
impl RunRateLimiter for StoreRateLimiter {
    async fn try_acquire(
        &self,
        tenant_id: &TenantId,
        now: DateTime<Utc>,
    ) -> Result<RateLimitDecision, Report<IngestError>> {
        let since = now - self.config.window();
        let used = self
            .runs
            .count_runs_since(tenant_id, since)
            .await
            .map_err(|e| IngestError::RateLimit {
                details: e.to_string(),
            })?;
        let max = u64::from(self.config.max_runs);
        if used >= max {
            return Ok(RateLimitDecision::Exceeded {
                retry_after: self.config.window(),
            });
        }
        Ok(RateLimitDecision::Allowed {
            remaining: u32::try_from(max - used - 1).unwrap_or(0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relayflow_workflow::WorkflowRun;
    use relayflow_workflow::memory::InMemoryRunStore;
    use relayflow_core::{WorkflowId, WorkflowVersionId};
    use serde_json::json;

    fn tenant(id: &str) -> TenantId {
        TenantId::new(id)
    }

    #[test]
    fn allows_under_limit() {
        let limiter = SlidingWindowLimiter::new(RateLimitConfig::per_minute(10));
        let now = Utc::now();
        for i in 0..10 {
            let decision = limiter.acquire(&tenant("t1"), now);
            assert_eq!(decision, RateLimitDecision::Allowed { remaining: 9 - i });
        }
        assert!(!limiter.acquire(&tenant("t1"), now).is_allowed());
    }

    #[test]
    fn window_slides() {
        let limiter = SlidingWindowLimiter::new(RateLimitConfig::per_minute(2));
        let start = Utc::now();
        assert!(limiter.acquire(&tenant("t1"), start).is_allowed());
        assert!(limiter
            .acquire(&tenant("t1"), start + Duration::seconds(30))
            .is_allowed());

        let RateLimitDecision::Exceeded { retry_after } =
            limiter.acquire(&tenant("t1"), start + Duration::seconds(45))
        else {
            panic!("expected exceeded");
        };
        assert_eq!(retry_after, Duration::seconds(15));

        // the first acquisition has left the window
        assert!(limiter
            .acquire(&tenant("t1"), start + Duration::seconds(60))
            .is_allowed());
        assert!(!limiter
            .acquire(&tenant("t1"), start + Duration::seconds(61))
            .is_allowed());
    }

    #[test]
    fn tenants_are_isolated() {
        let limiter = SlidingWindowLimiter::new(RateLimitConfig::per_minute(1));
        let now = Utc::now();
        assert!(limiter.acquire(&tenant("t1"), now).is_allowed());
        assert!(!limiter.acquire(&tenant("t1"), now).is_allowed());
        assert!(limiter.acquire(&tenant("t2"), now).is_allowed());

        limiter.reset(&tenant("t1"));
        assert!(limiter.acquire(&tenant("t1"), now).is_allowed());
    }

    #[tokio::test]
    async fn store_limiter_counts_recent_runs() {
        let runs = Arc::new(InMemoryRunStore::new());
        let limiter = StoreRateLimiter::new(RateLimitConfig::per_minute(2), runs.clone());
        let t1 = tenant("t1");

        for i in 0..2 {
            let run = WorkflowRun::new(
                WorkflowId::new(),
                WorkflowVersionId::new(),
                t1.clone(),
                "manual",
                format!("evt-{i}"),
                json!({}),
            );
            assert!(limiter.try_acquire(&t1, Utc::now()).await.unwrap().is_allowed());
            runs.create_run(&run).await.unwrap();
        }
        assert!(!limiter.try_acquire(&t1, Utc::now()).await.unwrap().is_allowed());
        assert!(limiter
            .try_acquire(&tenant("t2"), Utc::now())
            .await
            .unwrap()
            .is_allowed());
    }

    #[tokio::test]
    async fn store_limiter_overshoots_when_acquisitions_race() {
        let runs = Arc::new(InMemoryRunStore::new());
        let limiter = StoreRateLimiter::new(RateLimitConfig::per_minute(1), runs.clone());
        let t1 = tenant("t1");

        // neither acquisition sees the other's run yet
        let now = Utc::now();
        assert!(limiter.try_acquire(&t1, now).await.unwrap().is_allowed());
        assert!(limiter.try_acquire(&t1, now).await.unwrap().is_allowed());

        let run = WorkflowRun::new(
            WorkflowId::new(),
            WorkflowVersionId::new(),
            t1.clone(),
            "manual",
            "evt-1",
            json!({}),
        );
        runs.create_run(&run).await.unwrap();
        assert!(!limiter.try_acquire(&t1, Utc::now()).await.unwrap().is_allowed());
    }
}
