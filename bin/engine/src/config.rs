//! Centralized engine configuration.
//!
//! Loaded via the `config` crate from `RELAYFLOW__`-prefixed environment
//! variables, with `__` separating sections from keys:
//!
//! ```text
//! RELAYFLOW__DATABASE_URL=postgres://localhost/relayflow
//! RELAYFLOW__NATS__URL=nats://localhost:4222
//! RELAYFLOW__POOL__WORKERS=16
//! RELAYFLOW__LLM__API_KEY=sk-...
//! ```

use relayflow_ai::{LlmBackendConfig, LlmProvider};
use relayflow_ingest::{IngestConfig, NatsLogConfig, RateLimitConfig};
use relayflow_scheduler::SchedulerConfig;
use relayflow_workflow::{ExecutorConfig, PoolConfig};
use serde::Deserialize;
use std::time::Duration;

/// Engine configuration.
#[derive(Debug, Deserialize)]
pub struct EngineConfig {
    /// PostgreSQL database connection URL.
    pub database_url: String,

    /// Maximum database connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Event log connection and naming.
    #[serde(default)]
    pub nats: NatsSection,

    /// Executor pool sizing.
    #[serde(default)]
    pub pool: PoolSection,

    /// Trigger ingestion.
    #[serde(default)]
    pub ingest: IngestSection,

    /// Resumption and cron polling.
    #[serde(default)]
    pub scheduler: SchedulerSection,

    /// Completion provider for AI nodes.
    #[serde(default)]
    pub llm: LlmSection,

    /// Run executor tuning.
    #[serde(default)]
    pub executor: ExecutorSection,
}

fn default_max_connections() -> u32 {
    10
}

/// NATS JetStream configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct NatsSection {
    #[serde(default = "default_nats_url")]
    pub url: String,
    #[serde(default = "default_trigger_stream")]
    pub trigger_stream: String,
    #[serde(default = "default_trigger_subject")]
    pub trigger_subject: String,
    /// Durable consumer shared by every engine process.
    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,
    /// This process's name; defaults to one derived from the process ID.
    #[serde(default)]
    pub consumer_name: Option<String>,
    #[serde(default = "default_ack_wait_seconds")]
    pub ack_wait_seconds: u64,
    #[serde(default = "default_outbound_stream")]
    pub outbound_stream: String,
    #[serde(default = "default_outbound_subject")]
    pub outbound_subject: String,
}

fn default_nats_url() -> String {
    "nats://localhost:4222".to_string()
}

fn default_trigger_stream() -> String {
    relayflow_ingest::nats::TRIGGER_STREAM_NAME.to_string()
}

fn default_trigger_subject() -> String {
    relayflow_ingest::nats::TRIGGER_SUBJECT_PREFIX.to_string()
}

fn default_consumer_group() -> String {
    "relayflow-ingest".to_string()
}

fn default_ack_wait_seconds() -> u64 {
    30
}

fn default_outbound_stream() -> String {
    relayflow_ingest::nats::OUTBOUND_STREAM_NAME.to_string()
}

fn default_outbound_subject() -> String {
    relayflow_ingest::nats::OUTBOUND_SUBJECT_PREFIX.to_string()
}

impl Default for NatsSection {
    fn default() -> Self {
        Self {
            url: default_nats_url(),
            trigger_stream: default_trigger_stream(),
            trigger_subject: default_trigger_subject(),
            consumer_group: default_consumer_group(),
            consumer_name: None,
            ack_wait_seconds: default_ack_wait_seconds(),
            outbound_stream: default_outbound_stream(),
            outbound_subject: default_outbound_subject(),
        }
    }
}

impl NatsSection {
    /// Builds the event log configuration.
    #[must_use]
    pub fn log_config(&self) -> NatsLogConfig {
        let consumer_name = self
            .consumer_name
            .clone()
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| format!("relayflow-engine-{}", std::process::id()));
        NatsLogConfig {
            url: self.url.clone(),
            trigger_stream: self.trigger_stream.clone(),
            trigger_subject: self.trigger_subject.clone(),
            consumer_group: self.consumer_group.clone(),
            consumer_name,
            ack_wait: Duration::from_secs(self.ack_wait_seconds.max(1)),
            outbound_stream: self.outbound_stream.clone(),
            outbound_subject: self.outbound_subject.clone(),
        }
    }
}

/// Executor pool sizing.
#[derive(Debug, Clone, Deserialize)]
pub struct PoolSection {
    /// Concurrent execution passes per process.
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_workers() -> usize {
    8
}

fn default_queue_capacity() -> usize {
    1024
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl From<&PoolSection> for PoolConfig {
    fn from(section: &PoolSection) -> Self {
        Self {
            workers: section.workers,
            queue_capacity: section.queue_capacity,
        }
    }
}

/// Trigger ingestion configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct IngestSection {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// How long a fetch blocks waiting for entries, in milliseconds.
    #[serde(default = "default_block_ms")]
    pub block_ms: u64,
    /// Delay before a failed entry is redelivered, in milliseconds.
    #[serde(default = "default_redelivery_delay_ms")]
    pub redelivery_delay_ms: u64,
    /// Runs a tenant may start per rolling minute.
    #[serde(default = "default_rate_limit_per_minute")]
    pub rate_limit_per_minute: u32,
}

fn default_batch_size() -> usize {
    32
}

fn default_block_ms() -> u64 {
    5000
}

fn default_redelivery_delay_ms() -> u64 {
    5000
}

fn default_rate_limit_per_minute() -> u32 {
    60
}

impl Default for IngestSection {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            block_ms: default_block_ms(),
            redelivery_delay_ms: default_redelivery_delay_ms(),
            rate_limit_per_minute: default_rate_limit_per_minute(),
        }
    }
}

impl IngestSection {
    /// Ingestor tuning.
    #[must_use]
    pub fn ingest_config(&self) -> IngestConfig {
        IngestConfig {
            batch_size: self.batch_size.max(1),
            block: Duration::from_millis(self.block_ms),
            redelivery_delay: Duration::from_millis(self.redelivery_delay_ms),
        }
    }

    /// Per-tenant run limit.
    #[must_use]
    pub fn rate_limit(&self) -> RateLimitConfig {
        RateLimitConfig::per_minute(self.rate_limit_per_minute)
    }
}

/// Scheduler configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerSection {
    /// Seconds between polls; bounds resumption latency.
    #[serde(default = "default_poll_interval_seconds")]
    pub poll_interval_seconds: u64,
    /// Resumptions and recovered runs handled per poll.
    #[serde(default = "default_scheduler_batch_size")]
    pub batch_size: usize,
    /// Seconds a `pending` run may wait before it is submitted again.
    #[serde(default = "default_pending_grace_seconds")]
    pub pending_grace_seconds: u64,
    /// Seconds without progress before a `running` run is reclaimed.
    #[serde(default = "default_running_lease_seconds")]
    pub running_lease_seconds: u64,
}

fn default_poll_interval_seconds() -> u64 {
    5
}

fn default_scheduler_batch_size() -> usize {
    100
}

fn default_pending_grace_seconds() -> u64 {
    60
}

fn default_running_lease_seconds() -> u64 {
    900
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            poll_interval_seconds: default_poll_interval_seconds(),
            batch_size: default_scheduler_batch_size(),
            pending_grace_seconds: default_pending_grace_seconds(),
            running_lease_seconds: default_running_lease_seconds(),
        }
    }
}

impl From<&SchedulerSection> for SchedulerConfig {
    fn from(section: &SchedulerSection) -> Self {
        Self {
            poll_interval: Duration::from_secs(section.poll_interval_seconds.max(1)),
            batch_size: section.batch_size,
            pending_grace: Duration::from_secs(section.pending_grace_seconds),
            running_lease: Duration::from_secs(section.running_lease_seconds.max(1)),
        }
    }
}

/// LLM provider configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    #[serde(default = "default_llm_provider")]
    pub provider: LlmProvider,
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_llm_timeout_seconds")]
    pub timeout_seconds: u64,
}

fn default_llm_provider() -> LlmProvider {
    LlmProvider::OpenAiCompatible
}

fn default_llm_base_url() -> String {
    "http://localhost:11434/v1".to_string()
}

fn default_llm_model() -> String {
    "llama3.2".to_string()
}

fn default_llm_timeout_seconds() -> u64 {
    30
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_llm_provider(),
            base_url: default_llm_base_url(),
            model: default_llm_model(),
            api_key: None,
            timeout_seconds: default_llm_timeout_seconds(),
        }
    }
}

impl From<&LlmSection> for LlmBackendConfig {
    fn from(section: &LlmSection) -> Self {
        Self {
            provider: section.provider.clone(),
            base_url: section.base_url.clone(),
            model: section.model.clone(),
            api_key: section.api_key.clone(),
            timeout_seconds: section.timeout_seconds,
        }
    }
}

/// Run executor configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutorSection {
    /// Node executions allowed per pass before the run fails.
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
}

fn default_max_steps() -> usize {
    relayflow_workflow::executor::DEFAULT_MAX_STEPS
}

impl Default for ExecutorSection {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
        }
    }
}

impl From<&ExecutorSection> for ExecutorConfig {
    fn from(section: &ExecutorSection) -> Self {
        Self {
            max_steps: section.max_steps.max(1),
        }
    }
}

impl EngineConfig {
    /// Loads configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if required configuration is missing or invalid.
    pub fn from_env() -> Result<Self, config::ConfigError> {
        Self::from_source(config::Environment::with_prefix("RELAYFLOW"))
    }

    fn from_source(source: config::Environment) -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(source.prefix_separator("__").separator("__").try_parsing(true))
            .build()?
            .try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<EngineConfig, config::ConfigError> {
        let source: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        EngineConfig::from_source(config::Environment::with_prefix("RELAYFLOW").source(Some(source)))
    }

    #[test]
    fn sections_have_correct_defaults() {
        let pool = PoolSection::default();
        assert_eq!(pool.workers, 8);
        let ingest = IngestSection::default();
        assert_eq!(ingest.rate_limit(), RateLimitConfig::per_minute(60));
        assert_eq!(ingest.ingest_config().block, Duration::from_secs(5));
        let scheduler = SchedulerConfig::from(&SchedulerSection::default());
        assert_eq!(scheduler.poll_interval, Duration::from_secs(5));
        assert_eq!(scheduler.pending_grace, Duration::from_secs(60));
        assert_eq!(scheduler.running_lease, Duration::from_secs(15 * 60));
        assert_eq!(ExecutorConfig::from(&ExecutorSection::default()).max_steps, 500);
    }

    #[test]
    fn loads_nested_sections_from_environment() {
        let config = load(&[
            ("RELAYFLOW__DATABASE_URL", "postgres://localhost/relayflow"),
            ("RELAYFLOW__POOL__WORKERS", "16"),
            ("RELAYFLOW__LLM__MODEL", "gpt-4o-mini"),
            ("RELAYFLOW__NATS__CONSUMER_NAME", "engine-a"),
        ])
        .unwrap();
        assert_eq!(config.database_url, "postgres://localhost/relayflow");
        assert_eq!(config.pool.workers, 16);
        assert_eq!(config.llm.model, "gpt-4o-mini");
        assert_eq!(config.nats.log_config().consumer_name, "engine-a");
        assert_eq!(config.scheduler.batch_size, 100);
    }

    #[test]
    fn database_url_is_required() {
        assert!(load(&[("RELAYFLOW__POOL__WORKERS", "4")]).is_err());
    }

    #[test]
    fn consumer_name_defaults_to_process_identity() {
        let name = NatsSection::default().log_config().consumer_name;
        assert!(name.starts_with("relayflow-engine-"));
    }
}
