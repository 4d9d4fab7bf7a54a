//! relayflow engine process.
//!
//! Runs the trigger ingestor, the executor pool and the scheduler against
//! shared Postgres and NATS. Any number of engine processes may run side by
//! side; they coordinate only through conditional writes and the shared
//! consumer group.

mod config;
mod db;

use config::EngineConfig;
use db::{PgDefinitionStore, PgMessageLookup, PgRunStore};
use relayflow_ai::{LlmBackend, LlmBackendConfig, OpenAiCompatibleBackend};
use relayflow_ingest::{
    NatsEventLog, NatsOutboundPublisher, NatsTriggerPublisher, StoreRateLimiter, TriggerIngestor,
};
use relayflow_nodes::{NodeServices, builtin_registry};
use relayflow_scheduler::{
    CronTriggerEvaluator, ResumptionPoller, RunRecovery, Scheduler, SchedulerConfig,
};
use relayflow_workflow::{
    DefinitionStore, ExecutorConfig, ExecutorPool, PoolConfig, RunExecutor, RunStore,
    RunSubmitter,
};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,relayflow=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration from environment
    let config = EngineConfig::from_env().expect("failed to load configuration");
    tracing::info!("Loaded configuration");

    // Create database connection pool
    let db_pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.database_url)
        .await
        .expect("failed to connect to database");

    // Run migrations
    tracing::info!("Running database migrations...");
    sqlx::migrate!("./migrations")
        .run(&db_pool)
        .await
        .expect("failed to run migrations");

    let runs: Arc<dyn RunStore> = Arc::new(PgRunStore::new(db_pool.clone()));
    let definitions: Arc<dyn DefinitionStore> = Arc::new(PgDefinitionStore::new(db_pool.clone()));

    // Connect to the event logs
    let log_config = config.nats.log_config();
    let jetstream = relayflow_ingest::nats::connect(&log_config)
        .await
        .expect("failed to connect to NATS");
    let event_log = NatsEventLog::new(&jetstream, &log_config)
        .await
        .expect("failed to set up trigger consumer");
    let trigger_publisher = NatsTriggerPublisher::new(jetstream.clone(), log_config.clone())
        .await
        .expect("failed to set up trigger publisher");
    let outbound = NatsOutboundPublisher::new(jetstream, &log_config)
        .await
        .expect("failed to set up outbound publisher");

    // Build the node registry
    let llm: Arc<dyn LlmBackend> = Arc::new(
        OpenAiCompatibleBackend::new(&LlmBackendConfig::from(&config.llm))
            .expect("invalid LLM configuration"),
    );
    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .expect("failed to build HTTP client");
    let services = NodeServices {
        llm,
        http,
        outbound: Arc::new(outbound),
    };
    let registry = Arc::new(builtin_registry(&services));
    tracing::info!(kinds = registry.kinds().len(), "Registered node kinds");

    // Start the executor pool
    let executor = Arc::new(
        RunExecutor::new(registry, Arc::clone(&runs), Arc::clone(&definitions))
            .with_config(ExecutorConfig::from(&config.executor)),
    );
    let pool = Arc::new(ExecutorPool::start(executor, PoolConfig::from(&config.pool)));
    let submitter: Arc<dyn RunSubmitter> = pool.clone();

    let (stop, shutdown) = watch::channel(false);

    // Spawn the trigger ingestor
    let ingestor = TriggerIngestor::new(
        Arc::new(event_log),
        Arc::clone(&definitions),
        Arc::clone(&runs),
        Arc::new(PgMessageLookup::new(db_pool.clone())),
        Arc::new(StoreRateLimiter::new(
            config.ingest.rate_limit(),
            Arc::clone(&runs),
        )),
        Arc::clone(&submitter),
    )
    .with_config(config.ingest.ingest_config());
    let ingest_task = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { ingestor.run(shutdown).await })
    };

    // Spawn the scheduler
    let scheduler_config = SchedulerConfig::from(&config.scheduler);
    let window = |d: Duration| {
        chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(1))
    };
    let scheduler = Scheduler::new(
        ResumptionPoller::new(
            Arc::clone(&runs),
            Arc::clone(&submitter),
            scheduler_config.batch_size,
        ),
        RunRecovery::new(
            Arc::clone(&runs),
            submitter,
            window(scheduler_config.pending_grace),
            window(scheduler_config.running_lease),
            scheduler_config.batch_size,
        ),
        CronTriggerEvaluator::new(definitions, Arc::new(trigger_publisher)),
        scheduler_config.poll_interval,
    );
    let scheduler_task = tokio::spawn(async move { scheduler.run(shutdown).await });

    tracing::info!(consumer = %log_config.consumer_name, "engine running");

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
    }
    tracing::info!("Shutting down...");

    let _ = stop.send(true);
    for (name, task) in [("ingestor", ingest_task), ("scheduler", scheduler_task)] {
        if let Err(e) = task.await {
            tracing::error!(task = name, error = %e, "task panicked");
        }
    }
    pool.shutdown().await;
    db_pool.close().await;
    tracing::info!("engine stopped");
}
