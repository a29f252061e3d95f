//! `engagement-worker`: consumes the student-engagement topic and applies
//! every event to `PostgreSQL`.
//!
//! # Configuration
//!
//! Environment variables (or a `.env` file), see [`config::Config`]. The most
//! common ones:
//!
//! - `KAFKA_BROKERS`: broker list (default `localhost:9092`)
//! - `DATABASE_URL`: `PostgreSQL` connection URL
//! - `METRICS_ADDR`: serve Prometheus metrics on this address
//! - `RUST_LOG`: log filter (default `engagement=info`)
//! - `LOG_FORMAT=json`: JSON log lines
//!
//! # Exit codes
//!
//! `0` after a signal-triggered shutdown, `1` when startup fails or the
//! consumer loop stops on its own.

mod config;

use anyhow::Context;
use config::{Config, LogFormat};
use engagement_core::environment::{Clock, SystemClock};
use engagement_core::event_bus::EventPublisher;
use engagement_core::store::StoreError;
use engagement_postgres::{DeadLetterQueue, PostgresEngagementStore};
use engagement_redpanda::{JobDispatch, RedpandaConsumer, RedpandaPublisher};
use engagement_runtime::metrics::MetricsServer;
use engagement_runtime::retry::{RetryPolicy, retry_transient};
use engagement_runtime::{
    Collaborators, ConsumerRuntime, EngagementHandlers, EventDispatcher, shutdown_channel,
    wait_for_signal,
};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// How long buffered job messages get to reach the broker on shutdown.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            init_tracing(LogFormat::default());
            tracing::error!(error = %e, "Invalid configuration");
            return ExitCode::FAILURE;
        }
    };
    init_tracing(config.observability.log_format);

    match run(config).await {
        Ok(()) => {
            tracing::info!("Worker stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "Worker failed");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| "engagement=info".into());
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(fmt::layer().with_target(false)).init(),
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    tracing::info!(
        brokers = %config.kafka.brokers,
        topic = %config.kafka.topic,
        group = %config.kafka.consumer_group,
        "Starting engagement worker"
    );

    if let Some(addr) = config.observability.metrics_addr {
        MetricsServer::new(addr)
            .start()
            .context("Failed to start metrics exporter")?;
    }

    let store = Arc::new(connect_store(&config).await?);

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let publisher: Arc<dyn EventPublisher> = Arc::new(
        RedpandaPublisher::builder()
            .brokers(&config.kafka.brokers)
            .delivery_mode(config.delivery_mode())
            .build()
            .context("Failed to create producer")?,
    );
    let jobs = Arc::new(
        JobDispatch::new(Arc::clone(&publisher), Arc::clone(&clock)).with_topics(
            &config.kafka.certificate_topic,
            &config.kafka.reminder_topic,
        ),
    );

    let handlers = EngagementHandlers::new(
        Collaborators::from_store(&store, jobs.clone(), jobs),
        Arc::clone(&clock),
    );
    let mut dispatcher =
        EventDispatcher::new(handlers, Arc::clone(&clock)).with_retry_policy(config.retry_policy());
    if config.handler.dead_letter_enabled {
        dispatcher =
            dispatcher.with_dead_letter_sink(Arc::new(DeadLetterQueue::new(store.pool().clone())));
    }

    let (source, rebalances) = RedpandaConsumer::open(config.consumer_config())
        .await
        .context("Failed to subscribe to the engagement topic")?;

    let (trigger, shutdown) = shutdown_channel();
    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::info!("Shutting down");
        trigger.trigger();
    });

    let mut runtime = ConsumerRuntime::new(source, rebalances, Arc::new(dispatcher), shutdown)
        .with_poll_timeout(config.poll_timeout());
    let result = runtime.run().await;

    if let Err(e) = publisher.flush(FLUSH_TIMEOUT) {
        tracing::warn!(error = %e, "Producer flush incomplete");
    }

    let stats = result.context("Consumer loop stopped")?;
    tracing::info!(
        processed = stats.processed,
        dropped = stats.dropped,
        failed = stats.failed,
        dead_lettered = stats.dead_lettered,
        transport_errors = stats.transport_errors,
        rebalances = stats.rebalances,
        "Consumer stopped"
    );
    Ok(())
}

/// Connect to `PostgreSQL`, retrying while it is unreachable, and migrate.
async fn connect_store(config: &Config) -> anyhow::Result<PostgresEngagementStore> {
    let policy = RetryPolicy::builder()
        .max_retries(5)
        .initial_delay(Duration::from_millis(500))
        .build();
    let database = &config.database;

    let store = retry_transient(&policy, StoreError::is_transient, || {
        PostgresEngagementStore::connect(&database.url, database.max_connections)
    })
    .await
    .result
    .context("Failed to connect to PostgreSQL")?;

    if database.run_migrations {
        store.migrate().await.context("Failed to run migrations")?;
        tracing::info!("Migrations applied");
    }

    Ok(store)
}
