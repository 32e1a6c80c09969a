use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;

use searchsync_infra::config::WorkerConfig;
use searchsync_infra::jobs::{JobPoller, JobProcessor, PostgresJobStore};
use searchsync_infra::projector::PostgresRecordSource;
use searchsync_infra::search::MeilisearchClient;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    searchsync_observability::init();

    let config = WorkerConfig::from_env().context("invalid worker configuration")?;

    let pool = PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .connect(&config.database_url)
        .await
        .context("failed to connect to Postgres")?;

    let store = Arc::new(PostgresJobStore::new(pool.clone()));
    store
        .ensure_schema()
        .await
        .context("failed to create job table")?;

    let search = Arc::new(
        MeilisearchClient::new(config.meili_url.clone(), config.meili_master_key.clone())
            .with_task_timeout(config.meili_task_timeout),
    );
    search
        .health()
        .await
        .with_context(|| format!("search engine at {} is not healthy", config.meili_url))?;

    let processor = Arc::new(JobProcessor::new(
        store,
        Arc::new(PostgresRecordSource::new(pool)),
        search,
        config.retry_policy(),
        config.processor_config(),
    ));
    processor
        .ensure_index()
        .await
        .with_context(|| format!("failed to configure index {}", config.index_name))?;

    let poller = JobPoller::new(processor, config.poll_interval).spawn();

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown signal received");

    let stats = poller.shutdown().await;
    tracing::info!(
        ticks = stats.ticks,
        completed = stats.jobs_completed,
        dead_lettered = stats.jobs_dead_lettered,
        "worker stopped"
    );
    Ok(())
}
