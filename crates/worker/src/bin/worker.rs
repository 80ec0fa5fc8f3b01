use std::sync::Arc;

use anyhow::Context;
use docqueue_core::WorkerId;
use docqueue_infra::PipelineConfig;
use docqueue_infra::bootstrap::{connect_channel, connect_postgres_store};
use docqueue_infra::jobs::{JobType, JobWorker, Notifier};
use docqueue_infra::shutdown::shutdown_token;
use docqueue_observability::TracingMetricSink;
use docqueue_worker::http::DEFAULT_REQUEST_TIMEOUT;
use docqueue_worker::{
    DocumentServices, HttpContentGenerator, HttpPageExtractor, PostgresContentSink, registry,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    docqueue_observability::init();

    let config = PipelineConfig::from_env().context("invalid configuration")?;
    let database_url = config
        .database_url
        .as_deref()
        .context("DATABASE_URL must be set for the worker")?;
    let extractor_url = config
        .extractor_url
        .as_deref()
        .context("EXTRACTOR_URL must be set for the worker")?;
    let generator_url = config
        .generator_url
        .as_deref()
        .context("GENERATOR_URL must be set for the worker")?;

    let store = connect_postgres_store(database_url)
        .await
        .context("job store unreachable")?;
    let sink = PostgresContentSink::new(store.pool().clone());
    sink.migrate().await.context("failed to bootstrap content tables")?;
    let channel = connect_channel(&config).context("failed to open status channel")?;

    // A single request never outlives the handler timeout of its job type.
    let extractor = HttpPageExtractor::new(
        extractor_url,
        DEFAULT_REQUEST_TIMEOUT.min(config.worker.timeout_for(JobType::ExtractPage)),
    )?;
    let generator = HttpContentGenerator::new(
        generator_url,
        DEFAULT_REQUEST_TIMEOUT.min(config.worker.timeout_for(JobType::GenerateAi)),
    )?;
    let services = DocumentServices::new(Arc::new(extractor), Arc::new(generator), Arc::new(sink));

    let worker = JobWorker::new(
        store,
        registry(services),
        Notifier::new(channel, Arc::new(TracingMetricSink)),
        config
            .worker
            .clone()
            .with_name(format!("worker-{}", WorkerId::new())),
    );

    worker.run(shutdown_token()).await;
    Ok(())
}
