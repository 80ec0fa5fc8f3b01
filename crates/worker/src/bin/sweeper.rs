use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use docqueue_infra::bootstrap::{connect_channel, connect_postgres_store};
use docqueue_infra::jobs::{Notifier, RecoverySweeper};
use docqueue_infra::shutdown::shutdown_token;
use docqueue_infra::{PipelineConfig, TaskScheduler};
use docqueue_observability::TracingMetricSink;

const SWEEP_TASK: &str = "recovery-sweep";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    docqueue_observability::init();

    let config = PipelineConfig::from_env().context("invalid configuration")?;
    let database_url = config
        .database_url
        .as_deref()
        .context("DATABASE_URL must be set for the sweeper")?;

    let store = connect_postgres_store(database_url)
        .await
        .context("job store unreachable")?;
    let channel = connect_channel(&config).context("failed to open status channel")?;

    let sweeper = Arc::new(RecoverySweeper::new(
        store,
        Notifier::new(channel, Arc::new(TracingMetricSink)),
        config.sweeper.clone(),
    ));

    let shutdown = shutdown_token();
    let scheduler = TaskScheduler::with_parent(&shutdown);
    scheduler.spawn_periodic(SWEEP_TASK, config.sweeper.interval, move || {
        let sweeper = sweeper.clone();
        async move {
            sweeper.run_once(Utc::now()).await;
        }
    });

    shutdown.cancelled().await;
    scheduler.shutdown().await;
    tracing::info!("sweeper stopped");
    Ok(())
}
