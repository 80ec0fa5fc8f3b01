use std::sync::Arc;

use anyhow::Context;
use docqueue_infra::PipelineConfig;
use docqueue_infra::shutdown::shutdown_signal;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    docqueue_observability::init();

    let config = PipelineConfig::from_env().context("invalid configuration")?;
    let services = docqueue_api::app::services::build_services(&config)
        .await
        .context("failed to initialise services")?;

    let app = docqueue_api::app::build_app(Arc::new(services));

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;

    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    tracing::info!("api stopped");
    Ok(())
}
