//! Store and channel selection from configuration.

use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};

use docqueue_events::{ChannelError, InMemoryStatusChannel, StatusChannel};

use crate::config::PipelineConfig;
use crate::jobs::{InMemoryJobStore, JobStore, JobStoreError, PostgresJobStore};

const MAX_DB_CONNECTIONS: u32 = 10;

/// Connect to Postgres and bootstrap the `jobs` schema.
pub async fn connect_postgres_store(database_url: &str) -> Result<PostgresJobStore, JobStoreError> {
    let pool = PgPoolOptions::new()
        .max_connections(MAX_DB_CONNECTIONS)
        .connect(database_url)
        .await
        .map_err(|e| JobStoreError::Storage(format!("failed to connect to database: {e}")))?;

    let store = PostgresJobStore::new(pool);
    store.migrate().await?;
    info!("connected to postgres job store");
    Ok(store)
}

/// Postgres when `DATABASE_URL` is set, otherwise in-memory.
pub async fn connect_store(config: &PipelineConfig) -> Result<Arc<dyn JobStore>, JobStoreError> {
    match config.database_url.as_deref() {
        Some(url) => Ok(Arc::new(connect_postgres_store(url).await?)),
        None => {
            warn!("DATABASE_URL not set; using in-memory job store");
            Ok(InMemoryJobStore::arc())
        }
    }
}

/// Redis pub/sub when `REDIS_URL` is set and the `redis` feature is enabled, otherwise
/// in-process.
pub fn connect_channel(config: &PipelineConfig) -> Result<Arc<dyn StatusChannel>, ChannelError> {
    match config.redis_url.as_deref() {
        #[cfg(feature = "redis")]
        Some(url) => {
            let channel = crate::status_channel::RedisStatusChannel::new(url)?;
            info!("using redis status channel");
            Ok(Arc::new(channel))
        }
        #[cfg(not(feature = "redis"))]
        Some(_) => {
            warn!("REDIS_URL set but redis support is not compiled in; using in-process status channel");
            Ok(Arc::new(InMemoryStatusChannel::new()))
        }
        None => Ok(Arc::new(InMemoryStatusChannel::new())),
    }
}
