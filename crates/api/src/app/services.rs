use std::sync::Arc;

use docqueue_events::{InMemoryStatusChannel, StatusChannel};
use docqueue_infra::PipelineConfig;
use docqueue_infra::bootstrap::{connect_channel, connect_store};
use docqueue_infra::jobs::{Enqueuer, InMemoryJobStore, JobStore};

/// Most recent jobs returned by a subject status query.
pub const SUBJECT_STATUS_LIMIT: usize = 100;

/// Shared handler state.
pub struct AppServices {
    pub enqueuer: Enqueuer<Arc<dyn JobStore>>,
    pub channel: Arc<dyn StatusChannel>,
}

impl AppServices {
    pub fn new(store: Arc<dyn JobStore>, channel: Arc<dyn StatusChannel>) -> Self {
        Self {
            enqueuer: Enqueuer::new(store),
            channel,
        }
    }

    /// Fully in-process services (tests/dev).
    pub fn in_memory() -> Self {
        Self::new(InMemoryJobStore::arc(), Arc::new(InMemoryStatusChannel::new()))
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        self.enqueuer.store()
    }
}

/// Build services from configuration (Postgres/Redis when configured).
pub async fn build_services(config: &PipelineConfig) -> anyhow::Result<AppServices> {
    let store = connect_store(config).await?;
    let channel = connect_channel(config)?;
    Ok(AppServices::new(store, channel))
}
