//! Best-effort notification helpers shared by the worker and the sweeper.

use std::sync::Arc;

use tracing::warn;

use docqueue_events::{StatusChannel, StatusEvent};
use docqueue_observability::{Metric, MetricSink};

pub const METRIC_QUEUE_LATENCY_MS: &str = "job.queue_latency_ms";
pub const METRIC_DURATION_MS: &str = "job.duration_ms";
pub const METRIC_SIDE_EFFECT_FAILED: &str = "side_effect.failed";

/// Publishes status events and records metrics without ever failing the caller.
#[derive(Clone)]
pub struct Notifier {
    channel: Arc<dyn StatusChannel>,
    metrics: Arc<dyn MetricSink>,
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier").finish_non_exhaustive()
    }
}

impl Notifier {
    pub fn new(channel: Arc<dyn StatusChannel>, metrics: Arc<dyn MetricSink>) -> Self {
        Self { channel, metrics }
    }

    pub fn channel(&self) -> &Arc<dyn StatusChannel> {
        &self.channel
    }

    pub async fn publish(&self, event: StatusEvent) {
        let subject_id = event.subject_id.clone();
        let job_id = event.job_id;
        if let Err(e) = self.channel.publish(event).await {
            warn!(subject_id = %subject_id, job_id = %job_id, error = %e, "status publish failed");
        }
    }

    pub fn record(&self, name: &str, subject: impl Into<String>, value: f64) {
        self.metrics.record(Metric::new(name, subject, value));
    }
}
