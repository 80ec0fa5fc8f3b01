//! Timestamped scalar measurements tagged with a subject.
//!
//! Metrics are write-only: nothing in the pipeline reads them back to make a
//! decision. Sinks must never block or fail the caller.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// A single measurement.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Metric {
    /// Dot-separated metric name, e.g. `job.duration_ms`.
    pub name: String,
    /// Subject the measurement belongs to (document id, or job id when the job has none).
    pub subject: String,
    pub value: f64,
    pub recorded_at: DateTime<Utc>,
}

impl Metric {
    pub fn new(name: impl Into<String>, subject: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            subject: subject.into(),
            value,
            recorded_at: Utc::now(),
        }
    }
}

/// Destination for metrics.
pub trait MetricSink: Send + Sync {
    fn record(&self, metric: Metric);
}

impl<S> MetricSink for Arc<S>
where
    S: MetricSink + ?Sized,
{
    fn record(&self, metric: Metric) {
        (**self).record(metric)
    }
}

/// Emits each metric as a structured `tracing` event on the `metrics` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMetricSink;

impl MetricSink for TracingMetricSink {
    fn record(&self, metric: Metric) {
        ::tracing::info!(
            target: "metrics",
            name = %metric.name,
            subject = %metric.subject,
            value = metric.value,
            recorded_at = %metric.recorded_at.to_rfc3339(),
            "metric"
        );
    }
}

/// Collects metrics in memory (tests/dev).
#[derive(Debug, Default)]
pub struct InMemoryMetricSink {
    inner: Mutex<Vec<Metric>>,
}

impl InMemoryMetricSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> Vec<Metric> {
        self.inner.lock().map(|m| m.clone()).unwrap_or_default()
    }

    pub fn named(&self, name: &str) -> Vec<Metric> {
        self.all().into_iter().filter(|m| m.name == name).collect()
    }
}

impl MetricSink for InMemoryMetricSink {
    fn record(&self, metric: Metric) {
        // A poisoned lock only loses test bookkeeping.
        if let Ok(mut inner) = self.inner.lock() {
            inner.push(metric);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_sink_filters_by_name() {
        let sink = InMemoryMetricSink::new();
        sink.record(Metric::new("job.duration_ms", "doc1", 12.0));
        sink.record(Metric::new("job.queue_latency_ms", "doc1", 3.0));
        sink.record(Metric::new("job.duration_ms", "doc2", 40.0));

        let durations = sink.named("job.duration_ms");
        assert_eq!(durations.len(), 2);
        assert_eq!(durations[1].subject, "doc2");
    }

    #[test]
    fn shared_sink_records_through_arc() {
        let sink = Arc::new(InMemoryMetricSink::new());
        let dyn_sink: Arc<dyn MetricSink> = sink.clone();
        dyn_sink.record(Metric::new("side_effect.failed", "doc1", 1.0));
        assert_eq!(sink.all().len(), 1);
    }
}
