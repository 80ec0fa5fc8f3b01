//! Adaptive status poller.
//!
//! The poller is the fallback half of status following: it only fetches while the
//! realtime transport is disconnected and the host view is visible. Successive
//! failures stretch the interval exponentially up to a cap, and every delay is
//! jittered so that many clients do not poll in lockstep.

use std::str::FromStr;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use docqueue_core::SubjectId;
use docqueue_events::SubjectStatus;

use crate::source::StatusSource;

/// Random spread applied to each poll delay, as a fraction of the delay.
///
/// A fraction is drawn uniformly from `min..=max` and then added or subtracted
/// with equal probability.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Jitter {
    pub min: f64,
    pub max: f64,
}

impl Jitter {
    pub const NONE: Jitter = Jitter { min: 0.0, max: 0.0 };

    pub fn apply<R: Rng + ?Sized>(&self, delay: Duration, rng: &mut R) -> Duration {
        if self.max <= 0.0 || delay.is_zero() {
            return delay;
        }
        let fraction = if self.max > self.min {
            rng.random_range(self.min..=self.max)
        } else {
            self.max
        };
        let factor = if rng.random_bool(0.5) {
            1.0 + fraction
        } else {
            1.0 - fraction
        };
        delay.mul_f64(factor.max(0.0))
    }
}

impl Default for Jitter {
    fn default() -> Self {
        Self {
            min: 0.15,
            max: 0.30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PollerConfigError {
    #[error("{key} has an invalid value {value:?}")]
    InvalidValue { key: String, value: String },
    #[error("{0}")]
    Inconsistent(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PollerConfig {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub backoff_multiplier: f64,
    pub jitter: Jitter,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(3),
            max_interval: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: Jitter::default(),
        }
    }
}

impl PollerConfig {
    /// `POLL_INITIAL_INTERVAL_MS`, `POLL_MAX_INTERVAL_MS`, `POLL_BACKOFF_MULTIPLIER`.
    pub fn from_env() -> Result<Self, PollerConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, PollerConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let config = Self {
            initial_interval: Duration::from_millis(parse_or(
                &lookup,
                "POLL_INITIAL_INTERVAL_MS",
                defaults.initial_interval.as_millis() as u64,
            )?),
            max_interval: Duration::from_millis(parse_or(
                &lookup,
                "POLL_MAX_INTERVAL_MS",
                defaults.max_interval.as_millis() as u64,
            )?),
            backoff_multiplier: parse_or(
                &lookup,
                "POLL_BACKOFF_MULTIPLIER",
                defaults.backoff_multiplier,
            )?,
            jitter: defaults.jitter,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), PollerConfigError> {
        if self.initial_interval.is_zero() || self.initial_interval > self.max_interval {
            return Err(PollerConfigError::Inconsistent(format!(
                "poll initial interval ({:?}) must be non-zero and not exceed the max interval ({:?})",
                self.initial_interval, self.max_interval
            )));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(PollerConfigError::Inconsistent(format!(
                "poll backoff multiplier must be at least 1.0, got {}",
                self.backoff_multiplier
            )));
        }
        Ok(())
    }

    /// Un-jittered delay after `consecutive_errors` failed fetches in a row.
    pub fn base_delay(&self, consecutive_errors: u32) -> Duration {
        let exponent = i32::try_from(consecutive_errors).unwrap_or(i32::MAX);
        let factor = self.backoff_multiplier.powi(exponent);
        let millis = self.initial_interval.as_millis() as f64 * factor;
        let cap = self.max_interval.as_millis() as f64;
        if !millis.is_finite() || millis >= cap {
            self.max_interval
        } else {
            Duration::from_millis(millis as u64)
        }
    }

    pub fn next_delay(&self, consecutive_errors: u32) -> Duration {
        self.jitter
            .apply(self.base_delay(consecutive_errors), &mut rand::rng())
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T, PollerConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty()) {
        None => Ok(default),
        Some(value) => value
            .parse()
            .map_err(|_| PollerConfigError::InvalidValue {
                key: key.to_string(),
                value,
            }),
    }
}

/// Why a poller stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerExit {
    /// Every job of the subject reached a terminal state.
    Settled,
    Cancelled,
    /// The status receiver was dropped.
    ConsumerGone,
}

/// Fallback poller for one subject.
pub struct AdaptivePoller<S> {
    source: S,
    subject_id: SubjectId,
    config: PollerConfig,
    realtime: watch::Receiver<bool>,
    realtime_open: bool,
    visible: watch::Receiver<bool>,
    visible_open: bool,
}

impl<S> AdaptivePoller<S>
where
    S: StatusSource + 'static,
{
    /// `realtime_connected` reports whether push delivery is currently live.
    pub fn new(
        source: S,
        subject_id: SubjectId,
        config: PollerConfig,
        realtime_connected: watch::Receiver<bool>,
    ) -> Self {
        // Without a visibility signal the view counts as always visible.
        let (_, visible) = watch::channel(true);
        Self {
            source,
            subject_id,
            config,
            realtime: realtime_connected,
            realtime_open: true,
            visible,
            visible_open: false,
        }
    }

    pub fn with_visibility(mut self, visible: watch::Receiver<bool>) -> Self {
        self.visible = visible;
        self.visible_open = true;
        self
    }

    pub fn subject_id(&self) -> &SubjectId {
        &self.subject_id
    }

    /// Run on a task; statuses arrive on the returned receiver.
    pub fn spawn(
        self,
        buffer: usize,
        shutdown: CancellationToken,
    ) -> (mpsc::Receiver<SubjectStatus>, JoinHandle<PollerExit>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let handle = tokio::spawn(self.run(tx, shutdown));
        (rx, handle)
    }

    pub async fn run(
        mut self,
        updates: mpsc::Sender<SubjectStatus>,
        shutdown: CancellationToken,
    ) -> PollerExit {
        info!(subject_id = %self.subject_id, "status poller started");
        let mut consecutive_errors: u32 = 0;
        let mut fetch_now = true;

        let exit = loop {
            if self.is_dormant() {
                debug!(subject_id = %self.subject_id, "status poller dormant");
                if !self.wait_until_active(&shutdown).await {
                    break PollerExit::Cancelled;
                }
                debug!(subject_id = %self.subject_id, "status poller resumed");
                fetch_now = true;
            }

            if !fetch_now {
                let delay = self.config.next_delay(consecutive_errors);
                tokio::select! {
                    _ = shutdown.cancelled() => break PollerExit::Cancelled,
                    _ = tokio::time::sleep(delay) => {}
                    res = self.realtime.changed(), if self.realtime_open => {
                        self.realtime_open = res.is_ok();
                        continue;
                    }
                    res = self.visible.changed(), if self.visible_open => {
                        self.visible_open = res.is_ok();
                        continue;
                    }
                }
            }
            fetch_now = false;

            // Push may have connected while we slept.
            if self.is_dormant() {
                continue;
            }

            match self.source.fetch(&self.subject_id).await {
                Ok(status) => {
                    consecutive_errors = 0;
                    let settled = status.is_settled();
                    if updates.send(status).await.is_err() {
                        break PollerExit::ConsumerGone;
                    }
                    if settled {
                        break PollerExit::Settled;
                    }
                }
                Err(e) => {
                    consecutive_errors = consecutive_errors.saturating_add(1);
                    warn!(
                        subject_id = %self.subject_id,
                        consecutive_errors,
                        error = %e,
                        "status poll failed"
                    );
                }
            }
        };

        info!(subject_id = %self.subject_id, exit = ?exit, "status poller stopped");
        exit
    }

    fn is_dormant(&mut self) -> bool {
        let connected = *self.realtime.borrow_and_update();
        let visible = *self.visible.borrow_and_update();
        connected || !visible
    }

    /// Returns `false` if cancelled while waiting.
    async fn wait_until_active(&mut self, shutdown: &CancellationToken) -> bool {
        while self.is_dormant() {
            tokio::select! {
                _ = shutdown.cancelled() => return false,
                res = self.realtime.changed(), if self.realtime_open => {
                    self.realtime_open = res.is_ok();
                }
                res = self.visible.changed(), if self.visible_open => {
                    self.visible_open = res.is_ok();
                }
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, VecDeque};
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use docqueue_core::{JobId, JobState};
    use docqueue_events::JobStatusView;
    use tokio::time::Instant;

    use super::*;
    use crate::source::SourceError;

    /// Replays scripted results and records when each fetch happened.
    struct ScriptedSource {
        script: Mutex<VecDeque<Result<JobState, SourceError>>>,
        fetches: Mutex<Vec<Instant>>,
    }

    impl ScriptedSource {
        fn new(script: Vec<Result<JobState, SourceError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                fetches: Mutex::new(Vec::new()),
            })
        }

        fn fetch_count(&self) -> usize {
            self.fetches.lock().unwrap().len()
        }

        fn gaps(&self) -> Vec<Duration> {
            let fetches = self.fetches.lock().unwrap();
            fetches.windows(2).map(|w| w[1] - w[0]).collect()
        }
    }

    #[async_trait]
    impl StatusSource for ScriptedSource {
        async fn fetch(&self, subject_id: &SubjectId) -> Result<SubjectStatus, SourceError> {
            self.fetches.lock().unwrap().push(Instant::now());
            let next = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(JobState::Processing));
            next.map(|state| SubjectStatus {
                subject_id: subject_id.clone(),
                jobs: vec![JobStatusView {
                    job_id: JobId::new(),
                    state,
                    attempts: 1,
                    max_attempts: 3,
                    error: None,
                    completed_at: None,
                }],
            })
        }
    }

    fn unavailable() -> Result<JobState, SourceError> {
        Err(SourceError::Api(503, "unavailable".to_string()))
    }

    fn config() -> PollerConfig {
        PollerConfig {
            jitter: Jitter::NONE,
            ..PollerConfig::default()
        }
    }

    fn poller(
        source: &Arc<ScriptedSource>,
        realtime: watch::Receiver<bool>,
    ) -> AdaptivePoller<Arc<ScriptedSource>> {
        AdaptivePoller::new(
            source.clone(),
            SubjectId::parse("doc1").unwrap(),
            config(),
            realtime,
        )
    }

    #[test]
    fn base_delay_grows_and_caps() {
        let config = config();
        let delays: Vec<u64> = (0..7).map(|n| config.base_delay(n).as_millis() as u64).collect();
        assert_eq!(delays, vec![3000, 6000, 12_000, 24_000, 30_000, 30_000, 30_000]);
        assert_eq!(config.base_delay(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn jitter_stays_within_band() {
        let jitter = Jitter::default();
        let base = Duration::from_millis(10_000);
        let mut rng = rand::rng();
        for _ in 0..500 {
            let ms = jitter.apply(base, &mut rng).as_millis() as u64;
            let below = (7_000..=8_500).contains(&ms);
            let above = (11_500..=13_000).contains(&ms);
            assert!(below || above, "jittered delay {ms}ms outside band");
        }
    }

    #[test]
    fn no_jitter_is_identity() {
        let base = Duration::from_millis(1234);
        assert_eq!(Jitter::NONE.apply(base, &mut rand::rng()), base);
    }

    #[test]
    fn config_from_lookup() {
        let vars: HashMap<&str, &str> = [
            ("POLL_INITIAL_INTERVAL_MS", "500"),
            ("POLL_MAX_INTERVAL_MS", "8000"),
            ("POLL_BACKOFF_MULTIPLIER", "1.5"),
        ]
        .into_iter()
        .collect();
        let config =
            PollerConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap();

        assert_eq!(config.initial_interval, Duration::from_millis(500));
        assert_eq!(config.max_interval, Duration::from_secs(8));
        assert_eq!(config.backoff_multiplier, 1.5);

        assert_eq!(PollerConfig::from_lookup(|_| None).unwrap(), PollerConfig::default());
    }

    #[test]
    fn config_rejects_bad_values() {
        let err = PollerConfig::from_lookup(|k| {
            (k == "POLL_BACKOFF_MULTIPLIER").then(|| "fast".to_string())
        })
        .unwrap_err();
        assert!(matches!(err, PollerConfigError::InvalidValue { .. }));

        let err = PollerConfig::from_lookup(|k| {
            (k == "POLL_INITIAL_INTERVAL_MS").then(|| "60000".to_string())
        })
        .unwrap_err();
        assert!(matches!(err, PollerConfigError::Inconsistent(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_grows_on_errors_and_resets_on_success() {
        let source = ScriptedSource::new(vec![
            unavailable(),
            unavailable(),
            unavailable(),
            unavailable(),
            unavailable(),
            Ok(JobState::Processing),
            Ok(JobState::Processing),
            Ok(JobState::Completed),
        ]);
        let (_realtime_tx, realtime_rx) = watch::channel(false);
        let (mut rx, handle) = poller(&source, realtime_rx).spawn(8, CancellationToken::new());

        let exit = handle.await.unwrap();
        assert_eq!(exit, PollerExit::Settled);

        let secs: Vec<u64> = source.gaps().iter().map(|d| d.as_secs()).collect();
        assert_eq!(secs, vec![6, 12, 24, 30, 30, 3, 3]);

        let mut delivered = Vec::new();
        while let Ok(status) = rx.try_recv() {
            delivered.push(status);
        }
        assert_eq!(delivered.len(), 3);
        assert!(delivered.last().unwrap().is_settled());
    }

    #[tokio::test(start_paused = true)]
    async fn connected_realtime_means_zero_fetches() {
        let source = ScriptedSource::new(vec![]);
        let (realtime_tx, realtime_rx) = watch::channel(true);
        let shutdown = CancellationToken::new();
        let (_rx, handle) = poller(&source, realtime_rx).spawn(64, shutdown.clone());

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(source.fetch_count(), 0);

        // Disconnect: polling resumes within one tick.
        realtime_tx.send(false).unwrap();
        tokio::time::sleep(config().initial_interval).await;
        assert!(source.fetch_count() >= 1);

        // Reconnect mid-cycle: no further fetches.
        realtime_tx.send(true).unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
        let frozen = source.fetch_count();
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(source.fetch_count(), frozen);

        shutdown.cancel();
        assert_eq!(handle.await.unwrap(), PollerExit::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn hidden_view_suspends_and_visibility_resumes_immediately() {
        let source = ScriptedSource::new(vec![]);
        let (_realtime_tx, realtime_rx) = watch::channel(false);
        let (visible_tx, visible_rx) = watch::channel(false);
        let shutdown = CancellationToken::new();
        let (_rx, handle) = poller(&source, realtime_rx)
            .with_visibility(visible_rx)
            .spawn(64, shutdown.clone());

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(source.fetch_count(), 0);

        let shown_at = Instant::now();
        visible_tx.send(true).unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(source.fetch_count(), 1);
        assert!(source.fetches.lock().unwrap()[0] - shown_at < Duration::from_millis(1));

        shutdown.cancel();
        assert_eq!(handle.await.unwrap(), PollerExit::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn stops_when_consumer_is_dropped() {
        let source = ScriptedSource::new(vec![]);
        let (_realtime_tx, realtime_rx) = watch::channel(false);
        let (rx, handle) = poller(&source, realtime_rx).spawn(1, CancellationToken::new());
        drop(rx);

        assert_eq!(handle.await.unwrap(), PollerExit::ConsumerGone);
        assert_eq!(source.fetch_count(), 1);
    }
}
