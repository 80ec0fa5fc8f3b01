//! Named, cancellable periodic tasks.
//!
//! Every background timer in the system (sweeps, pruning) is registered here under a
//! name so it can be listed, cancelled, replaced and shut down as a group.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

struct ScheduledTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

#[derive(Default)]
pub struct TaskScheduler {
    root: CancellationToken,
    tasks: Mutex<HashMap<String, ScheduledTask>>,
}

impl std::fmt::Debug for TaskScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskScheduler")
            .field("tasks", &self.names())
            .finish()
    }
}

impl TaskScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scheduler whose tasks also stop when `parent` is cancelled.
    pub fn with_parent(parent: &CancellationToken) -> Self {
        Self {
            root: parent.child_token(),
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Run `task` immediately and then every `period` until cancelled.
    ///
    /// A run that overlaps the next tick delays it; missed ticks are skipped. Registering
    /// a name that is already taken cancels the previous task.
    pub fn spawn_periodic<F, Fut>(&self, name: impl Into<String>, period: Duration, mut task: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let cancel = self.root.child_token();
        let token = cancel.clone();
        let task_name = name.clone();

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(task = %task_name, period_ms = period.as_millis() as u64, "periodic task started");

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        debug!(task = %task_name, "periodic task tick");
                        task().await;
                    }
                }
            }

            info!(task = %task_name, "periodic task stopped");
        });

        let previous = match self.tasks.lock() {
            Ok(mut tasks) => tasks.insert(name.clone(), ScheduledTask { cancel, handle }),
            Err(_) => {
                warn!(task = %name, "scheduler lock poisoned, task not tracked");
                None
            }
        };
        if let Some(previous) = previous {
            debug!(task = %name, "replacing periodic task");
            previous.cancel.cancel();
        }
    }

    /// Cancel a task by name. Returns whether it existed.
    pub fn cancel(&self, name: &str) -> bool {
        let removed = self.tasks.lock().ok().and_then(|mut tasks| tasks.remove(name));
        match removed {
            Some(task) => {
                task.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Names of the registered tasks, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .tasks
            .lock()
            .map(|tasks| tasks.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    /// Cancel every task and wait for all of them to stop.
    pub async fn shutdown(&self) {
        self.root.cancel();
        let tasks: Vec<(String, ScheduledTask)> = self
            .tasks
            .lock()
            .map(|mut tasks| tasks.drain().collect())
            .unwrap_or_default();

        for (name, task) in tasks {
            if let Err(e) = task.handle.await {
                warn!(task = %name, error = %e, "periodic task ended abnormally");
            }
        }
    }
}
