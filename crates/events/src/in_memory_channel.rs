//! In-process status channel (single-process deployments and tests).

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc::{self, UnboundedSender};

use docqueue_core::SubjectId;

use crate::channel::{ChannelError, StatusChannel, Subscription};
use crate::event::StatusEvent;

/// In-memory subject-keyed pub/sub.
///
/// - Fan-out per subject, no IO
/// - Dead subscribers are dropped while publishing and on every new subscription
#[derive(Debug, Default)]
pub struct InMemoryStatusChannel {
    subscribers: Mutex<HashMap<SubjectId, Vec<UnboundedSender<StatusEvent>>>>,
}

impl InMemoryStatusChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live subscribers for a subject.
    pub fn subscriber_count(&self, subject_id: &SubjectId) -> usize {
        self.subscribers
            .lock()
            .map(|subs| {
                subs.get(subject_id)
                    .map(|txs| txs.iter().filter(|tx| !tx.is_closed()).count())
                    .unwrap_or(0)
            })
            .unwrap_or(0)
    }

    #[cfg(test)]
    fn held_senders(&self) -> usize {
        self.subscribers
            .lock()
            .map(|subs| subs.values().map(Vec::len).sum())
            .unwrap_or(0)
    }
}

#[async_trait]
impl StatusChannel for InMemoryStatusChannel {
    async fn publish(&self, event: StatusEvent) -> Result<(), ChannelError> {
        let mut subs = self.subscribers.lock().map_err(|_| ChannelError::Poisoned)?;

        if let Some(txs) = subs.get_mut(&event.subject_id) {
            txs.retain(|tx| tx.send(event.clone()).is_ok());
            if txs.is_empty() {
                subs.remove(&event.subject_id);
            }
        }

        Ok(())
    }

    fn subscribe(&self, subject_id: &SubjectId) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();

        // A poisoned lock still yields a subscription; it just never receives.
        if let Ok(mut subs) = self.subscribers.lock() {
            // Subjects that never see an event would otherwise keep every closed sender.
            subs.retain(|_, txs| {
                txs.retain(|tx| !tx.is_closed());
                !txs.is_empty()
            });
            subs.entry(subject_id.clone()).or_default().push(tx);
        }

        Subscription::new(subject_id.clone(), rx)
    }
}
