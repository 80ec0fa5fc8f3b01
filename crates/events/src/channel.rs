//! Status channel: subject-keyed publish/subscribe for job progress.
//!
//! The channel is the **push** half of client notification. It is deliberately weak:
//!
//! - **Best effort**: a publish reaches the subscribers that exist at that moment
//! - **No replay**: a subscriber that connects late must query job status directly
//! - **No persistence**: the job store is the source of truth, the channel only distributes
//!
//! Publishing is never allowed to fail a job. Callers log publish errors and move on.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc::{UnboundedReceiver, error::TryRecvError};
use tokio_stream::wrappers::UnboundedReceiverStream;

use docqueue_core::SubjectId;

use crate::event::StatusEvent;

/// A subscription to one subject's events.
///
/// Dropping the subscription unsubscribes; the channel prunes dead subscribers on the
/// next publish for that subject.
#[derive(Debug)]
pub struct Subscription {
    subject_id: SubjectId,
    receiver: UnboundedReceiver<StatusEvent>,
}

impl Subscription {
    pub fn new(subject_id: SubjectId, receiver: UnboundedReceiver<StatusEvent>) -> Self {
        Self {
            subject_id,
            receiver,
        }
    }

    pub fn subject_id(&self) -> &SubjectId {
        &self.subject_id
    }

    /// Wait for the next event. `None` once the channel side has gone away.
    pub async fn recv(&mut self) -> Option<StatusEvent> {
        self.receiver.recv().await
    }

    /// Take an event if one is already buffered.
    pub fn try_recv(&mut self) -> Result<StatusEvent, TryRecvError> {
        self.receiver.try_recv()
    }

    /// Convert into a `Stream` (used by the SSE endpoint).
    pub fn into_stream(self) -> UnboundedReceiverStream<StatusEvent> {
        UnboundedReceiverStream::new(self.receiver)
    }
}

/// Status channel failure.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// Internal lock poisoning.
    #[error("status channel lock poisoned")]
    Poisoned,

    /// The transport rejected the message.
    #[error("status channel transport error: {0}")]
    Transport(String),

    #[error("failed to encode status event: {0}")]
    Serialize(String),
}

/// Subject-keyed pub/sub abstraction.
///
/// Implementations must be `Send + Sync`; the worker, the sweeper and every SSE
/// connection share a single instance.
#[async_trait]
pub trait StatusChannel: Send + Sync {
    /// Deliver `event` once to every current subscriber of `event.subject_id`.
    async fn publish(&self, event: StatusEvent) -> Result<(), ChannelError>;

    /// Subscribe to future events for `subject_id`.
    fn subscribe(&self, subject_id: &SubjectId) -> Subscription;
}

#[async_trait]
impl<C> StatusChannel for Arc<C>
where
    C: StatusChannel + ?Sized,
{
    async fn publish(&self, event: StatusEvent) -> Result<(), ChannelError> {
        (**self).publish(event).await
    }

    fn subscribe(&self, subject_id: &SubjectId) -> Subscription {
        (**self).subscribe(subject_id)
    }
}
