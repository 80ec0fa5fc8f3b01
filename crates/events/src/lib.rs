//! Status events and the subject-keyed status channel.
//!
//! - `event`: the immutable notification pushed to clients
//! - `status`: the status query shapes clients fall back to
//! - `channel`: the pub/sub abstraction
//! - `in_memory_channel`: single-process implementation

pub mod channel;
pub mod event;
pub mod in_memory_channel;
pub mod status;

pub use channel::{ChannelError, StatusChannel, Subscription};
pub use event::{StatusEvent, StatusEventKind};
pub use in_memory_channel::InMemoryStatusChannel;
pub use status::{JobStatusView, SubjectStatus};
