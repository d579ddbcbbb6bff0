//! Weft Client
//!
//! Live playback on top of the protocol core: a segment download scheduler
//! that predicts segment availability and streams bodies into per-stream
//! segment queues, and a session that drives adaptive buffer control
//! against the player.

pub mod error;
pub mod scheduler;
pub mod session;
pub mod sink;

#[cfg(test)]
mod test_util;

pub use error::ClientError;
pub use scheduler::{SchedulerConfig, SchedulerEvent, SegmentLayout, SegmentScheduler};
pub use session::{DowngradeReason, Session, SessionConfig, SessionEvent, SessionHandle};
pub use sink::{drain_all, shared_queue, BoxedAppendBuffer, SegmentSink, SharedQueue};
