//! Weft Protocol Core Implementation
//!
//! This crate implements the sans-IO core of the Weft live media data plane:
//! the interleave chunk framing and its incremental encoder/decoder, control
//! channel messages, minimum-rate padding, segment descriptors and fetch
//! prediction, the segment buffer queue, and adaptive buffer control.
//!
//! Nothing here performs I/O or reads a clock; callers pass the current time
//! in explicitly.

pub mod buffer_control;
pub mod checksum;
pub mod chunk;
pub mod control;
pub mod decoder;
pub mod delay;
pub mod descriptor;
pub mod encoder;
pub mod padding;
pub mod queue;
pub mod serde_millis;
pub mod timeline;

pub use buffer_control::{
    BufferControl, BufferControlConfig, BufferControlObserver, CatchUpStats, PlaybackClock,
    TickAction, TickReport,
};
pub use checksum::RollingChecksum;
pub use chunk::{ChunkError, ChunkHeader, ContentId, StreamIndex, WidthClass, MAX_DATA_STREAMS};
pub use control::{ControlMessage, ControlType, ServerMessage};
pub use decoder::{
    DecodeEvent, DecoderStats, InterleaveDecoder, InterleaveHandler, TimestampInfo,
    DEFAULT_MAX_CONTROL_LEN,
};
pub use delay::{DelayHistory, NetworkStats, SampleFilter};
pub use descriptor::{BufferParams, DescriptorError, SegmentDescriptor};
pub use encoder::{EncoderConfig, EncoderStats, InterleaveEncoder};
pub use padding::{MinRateConfig, MinRatePadding};
pub use queue::{AppendBuffer, AppendError, QueueStats, SegmentApplied, SegmentBufferQueue, TimeRange};
pub use timeline::{FetchTimeline, ScheduledFetch, TimelineConfig};
