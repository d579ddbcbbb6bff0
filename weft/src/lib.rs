//! Weft - low-latency live media over HTTP
//!
//! High-level API re-exporting the protocol core, platform layer, client
//! and server crates.

pub use weft_client as client;
pub use weft_io as io;
pub use weft_protocol as protocol;
pub use weft_server as server;

// Re-export commonly used types
pub use client::{Session, SessionConfig, SessionEvent};
pub use protocol::{BufferControl, InterleaveDecoder, InterleaveEncoder, SegmentBufferQueue};
pub use server::{InterleaveRegistry, SourceEvent};
