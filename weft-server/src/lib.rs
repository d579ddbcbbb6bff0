//! Weft Server
//!
//! Encoder-side interleaving: source files matching configured patterns are
//! multiplexed into one interleave per capture-group key, with send
//! timestamps and minimum-rate padding.

pub mod registry;
pub mod sink;

pub use registry::{
    InstanceStats, InterleaveRegistry, RegistryConfig, RegistryError, RegistryStats, SourceEvent,
    SourceStats,
};
pub use sink::{FileSink, InterleaveSink, MemoryOutputs, MemorySink, MemorySinkFactory, SinkFactory};
