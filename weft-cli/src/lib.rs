//! Weft CLI Library
//!
//! Shared functionality for Weft command-line tools.

pub mod config;
pub mod player;
pub mod stats;

pub use config::{ClientConfig, Config, ConfigError, MuxConfig, PaddingConfig};
pub use player::{FileAppendBuffer, SimulatedPlayer};
pub use stats::{
    display_decoder_stats, display_network_stats, display_registry_stats, format_bandwidth,
    format_bytes, format_duration, format_ms, format_tick,
};

/// Install the `tracing` subscriber, honouring `RUST_LOG`
pub fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
