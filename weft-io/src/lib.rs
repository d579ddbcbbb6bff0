//! Weft I/O and Platform Abstraction
//!
//! This crate provides the clocks, timers and HTTP transport the client and
//! server build on.

pub mod net;
pub mod time;

pub use net::{ByteStream, HttpClient, Net, NetError, NetOptions};
pub use time::{Clock, ManualClock, RateLimiter, SystemClock, Timer, TokioClock};
