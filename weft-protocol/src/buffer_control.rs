//! Adaptive playback buffer control
//!
//! Turns observed network delay into a target buffer length and keeps the
//! playhead close to the live edge. A fixed-period tick:
//!
//! 1. Derives the target from the delay spread (high percentile minus
//!    minimum, plus headroom), falling back to the server's initial buffer
//!    until enough samples exist.
//! 2. Recommends a lower quality once when the target grows too large.
//! 3. Holds off the initial seek until the stream has run long enough.
//! 4. Seeks back to the live edge after the buffer has stayed above target
//!    for several consecutive ticks, then waits out a grace period.

use crate::decoder::TimestampInfo;
use crate::delay::{percentile, DelayHistory, NetworkStats, SampleFilter};
use crate::descriptor::BufferParams;
use crate::queue::TimeRange;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tuning constants
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BufferControlConfig {
    /// Delay percentile the target must cover
    pub percentile: f64,
    /// Target excess over `min_buffer` that triggers a downgrade
    #[serde(with = "crate::serde_millis")]
    pub downgrade_threshold: Duration,
    /// Lower bound for a target computed from samples
    #[serde(with = "crate::serde_millis")]
    pub min_auto_target: Duration,
    /// Consecutive over-target ticks before a catch-up seek
    pub exceed_tick_count: u32,
    /// Quiet period after a seek
    #[serde(with = "crate::serde_millis")]
    pub grace_period: Duration,
    /// Oldest delay sample kept
    #[serde(with = "crate::serde_millis")]
    pub history_max_age: Duration,
    /// Samples needed before the target follows the network
    pub min_samples: usize,
    /// Tick period
    #[serde(with = "crate::serde_millis")]
    pub tick_interval: Duration,
}

impl Default for BufferControlConfig {
    fn default() -> Self {
        BufferControlConfig {
            percentile: 0.995,
            downgrade_threshold: Duration::from_millis(3000),
            min_auto_target: Duration::from_millis(300),
            exceed_tick_count: 3,
            grace_period: Duration::from_secs(5),
            history_max_age: Duration::from_secs(60),
            min_samples: 100,
            tick_interval: Duration::from_millis(250),
        }
    }
}

/// Playback position and ranges of the media element
pub trait PlaybackClock {
    /// Playhead position (seconds)
    fn current_time(&self) -> f64;

    /// Buffered media range
    fn buffered(&self) -> Option<TimeRange>;

    /// Range the playhead may be moved within
    fn seekable(&self) -> Option<TimeRange>;

    /// Move the playhead
    fn seek(&mut self, to: f64);
}

/// Hooks for the quality selector and instrumentation
pub trait BufferControlObserver {
    /// The target buffer is too large for the current quality
    fn on_recommend_downgrade(&mut self, target: Duration);

    /// Called at the end of every tick
    fn on_tick(&mut self, _report: &TickReport) {}
}

impl BufferControlObserver for () {
    fn on_recommend_downgrade(&mut self, _target: Duration) {}
}

/// What a tick decided
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TickAction {
    /// Initial seek held back until enough time has passed
    AwaitingInit,
    /// Buffer at or below target
    WithinTarget,
    /// Inside the post-seek grace period
    Grace,
    /// Over target; counting consecutive ticks
    OverTarget { ticks: u32 },
    /// First seek to the live edge after a stream start
    InitialSeek { to: f64 },
    /// Seek back to the live edge
    CatchUp { to: f64 },
    /// A seek was due but no usable range exists; retried next tick
    NoSeekableRange,
}

/// Per-tick instrumentation record
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TickReport {
    pub now: Duration,
    pub target: Duration,
    pub conservative_target: Option<Duration>,
    /// Buffered media ahead of the playhead (seconds)
    pub buffer_length: f64,
    pub samples: usize,
    pub action: TickAction,
}

/// Catch-up event statistics
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CatchUpStats {
    pub count: u64,
    /// Start of the counting period
    pub since: Duration,
    pub per_minute: f64,
}

/// Buffer controller for one playback session
pub struct BufferControl {
    config: BufferControlConfig,
    params: BufferParams,
    history: DelayHistory,
    /// Consecutive over-target ticks
    over_ticks: u32,
    /// No catch-up before this time
    grace_end: Option<Duration>,
    /// Start of the current stream
    stream_start: Option<Duration>,
    initial_seek_pending: bool,
    target: Duration,
    conservative_target: Option<Duration>,
    catch_ups: u64,
    catch_ups_since: Option<Duration>,
    /// Downgrade already recommended for this stream
    waiting_for_new_stream: bool,
}

impl BufferControl {
    pub fn new(config: BufferControlConfig, params: BufferParams) -> Self {
        BufferControl {
            config,
            params,
            history: DelayHistory::new(config.history_max_age),
            over_ticks: 0,
            grace_end: None,
            stream_start: None,
            initial_seek_pending: false,
            target: params.initial_buffer,
            conservative_target: None,
            catch_ups: 0,
            catch_ups_since: None,
            waiting_for_new_stream: false,
        }
    }

    pub fn config(&self) -> &BufferControlConfig {
        &self.config
    }

    pub fn params(&self) -> &BufferParams {
        &self.params
    }

    /// A new stream (or quality level) started playing
    pub fn on_new_stream_start(&mut self, now: Duration, params: BufferParams) {
        tracing::info!("Buffer control: new stream at {:?}", now);
        self.params = params;
        self.stream_start = Some(now);
        self.initial_seek_pending = true;
        self.waiting_for_new_stream = false;
        self.over_ticks = 0;
        self.grace_end = None;
        self.catch_ups_since.get_or_insert(now);
    }

    /// Record a timing sample from the decoder
    pub fn on_timestamp(&mut self, info: TimestampInfo) {
        self.history.push(info);
    }

    /// Run one control step
    pub fn tick<C, O>(&mut self, now: Duration, clock: &mut C, observer: &mut O) -> TickReport
    where
        C: PlaybackClock + ?Sized,
        O: BufferControlObserver + ?Sized,
    {
        self.catch_ups_since.get_or_insert(now);
        self.history.evict(now);
        self.update_target();

        if !self.waiting_for_new_stream
            && self.target >= self.config.downgrade_threshold + self.params.min_buffer
        {
            tracing::info!("Recommending downgrade, target {:?}", self.target);
            self.waiting_for_new_stream = true;
            observer.on_recommend_downgrade(self.target);
        }

        let buffer_length = buffer_length(clock);
        let action = self.decide(now, buffer_length, clock);

        let report = TickReport {
            now,
            target: self.target,
            conservative_target: self.conservative_target,
            buffer_length,
            samples: self.history.len(),
            action,
        };
        observer.on_tick(&report);
        report
    }

    /// Current target buffer length
    pub fn target(&self) -> Duration {
        self.target
    }

    /// Target computed only from first-after-start samples
    pub fn conservative_target(&self) -> Option<Duration> {
        self.conservative_target
    }

    pub fn network_stats(&self) -> NetworkStats {
        self.history.stats(SampleFilter::Steady)
    }

    pub fn catch_up_stats(&self, now: Duration) -> CatchUpStats {
        let since = self.catch_ups_since.unwrap_or(now);
        let minutes = now.saturating_sub(since).as_secs_f64() / 60.0;
        CatchUpStats {
            count: self.catch_ups,
            since,
            per_minute: if minutes > 0.0 {
                self.catch_ups as f64 / minutes
            } else {
                0.0
            },
        }
    }

    /// Check if a downgrade has been recommended since the last stream start
    pub fn is_waiting_for_new_stream(&self) -> bool {
        self.waiting_for_new_stream
    }

    fn update_target(&mut self) {
        let steady = self.history.sorted_delays(SampleFilter::Steady);
        self.target = if steady.len() < self.config.min_samples {
            self.params.initial_buffer
        } else {
            self.target_from(&steady).unwrap_or(self.params.initial_buffer)
        };

        let first = self.history.sorted_delays(SampleFilter::FirstOnly);
        self.conservative_target = self.target_from(&first);
    }

    /// `delay[p] - delay[0] + extra`, floored
    fn target_from(&self, sorted: &[i64]) -> Option<Duration> {
        let high = percentile(sorted, self.config.percentile)?;
        let spread = Duration::from_millis((high - sorted[0]).max(0) as u64);

        let floor = self
            .config
            .min_auto_target
            .max(self.params.seek_buffer + self.params.extra_buffer)
            .max(self.params.min_buffer);
        Some((spread + self.params.extra_buffer).max(floor))
    }

    fn decide<C: PlaybackClock + ?Sized>(
        &mut self,
        now: Duration,
        buffer_length: f64,
        clock: &mut C,
    ) -> TickAction {
        let initial = self.initial_seek_pending;

        if initial {
            let started = self.stream_start.unwrap_or(now);
            if now.saturating_sub(started) < self.params.minimum_init_time {
                return TickAction::AwaitingInit;
            }
        } else {
            if buffer_length <= self.target.as_secs_f64() {
                self.over_ticks = 0;
                return TickAction::WithinTarget;
            }
            if self.grace_end.is_some_and(|end| now < end) {
                self.over_ticks = 0;
                return TickAction::Grace;
            }

            self.over_ticks += 1;
            if self.over_ticks < self.config.exceed_tick_count {
                return TickAction::OverTarget {
                    ticks: self.over_ticks,
                };
            }
        }

        let Some(to) = self.seek_position(clock) else {
            tracing::warn!(
                "Seek due but no buffered range with {:?} of margin is seekable",
                self.params.seek_buffer
            );
            return TickAction::NoSeekableRange;
        };

        clock.seek(to);
        self.over_ticks = 0;
        self.grace_end = Some(now + self.config.grace_period);

        if initial {
            self.initial_seek_pending = false;
            tracing::info!("Initial seek to {:.3}", to);
            TickAction::InitialSeek { to }
        } else {
            self.catch_ups += 1;
            tracing::info!(
                "Catch-up seek to {:.3} (buffer {:.3}s, target {:?})",
                to,
                buffer_length,
                self.target
            );
            TickAction::CatchUp { to }
        }
    }

    fn seek_position<C: PlaybackClock + ?Sized>(&self, clock: &C) -> Option<f64> {
        let seekable = clock.seekable()?;
        let usable = clock.buffered()?.intersect(&seekable)?;

        let margin = self.params.seek_buffer.as_secs_f64();
        (usable.len() >= margin).then(|| seekable.end - margin)
    }
}

fn buffer_length<C: PlaybackClock + ?Sized>(clock: &C) -> f64 {
    clock
        .buffered()
        .map(|range| (range.end - clock.current_time()).max(0.0))
        .unwrap_or(0.0)
}
