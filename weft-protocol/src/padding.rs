//! Minimum-rate padding
//!
//! Some network paths hold back small responses until enough bytes have
//! accumulated. The padding tracker watches how many bytes an interleave
//! has written over a sliding window and, when sampled, reports how many
//! filler bytes are needed to bring the window average up to a minimum rate.
//! The encoder turns that deficit into discard control chunks.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;

/// Minimum-rate padding settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MinRateConfig {
    /// Sliding window length
    #[serde(with = "crate::serde_millis")]
    pub window: Duration,
    /// Minimum average throughput (bytes per second)
    pub min_bytes_per_sec: u64,
}

impl MinRateConfig {
    pub fn new(window: Duration, min_bytes_per_sec: u64) -> Self {
        MinRateConfig {
            window,
            min_bytes_per_sec,
        }
    }

    /// How often the window should be re-evaluated
    ///
    /// Half the window, so the worst-case gap before correction is 1.5 windows.
    pub fn evaluation_period(&self) -> Duration {
        self.window / 2
    }
}

/// Sliding-window throughput tracker
#[derive(Debug, Clone)]
pub struct MinRatePadding {
    config: MinRateConfig,
    /// Time of the first real chunk
    started_at: Option<Duration>,
    /// Set once the interleave is finished
    finished: bool,
    /// (time, bytes) of every write inside the window
    samples: VecDeque<(Duration, u64)>,
    /// Sum of `samples`
    window_bytes: u64,
    /// Total filler bytes requested so far
    padding_total: u64,
}

impl MinRatePadding {
    pub fn new(config: MinRateConfig) -> Self {
        MinRatePadding {
            config,
            started_at: None,
            finished: false,
            samples: VecDeque::new(),
            window_bytes: 0,
            padding_total: 0,
        }
    }

    pub fn config(&self) -> &MinRateConfig {
        &self.config
    }

    /// Check if the tracker is counting
    pub fn is_active(&self) -> bool {
        self.started_at.is_some() && !self.finished
    }

    /// Record bytes of a real chunk; the first call starts the tracker
    pub fn record_real(&mut self, now: Duration, bytes: u64) {
        if self.finished {
            return;
        }
        if self.started_at.is_none() {
            self.started_at = Some(now);
        }
        self.push(now, bytes);
    }

    /// Record filler bytes that were actually written
    pub fn record_padding(&mut self, now: Duration, bytes: u64) {
        if !self.is_active() {
            return;
        }
        self.padding_total += bytes;
        self.push(now, bytes);
    }

    /// Stop padding; the stream is finished
    pub fn finish(&mut self) {
        self.finished = true;
        self.samples.clear();
        self.window_bytes = 0;
    }

    /// Undo [`finish`](Self::finish); the next real chunk starts a fresh window
    pub fn resume(&mut self) {
        if self.finished {
            self.finished = false;
            self.started_at = None;
        }
    }

    /// Bytes needed now to bring the window average up to the minimum
    pub fn deficit(&mut self, now: Duration) -> u64 {
        let Some(started_at) = self.started_at else {
            return 0;
        };
        if self.finished {
            return 0;
        }

        let span = self.span(now, started_at);
        self.evict(now.saturating_sub(span));

        let required = self.config.min_bytes_per_sec as u128 * span.as_millis() / 1000;
        (required as u64).saturating_sub(self.window_bytes)
    }

    /// Average throughput over the current window (bytes per second)
    pub fn window_rate(&mut self, now: Duration) -> f64 {
        let Some(started_at) = self.started_at else {
            return 0.0;
        };
        let span = self.span(now, started_at);
        self.evict(now.saturating_sub(span));

        if span.is_zero() {
            return 0.0;
        }
        self.window_bytes as f64 / span.as_secs_f64()
    }

    /// Total filler bytes recorded
    pub fn padding_total(&self) -> u64 {
        self.padding_total
    }

    fn span(&self, now: Duration, started_at: Duration) -> Duration {
        now.saturating_sub(started_at).min(self.config.window)
    }

    fn push(&mut self, now: Duration, bytes: u64) {
        self.samples.push_back((now, bytes));
        self.window_bytes += bytes;
    }

    fn evict(&mut self, cutoff: Duration) {
        while let Some(&(at, bytes)) = self.samples.front() {
            if at >= cutoff {
                break;
            }
            self.samples.pop_front();
            self.window_bytes -= bytes;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn test_idle_before_first_chunk() {
        let mut padding = MinRatePadding::new(MinRateConfig::new(ms(1000), 1000));
        assert_eq!(padding.deficit(ms(5000)), 0);
        assert!(!padding.is_active());
    }

    #[test]
    fn test_deficit_over_partial_window() {
        let mut padding = MinRatePadding::new(MinRateConfig::new(ms(1000), 1000));
        padding.record_real(ms(0), 200);

        // 500ms elapsed: 500 bytes required, 200 written
        assert_eq!(padding.deficit(ms(500)), 300);
        padding.record_padding(ms(500), 300);

        // full window: 1000 required, 500 written
        assert_eq!(padding.deficit(ms(1000)), 500);
        padding.record_padding(ms(1000), 500);
        assert!(padding.window_rate(ms(1000)) >= 1000.0);
        assert_eq!(padding.padding_total(), 800);
    }

    #[test]
    fn test_window_eviction() {
        let mut padding = MinRatePadding::new(MinRateConfig::new(ms(1000), 1000));
        padding.record_real(ms(0), 5000);
        assert_eq!(padding.deficit(ms(900)), 0);

        // The large write has left the window
        assert_eq!(padding.deficit(ms(2500)), 1000);
    }

    #[test]
    fn test_finish_stops_padding() {
        let mut padding = MinRatePadding::new(MinRateConfig::new(ms(1000), 1000));
        padding.record_real(ms(0), 10);
        padding.finish();
        assert_eq!(padding.deficit(ms(800)), 0);
        assert!(!padding.is_active());
    }

    #[test]
    fn test_resume_after_finish() {
        let mut padding = MinRatePadding::new(MinRateConfig::new(ms(1000), 1000));
        padding.record_real(ms(0), 10);
        padding.finish();
        padding.resume();

        // Idle again until real data arrives; the quiet gap is not owed
        assert_eq!(padding.deficit(ms(9000)), 0);
        padding.record_real(ms(9000), 100);
        assert_eq!(padding.deficit(ms(9500)), 400);
        assert!(padding.is_active());
    }

    proptest::proptest! {
        #[test]
        fn prop_padding_covers_deficit(
            steps in proptest::collection::vec((0u64..700, 0u64..3000), 1..50),
            rate in 1u64..20_000,
        ) {
            let mut padding = MinRatePadding::new(MinRateConfig::new(ms(1000), rate));
            let mut now = ms(0);
            for (gap, bytes) in steps {
                now += ms(gap);
                if bytes > 0 {
                    padding.record_real(now, bytes);
                }
                let deficit = padding.deficit(now);
                padding.record_padding(now, deficit);
                proptest::prop_assert_eq!(padding.deficit(now), 0);
            }
        }
    }

    #[test]
    fn test_evaluation_period() {
        let config = MinRateConfig::new(ms(1000), 1000);
        assert_eq!(config.evaluation_period(), ms(500));
    }
}
