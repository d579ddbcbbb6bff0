//! Network delay history and statistics
//!
//! Every timestamped chunk yields one delay sample (`end_received - sent`).
//! The absolute value includes the unknown clock offset between server and
//! client, so only differences between samples are meaningful.

use crate::decoder::TimestampInfo;
use std::collections::VecDeque;
use std::time::Duration;

/// Which samples a statistic is computed over
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFilter {
    /// Samples taken mid-stream (excludes the first after a stream start)
    Steady,
    /// Only first-after-stream-start samples
    FirstOnly,
    All,
}

impl SampleFilter {
    fn accepts(self, info: &TimestampInfo) -> bool {
        match self {
            SampleFilter::Steady => !info.first_for_interleave,
            SampleFilter::FirstOnly => info.first_for_interleave,
            SampleFilter::All => true,
        }
    }
}

/// Summary of the retained delay samples (milliseconds)
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct NetworkStats {
    pub count: usize,
    /// Time covered by the retained samples
    pub span: Duration,
    pub mean: f64,
    pub median: f64,
    pub min: f64,
    pub max: f64,
    pub p10: f64,
    pub p90: f64,
    pub std_dev: f64,
}

/// Element at percentile `p` of a sorted slice
///
/// Uses index `ceil(n * p)`, clamped to the last element.
pub fn percentile(sorted: &[i64], p: f64) -> Option<i64> {
    if sorted.is_empty() {
        return None;
    }
    let idx = (sorted.len() as f64 * p).ceil() as usize;
    Some(sorted[idx.min(sorted.len() - 1)])
}

/// Age-bounded, time-ordered history of timestamp samples
#[derive(Debug, Clone)]
pub struct DelayHistory {
    samples: VecDeque<TimestampInfo>,
    max_age: Duration,
}

impl DelayHistory {
    pub fn new(max_age: Duration) -> Self {
        DelayHistory {
            samples: VecDeque::new(),
            max_age,
        }
    }

    /// Record a sample, keeping arrival order
    pub fn push(&mut self, info: TimestampInfo) {
        let at = self
            .samples
            .iter()
            .rposition(|s| s.end_received_ms <= info.end_received_ms)
            .map_or(0, |i| i + 1);
        self.samples.insert(at, info);
    }

    /// Drop samples older than the maximum age at local time `now`
    pub fn evict(&mut self, now: Duration) {
        let cutoff = now.as_millis() as i64 - self.max_age.as_millis() as i64;
        while self
            .samples
            .front()
            .is_some_and(|s| s.end_received_ms < cutoff)
        {
            self.samples.pop_front();
        }
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Sorted delays of the samples accepted by `filter`
    pub fn sorted_delays(&self, filter: SampleFilter) -> Vec<i64> {
        let mut delays: Vec<i64> = self
            .samples
            .iter()
            .filter(|s| filter.accepts(s))
            .map(TimestampInfo::delay_ms)
            .collect();
        delays.sort_unstable();
        delays
    }

    /// Statistics over the samples accepted by `filter`
    pub fn stats(&self, filter: SampleFilter) -> NetworkStats {
        let delays = self.sorted_delays(filter);
        let count = delays.len();
        if count == 0 {
            return NetworkStats::default();
        }

        let n = count as f64;
        let mean = delays.iter().sum::<i64>() as f64 / n;
        let variance = delays
            .iter()
            .map(|&d| {
                let diff = d as f64 - mean;
                diff * diff
            })
            .sum::<f64>()
            / n;

        let median = if count % 2 == 0 {
            (delays[count / 2 - 1] + delays[count / 2]) as f64 / 2.0
        } else {
            delays[count / 2] as f64
        };

        let span = match (self.samples.front(), self.samples.back()) {
            (Some(first), Some(last)) => {
                Duration::from_millis((last.end_received_ms - first.end_received_ms).max(0) as u64)
            }
            _ => Duration::ZERO,
        };

        NetworkStats {
            count,
            span,
            mean,
            median,
            min: delays[0] as f64,
            max: delays[count - 1] as f64,
            p10: percentile(&delays, 0.1).unwrap_or_default() as f64,
            p90: percentile(&delays, 0.9).unwrap_or_default() as f64,
            std_dev: variance.sqrt(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(received: i64, delay: i64, first: bool) -> TimestampInfo {
        TimestampInfo {
            sent_ms: received - delay,
            end_received_ms: received,
            first_for_interleave: first,
        }
    }

    #[test]
    fn test_percentile_clamped() {
        let sorted: Vec<i64> = (0..100).collect();
        assert_eq!(percentile(&sorted, 0.995), Some(99));
        assert_eq!(percentile(&sorted, 0.5), Some(50));
        assert_eq!(percentile(&sorted, 0.0), Some(0));
        assert_eq!(percentile(&[], 0.5), None);
    }

    #[test]
    fn test_filters() {
        let mut history = DelayHistory::new(Duration::from_secs(60));
        history.push(sample(1000, 500, true));
        history.push(sample(1100, 120, false));
        history.push(sample(1200, 100, false));

        assert_eq!(history.sorted_delays(SampleFilter::Steady), vec![100, 120]);
        assert_eq!(history.sorted_delays(SampleFilter::FirstOnly), vec![500]);
        assert_eq!(history.sorted_delays(SampleFilter::All).len(), 3);
    }

    #[test]
    fn test_eviction_by_age() {
        let mut history = DelayHistory::new(Duration::from_secs(1));
        history.push(sample(0, 10, false));
        history.push(sample(900, 10, false));
        history.push(sample(1500, 10, false));

        history.evict(Duration::from_millis(1600));
        assert_eq!(history.len(), 2);
        history.evict(Duration::from_millis(5000));
        assert!(history.is_empty());
    }

    #[test]
    fn test_out_of_order_push_keeps_time_order() {
        let mut history = DelayHistory::new(Duration::from_secs(1));
        history.push(sample(500, 10, false));
        history.push(sample(100, 10, false));
        history.evict(Duration::from_millis(1200));
        // Only the sample at 100ms is older than a second
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn test_stats() {
        let mut history = DelayHistory::new(Duration::from_secs(60));
        for (i, delay) in [100, 200, 300, 400].iter().enumerate() {
            history.push(sample(i as i64 * 100, *delay, false));
        }

        let stats = history.stats(SampleFilter::Steady);
        assert_eq!(stats.count, 4);
        assert_eq!(stats.mean, 250.0);
        assert_eq!(stats.median, 250.0);
        assert_eq!(stats.min, 100.0);
        assert_eq!(stats.max, 400.0);
        assert_eq!(stats.p10, 200.0);
        assert_eq!(stats.p90, 400.0);
        assert_eq!(stats.span, Duration::from_millis(300));
        assert!((stats.std_dev - 111.803).abs() < 0.01);
    }
}
