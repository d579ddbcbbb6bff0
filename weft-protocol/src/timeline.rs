//! Segment fetch timeline
//!
//! Predicts when each segment becomes fetchable from the latest descriptor.
//! A segment published `age` ago is complete `duration - age` from now and
//! fetchable `pre_availability` before that; `margin` is added as slack.
//! The timeline never hands out an index twice, so descriptor refreshes
//! only re-anchor the due time of the next index.

use crate::descriptor::{DescriptorError, SegmentDescriptor};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Timing settings for one stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineConfig {
    /// Nominal segment duration
    #[serde(with = "crate::serde_millis")]
    pub segment_duration: Duration,
    /// How long before its end a segment is already fetchable
    #[serde(with = "crate::serde_millis")]
    pub pre_availability: Duration,
    /// Extra delay added to every prediction
    #[serde(with = "crate::serde_millis")]
    pub margin: Duration,
}

impl Default for TimelineConfig {
    fn default() -> Self {
        TimelineConfig {
            segment_duration: Duration::from_millis(1000),
            pre_availability: Duration::from_millis(1000),
            margin: Duration::from_millis(50),
        }
    }
}

const NANOS_PER_SEC: u128 = 1_000_000_000;

/// A fetch the timeline wants to start
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledFetch {
    pub index: u64,
    /// Local time at which the fetch should start
    pub due: Duration,
    /// Indices right before `index` that a refresh jumped over and that
    /// will never be fetched
    pub skipped: u64,
}

impl ScheduledFetch {
    /// Jumped-over indices, if any
    pub fn skipped_range(&self) -> Option<std::ops::Range<u64>> {
        (self.skipped > 0).then(|| self.index - self.skipped..self.index)
    }
}

/// `duration * n`, saturating at `Duration::MAX`
fn times(duration: Duration, n: u64) -> Duration {
    let nanos = duration.as_nanos().saturating_mul(n as u128);
    let secs = u64::try_from(nanos / NANOS_PER_SEC).unwrap_or(u64::MAX);
    Duration::new(secs, (nanos % NANOS_PER_SEC) as u32)
}

/// Whole segments needed to cover `span`
fn segments_covering(span: Duration, duration: Duration) -> u64 {
    u64::try_from(span.as_nanos().div_ceil(duration.as_nanos())).unwrap_or(u64::MAX)
}

/// Sans-IO fetch predictor
#[derive(Debug, Clone)]
pub struct FetchTimeline {
    config: TimelineConfig,
    /// Next fetch, once a descriptor has been seen
    next: Option<ScheduledFetch>,
    /// Highest index already handed out
    last_scheduled: Option<u64>,
    /// Fetches handed out since the last refresh
    since_refresh: u64,
}

impl FetchTimeline {
    pub fn new(config: TimelineConfig) -> Result<Self, DescriptorError> {
        if config.segment_duration.is_zero() {
            return Err(DescriptorError::ZeroSegmentDuration);
        }
        Ok(FetchTimeline {
            config,
            next: None,
            last_scheduled: None,
            since_refresh: 0,
        })
    }

    pub fn config(&self) -> &TimelineConfig {
        &self.config
    }

    /// Re-anchor the timeline on a freshly received descriptor
    ///
    /// Server values are untrusted; the arithmetic saturates instead of
    /// overflowing.
    pub fn refresh(&mut self, descriptor: &SegmentDescriptor, now: Duration) -> ScheduledFetch {
        let duration = self.config.segment_duration;
        let mut index = descriptor.index;
        let mut ahead = duration.saturating_add(self.config.margin);
        let behind = descriptor.age.saturating_add(self.config.pre_availability);

        // Advance whole segments until the offset is no longer negative
        if behind > ahead {
            let skip = segments_covering(behind - ahead, duration);
            index = index.saturating_add(skip);
            ahead = ahead.saturating_add(times(duration, skip));
        }
        let mut due = now.saturating_add(ahead.saturating_sub(behind));

        let mut skipped = 0;
        if let Some(last) = self.last_scheduled {
            let following = last.saturating_add(1);
            if index <= following {
                due = due.saturating_add(times(duration, following - index));
                index = following;
            } else {
                skipped = index - following;
            }
        }

        let fetch = ScheduledFetch {
            index,
            due,
            skipped,
        };
        self.next = Some(fetch);
        self.since_refresh = 0;
        fetch
    }

    /// The next fetch, if any descriptor has been seen
    pub fn next(&self) -> Option<ScheduledFetch> {
        self.next
    }

    /// Hand out the next fetch if it is due
    pub fn poll(&mut self, now: Duration) -> Option<ScheduledFetch> {
        let fetch = self.next?;
        if fetch.due > now {
            return None;
        }

        self.last_scheduled = Some(fetch.index);
        self.since_refresh += 1;
        self.next = Some(ScheduledFetch {
            index: fetch.index.saturating_add(1),
            due: fetch.due.saturating_add(self.config.segment_duration),
            skipped: 0,
        });
        Some(fetch)
    }

    /// Highest index handed out so far
    pub fn last_scheduled(&self) -> Option<u64> {
        self.last_scheduled
    }

    /// Fetches handed out since the last descriptor refresh
    pub fn since_refresh(&self) -> u64 {
        self.since_refresh
    }

    /// Check if `index` has been overtaken by more than one newer fetch
    pub fn is_superseded(&self, index: u64) -> bool {
        self.last_scheduled.is_some_and(|last| last > index.saturating_add(1))
    }
}
