//! Segment buffer queue
//!
//! Orders the bytes of one logical stream by segment before they reach the
//! append buffer. Segments may start arriving before the previous one has
//! finished (sub-streams of an interleave are muxed in whatever order the
//! encoder chose), so data for a segment that is not yet current is parked
//! and flushed once every earlier segment has ended.
//!
//! The append buffer itself (decoder-managed media buffer on the playback
//! side) is supplied through the [`AppendBuffer`] trait. It accepts at most
//! one outstanding append; [`SegmentBufferQueue::drain`] is the only place
//! that submits work to it.

use bytes::Bytes;
use futures::channel::oneshot;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::ops::Range;
use std::time::Duration;
use thiserror::Error;

/// Pruning starts once this many segment durations are buffered
const PRUNE_HIGH_WATER: f64 = 3.0;

/// Segment durations kept behind the live edge after pruning
const PRUNE_RETAIN: f64 = 2.0;

/// Append buffer errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AppendError {
    #[error("Append buffer is still processing the previous append")]
    Busy,

    #[error("Append rejected: {0}")]
    Rejected(String),
}

/// Media time range in seconds
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeRange {
    pub start: f64,
    pub end: f64,
}

impl TimeRange {
    pub fn new(start: f64, end: f64) -> Self {
        TimeRange { start, end }
    }

    /// Length in seconds (zero for inverted ranges)
    pub fn len(&self) -> f64 {
        (self.end - self.start).max(0.0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0.0
    }

    /// Overlap of two ranges, if any
    pub fn intersect(&self, other: &TimeRange) -> Option<TimeRange> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        (end > start).then_some(TimeRange { start, end })
    }

    pub fn contains(&self, t: f64) -> bool {
        t >= self.start && t <= self.end
    }
}

/// Playback-side media buffer
pub trait AppendBuffer {
    /// Check if an append or removal is still in progress
    fn is_updating(&self) -> bool;

    /// Submit media bytes
    fn append(&mut self, data: Bytes) -> Result<(), AppendError>;

    /// Currently buffered media range
    fn buffered(&self) -> Option<TimeRange>;

    /// Drop buffered media in `[start, end)`
    fn remove(&mut self, start: f64, end: f64) -> Result<(), AppendError>;
}

impl<B: AppendBuffer + ?Sized> AppendBuffer for Box<B> {
    fn is_updating(&self) -> bool {
        (**self).is_updating()
    }

    fn append(&mut self, data: Bytes) -> Result<(), AppendError> {
        (**self).append(data)
    }

    fn buffered(&self) -> Option<TimeRange> {
        (**self).buffered()
    }

    fn remove(&mut self, start: f64, end: f64) -> Result<(), AppendError> {
        (**self).remove(start, end)
    }
}

/// Notification that a segment's last byte reached the append buffer
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SegmentApplied {
    pub index: u64,
    /// End of buffered media at that moment (seconds)
    pub media_end: Option<f64>,
}

/// Unit of work waiting for the append buffer
#[derive(Debug, Clone, PartialEq)]
enum QueueItem {
    Data(Bytes),
    EndOfSegment(u64),
}

/// Queue statistics
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct QueueStats {
    /// Bytes accepted for current or future segments
    pub bytes_accepted: u64,
    /// Bytes handed to the append buffer
    pub bytes_appended: u64,
    /// Chunks parked because their segment was not yet current
    pub out_of_order_chunks: u64,
    /// Chunks dropped because their segment was already passed
    pub stale_chunks: u64,
    /// Segments whose end reached the append buffer
    pub segments_applied: u64,
    /// Media removed by pruning (seconds)
    pub pruned_seconds: f64,
}

/// Segment-ordered feed for one append buffer
pub struct SegmentBufferQueue<B: AppendBuffer> {
    buffer: B,
    segment_duration: Duration,
    /// Segment currently feeding `ready`
    current: Option<u64>,
    /// Items in append order
    ready: VecDeque<QueueItem>,
    /// Data of segments that are not yet current
    pending: BTreeMap<u64, Vec<Bytes>>,
    /// Segments ended but not yet reached by `current`
    finished: BTreeSet<u64>,
    /// Runs of indices that will never be fetched, start -> end
    gaps: BTreeMap<u64, u64>,
    /// Completion handles per segment
    waiters: HashMap<u64, Vec<oneshot::Sender<SegmentApplied>>>,
    last_applied: Option<u64>,
    stats: QueueStats,
}

impl<B: AppendBuffer> SegmentBufferQueue<B> {
    pub fn new(buffer: B, segment_duration: Duration) -> Self {
        SegmentBufferQueue {
            buffer,
            segment_duration,
            current: None,
            ready: VecDeque::new(),
            pending: BTreeMap::new(),
            finished: BTreeSet::new(),
            gaps: BTreeMap::new(),
            waiters: HashMap::new(),
            last_applied: None,
            stats: QueueStats::default(),
        }
    }

    /// A segment produced its first byte
    pub fn begin_segment(&mut self, index: u64) {
        if self.current.is_none() {
            tracing::debug!("Queue starting at segment {}", index);
            self.current = Some(index);
            self.flush_pending(index);
            self.advance();
        }
    }

    /// Accept bytes belonging to segment `index`
    pub fn accept_data(&mut self, data: Bytes, index: u64) {
        if data.is_empty() {
            return;
        }

        match self.current {
            Some(current) if index == current => {
                self.stats.bytes_accepted += data.len() as u64;
                self.ready.push_back(QueueItem::Data(data));
            }
            Some(current) if index < current => {
                tracing::debug!(
                    "Dropping {} bytes for passed segment {} (current {})",
                    data.len(),
                    index,
                    current
                );
                self.stats.stale_chunks += 1;
            }
            _ => {
                self.stats.bytes_accepted += data.len() as u64;
                self.stats.out_of_order_chunks += 1;
                self.pending.entry(index).or_default().push(data);
            }
        }
    }

    /// Segment `index` has no more data; idempotent
    pub fn end_segment(&mut self, index: u64) {
        let current = match self.current {
            Some(current) => current,
            None => {
                self.current = Some(index);
                self.flush_pending(index);
                index
            }
        };
        if index < current {
            return;
        }
        if self.finished.insert(index) {
            self.advance();
        }
    }

    /// Jump to `index`, discarding everything for earlier segments
    pub fn skip_to(&mut self, index: u64) {
        if self.current.is_some_and(|current| current >= index) {
            return;
        }
        tracing::debug!("Queue skipping to segment {}", index);

        self.pending = self.pending.split_off(&index);
        self.finished = self.finished.split_off(&index);
        self.gaps = self.gaps.split_off(&index);
        self.current = Some(index);
        self.flush_pending(index);
        self.advance();
    }

    /// Segments in `skipped` will never arrive; step over them once
    /// every earlier segment has ended
    pub fn skip_range(&mut self, skipped: Range<u64>) {
        if skipped.is_empty() {
            return;
        }
        match self.current {
            Some(current) if current >= skipped.end => {}
            Some(current) if current >= skipped.start => self.skip_to(skipped.end),
            _ => {
                tracing::debug!(
                    "Queue will step over segments {}..{}",
                    skipped.start,
                    skipped.end
                );
                self.gaps.insert(skipped.start, skipped.end);
            }
        }
    }

    /// Forget all queued state, e.g. on a quality switch
    pub fn reset(&mut self) {
        self.current = None;
        self.ready.clear();
        self.pending.clear();
        self.finished.clear();
        self.gaps.clear();
        self.waiters.clear();
        self.last_applied = None;
    }

    /// Resolve once segment `index` has been fully applied
    pub fn when_applied(&mut self, index: u64) -> oneshot::Receiver<SegmentApplied> {
        let (tx, rx) = oneshot::channel();
        if self.last_applied.is_some_and(|last| index <= last) {
            let _ = tx.send(SegmentApplied {
                index,
                media_end: self.buffer.buffered().map(|r| r.end),
            });
        } else {
            self.waiters.entry(index).or_default().push(tx);
        }
        rx
    }

    /// Feed the append buffer until it is busy or the queue is empty
    ///
    /// Returns the segments whose end was applied during this call. On an
    /// append error the item stays at the head of the queue.
    pub fn drain(&mut self) -> Result<Vec<SegmentApplied>, AppendError> {
        let mut applied = Vec::new();

        while !self.buffer.is_updating() {
            let Some(item) = self.ready.pop_front() else {
                break;
            };

            match item {
                QueueItem::Data(data) => {
                    let len = data.len() as u64;
                    if let Err(e) = self.buffer.append(data.clone()) {
                        self.ready.push_front(QueueItem::Data(data));
                        return Err(e);
                    }
                    self.stats.bytes_appended += len;
                }
                QueueItem::EndOfSegment(index) => {
                    let event = SegmentApplied {
                        index,
                        media_end: self.buffer.buffered().map(|r| r.end),
                    };
                    self.last_applied = Some(index);
                    self.stats.segments_applied += 1;
                    for tx in self.waiters.remove(&index).unwrap_or_default() {
                        let _ = tx.send(event);
                    }
                    applied.push(event);
                }
            }
        }

        Ok(applied)
    }

    /// Drop played media once the buffer grows too large
    ///
    /// Returns the removed range. Never removes media at or after
    /// `current_time`.
    pub fn prune(&mut self, current_time: f64) -> Result<Option<TimeRange>, AppendError> {
        if self.buffer.is_updating() {
            return Ok(None);
        }
        let Some(range) = self.buffer.buffered() else {
            return Ok(None);
        };

        let segment = self.segment_duration.as_secs_f64();
        if range.len() <= segment * PRUNE_HIGH_WATER {
            return Ok(None);
        }

        let end = (range.end - segment * PRUNE_RETAIN).min(current_time);
        if end <= range.start {
            return Ok(None);
        }

        self.buffer.remove(range.start, end)?;
        self.stats.pruned_seconds += end - range.start;
        tracing::debug!("Pruned media {:.3}..{:.3}", range.start, end);
        Ok(Some(TimeRange::new(range.start, end)))
    }

    /// Segment currently feeding the append buffer
    pub fn current_index(&self) -> Option<u64> {
        self.current
    }

    /// Items waiting for the append buffer
    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }

    /// Segments with parked out-of-order data
    pub fn pending_segments(&self) -> usize {
        self.pending.len()
    }

    pub fn buffer(&self) -> &B {
        &self.buffer
    }

    pub fn buffer_mut(&mut self) -> &mut B {
        &mut self.buffer
    }

    pub fn stats(&self) -> QueueStats {
        self.stats
    }

    fn flush_pending(&mut self, index: u64) {
        if let Some(chunks) = self.pending.remove(&index) {
            self.ready.extend(chunks.into_iter().map(QueueItem::Data));
        }
    }

    /// Close out every finished segment at the head, in order
    fn advance(&mut self) {
        while let Some(current) = self.current {
            if let Some(end) = self.gaps.remove(&current) {
                self.current = Some(end);
                self.flush_pending(end);
                continue;
            }
            if !self.finished.remove(&current) {
                break;
            }
            self.ready.push_back(QueueItem::EndOfSegment(current));
            self.current = Some(current + 1);
            self.flush_pending(current + 1);
        }
    }
}
