//! Segment download scheduler
//!
//! Fetches each segment at its predicted availability time and streams the
//! body into the segment queues, through an interleave decoder when the
//! segments are interleaved. The segment descriptor is re-fetched every few
//! segments, independently of the per-segment timer, to correct for drift.
//!
//! Every fetch runs in its own task. Fetches for segments that were
//! overtaken before their headers arrived are dropped without error;
//! cancelling the session token ends `run` with [`ClientError::Cancelled`].

use crate::error::ClientError;
use crate::sink::{drain_all, SegmentSink, SharedQueue};
use futures::StreamExt;
use parking_lot::Mutex;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use url::Url;
use weft_io::{Clock, Net, TokioClock};
use weft_protocol::{
    ControlMessage, FetchTimeline, InterleaveDecoder, SegmentApplied, SegmentDescriptor,
    TimelineConfig, TimestampInfo, MAX_DATA_STREAMS,
};

/// How a stream's segments are stored on the origin
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentLayout {
    /// `chunk-stream{N}-{index}.m4s`, one media stream
    Plain { stream: u32 },
    /// `interleaved{N}-{index}`, one interleave per segment
    Interleaved { stream: u32 },
}

impl SegmentLayout {
    fn stream(self) -> u32 {
        match self {
            SegmentLayout::Plain { stream } | SegmentLayout::Interleaved { stream } => stream,
        }
    }
}

/// Scheduler settings
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Directory URL the stream files live under
    pub base_url: Url,
    pub layout: SegmentLayout,
    pub timeline: TimelineConfig,
    /// Re-fetch the descriptor after this many segment fetches
    pub refresh_every: u64,
}

impl SchedulerConfig {
    pub fn new(base_url: Url, layout: SegmentLayout) -> Self {
        SchedulerConfig {
            base_url,
            layout,
            timeline: TimelineConfig::default(),
            refresh_every: 10,
        }
    }

    /// `{base}/chunk-stream{N}-index.json`
    pub fn descriptor_url(&self) -> Result<Url, ClientError> {
        let name = format!("chunk-stream{}-index.json", self.layout.stream());
        Ok(self.base().join(&name)?)
    }

    /// URL of segment `index`, zero-padded to `width` digits
    pub fn segment_url(&self, index: u64, width: usize) -> Result<Url, ClientError> {
        let name = match self.layout {
            SegmentLayout::Plain { stream } => {
                format!("chunk-stream{}-{:0width$}.m4s", stream, index, width = width)
            }
            SegmentLayout::Interleaved { stream } => {
                format!("interleaved{}-{:0width$}", stream, index, width = width)
            }
        };
        Ok(self.base().join(&name)?)
    }

    /// Base URL as a directory, so joins append rather than replace
    fn base(&self) -> Url {
        let mut base = self.base_url.clone();
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        base
    }
}

/// Scheduler output
#[derive(Debug)]
pub enum SchedulerEvent {
    /// First byte of a segment arrived
    SegmentStarted { index: u64 },
    /// A segment body finished downloading
    SegmentComplete {
        index: u64,
        bytes: u64,
        elapsed: Duration,
    },
    /// Fetch dropped because newer segments overtook it
    SegmentSuperseded { index: u64 },
    /// A descriptor refresh jumped over these segments; they are never fetched
    SegmentsSkipped { skipped: Range<u64> },
    /// A segment fetch failed; its slot is closed and playback moves on
    SegmentFailed { index: u64, error: ClientError },
    /// A download took longer than the segment lasts
    DowngradeRecommended { index: u64, elapsed: Duration },
    /// A queue handed a segment's last byte to its append buffer
    SegmentApplied {
        stream: usize,
        applied: SegmentApplied,
    },
    Timestamp(TimestampInfo),
    Control(ControlMessage),
    /// A periodic descriptor refresh failed; retried after the next fetch
    DescriptorFailed { error: ClientError },
}

enum PumpOutcome {
    Complete { bytes: u64, elapsed: Duration },
    Superseded,
}

struct Inner {
    net: Arc<dyn Net>,
    clock: TokioClock,
    config: SchedulerConfig,
    queues: Vec<SharedQueue>,
    timeline: Mutex<FetchTimeline>,
    index_width: AtomicUsize,
    /// Next decoder's first timestamp follows a stream start
    first_pending: AtomicBool,
    refreshing: AtomicBool,
    refreshed: Notify,
    events: mpsc::UnboundedSender<SchedulerEvent>,
    cancel: CancellationToken,
}

/// Segment download scheduler for one stream
pub struct SegmentScheduler {
    inner: Arc<Inner>,
}

impl SegmentScheduler {
    /// Create a scheduler feeding `queues`
    ///
    /// Plain layouts feed `queues[0]`; interleaved layouts feed sub-stream
    /// `i` into `queues[i]`.
    pub fn new(
        net: Arc<dyn Net>,
        clock: TokioClock,
        config: SchedulerConfig,
        queues: Vec<SharedQueue>,
        events: mpsc::UnboundedSender<SchedulerEvent>,
        cancel: CancellationToken,
    ) -> Result<Self, ClientError> {
        if queues.is_empty() {
            return Err(ClientError::NoQueues);
        }
        if queues.len() > MAX_DATA_STREAMS {
            return Err(ClientError::TooManyQueues {
                max: MAX_DATA_STREAMS,
                actual: queues.len(),
            });
        }

        let timeline = FetchTimeline::new(config.timeline)?;
        Ok(SegmentScheduler {
            inner: Arc::new(Inner {
                net,
                clock,
                config,
                queues,
                timeline: Mutex::new(timeline),
                index_width: AtomicUsize::new(0),
                first_pending: AtomicBool::new(true),
                refreshing: AtomicBool::new(false),
                refreshed: Notify::new(),
                events,
                cancel,
            }),
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// Highest segment index handed to a fetch task
    pub fn last_scheduled(&self) -> Option<u64> {
        self.inner.timeline.lock().last_scheduled()
    }

    /// Run until the session token is cancelled
    ///
    /// Fails only if the initial descriptor cannot be fetched or on
    /// cancellation; per-segment failures are reported as events.
    pub async fn run(&self) -> Result<(), ClientError> {
        let inner = &self.inner;

        let descriptor = tokio::select! {
            _ = inner.cancel.cancelled() => return Err(ClientError::Cancelled),
            descriptor = inner.fetch_descriptor() => descriptor?,
        };
        inner.apply_descriptor(&descriptor);
        tracing::info!(
            "Scheduler started at segment {} (age {:?})",
            descriptor.index,
            descriptor.age
        );

        let mut tasks = JoinSet::new();
        loop {
            let next = inner.timeline.lock().next();
            let deadline = next.map(|f| inner.clock.instant_at(f.due));

            tokio::select! {
                _ = inner.cancel.cancelled() => {
                    tasks.shutdown().await;
                    return Err(ClientError::Cancelled);
                }
                _ = inner.refreshed.notified() => continue,
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        tracing::error!("Fetch task failed: {}", e);
                    }
                    continue;
                }
                _ = sleep_until(deadline) => {}
            }

            let now = inner.clock.now();
            let (fetch, refresh_due) = {
                let mut timeline = inner.timeline.lock();
                let fetch = timeline.poll(now);
                (fetch, timeline.since_refresh() >= inner.config.refresh_every)
            };

            if let Some(fetch) = fetch {
                if let Some(skipped) = fetch.skipped_range() {
                    inner.skip_segments(skipped);
                }
                tracing::debug!("Fetching segment {} at {:?}", fetch.index, now);
                tasks.spawn(Inner::fetch_segment(inner.clone(), fetch.index));
            }
            if refresh_due && !inner.refreshing.swap(true, Ordering::SeqCst) {
                tasks.spawn(Inner::refresh_descriptor(inner.clone()));
            }
        }
    }
}

async fn sleep_until(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => futures::future::pending().await,
    }
}

impl Inner {
    async fn fetch_descriptor(&self) -> Result<SegmentDescriptor, ClientError> {
        let url = self.config.descriptor_url()?;
        let body = self.net.get_bytes(url).await?;
        Ok(SegmentDescriptor::from_json(&body)?)
    }

    fn apply_descriptor(&self, descriptor: &SegmentDescriptor) {
        self.index_width
            .store(descriptor.index_width, Ordering::SeqCst);
        let now = self.clock.now();
        let next = self.timeline.lock().refresh(descriptor, now);
        tracing::debug!(
            "Descriptor index {} -> next fetch {} due {:?}",
            descriptor.index,
            next.index,
            next.due
        );
        self.refreshed.notify_one();
    }

    /// Let the queues step over segments that will never be fetched
    fn skip_segments(&self, skipped: Range<u64>) {
        tracing::info!(
            "Descriptor drifted; skipping segments {}..{}",
            skipped.start,
            skipped.end
        );
        for queue in &self.queues {
            queue.lock().skip_range(skipped.clone());
        }
        drain_all(&self.queues, &self.events);
        let _ = self.events.send(SchedulerEvent::SegmentsSkipped { skipped });
    }

    async fn refresh_descriptor(self: Arc<Self>) {
        let result = tokio::select! {
            _ = self.cancel.cancelled() => return,
            result = self.fetch_descriptor() => result,
        };
        match result {
            Ok(descriptor) => self.apply_descriptor(&descriptor),
            Err(error) => {
                tracing::warn!("Descriptor refresh failed: {}", error);
                let _ = self.events.send(SchedulerEvent::DescriptorFailed { error });
            }
        }
        self.refreshing.store(false, Ordering::SeqCst);
    }

    async fn fetch_segment(self: Arc<Self>, index: u64) {
        let started = self.clock.now();
        let result = tokio::select! {
            _ = self.cancel.cancelled() => return,
            result = self.pump_segment(index, started) => result,
        };

        // Close the slot whatever happened so the queues never stall on it
        for queue in &self.queues {
            queue.lock().end_segment(index);
        }
        drain_all(&self.queues, &self.events);

        let event = match result {
            Ok(PumpOutcome::Complete { bytes, elapsed }) => {
                tracing::debug!("Segment {}: {} bytes in {:?}", index, bytes, elapsed);
                if elapsed > self.config.timeline.segment_duration {
                    tracing::info!(
                        "Segment {} took {:?}, longer than its duration",
                        index,
                        elapsed
                    );
                    let _ = self
                        .events
                        .send(SchedulerEvent::DowngradeRecommended { index, elapsed });
                }
                SchedulerEvent::SegmentComplete {
                    index,
                    bytes,
                    elapsed,
                }
            }
            Ok(PumpOutcome::Superseded) => SchedulerEvent::SegmentSuperseded { index },
            Err(error) => {
                tracing::warn!("Segment {} failed: {}", index, error);
                SchedulerEvent::SegmentFailed { index, error }
            }
        };
        let _ = self.events.send(event);
    }

    async fn pump_segment(&self, index: u64, started: Duration) -> Result<PumpOutcome, ClientError> {
        let width = self.index_width.load(Ordering::SeqCst);
        let url = self.config.segment_url(index, width)?;
        let mut body = self.net.stream(url).await?;

        if self.timeline.lock().is_superseded(index) {
            tracing::debug!("Segment {} superseded before its body, dropping", index);
            return Ok(PumpOutcome::Superseded);
        }

        let mut decoder = match self.config.layout {
            SegmentLayout::Interleaved { .. } => Some(
                InterleaveDecoder::new()
                    .with_first_timestamp(self.first_pending.swap(false, Ordering::SeqCst)),
            ),
            SegmentLayout::Plain { .. } => None,
        };

        let mut bytes = 0u64;
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            if chunk.is_empty() {
                continue;
            }

            if bytes == 0 {
                for queue in &self.queues {
                    queue.lock().begin_segment(index);
                }
                let _ = self.events.send(SchedulerEvent::SegmentStarted { index });
            }
            bytes += chunk.len() as u64;

            match decoder.as_mut() {
                Some(decoder) => {
                    let mut sink = SegmentSink::new(index, &self.queues, &self.events);
                    decoder.feed(chunk, self.clock.now(), &mut sink);
                }
                None => self.queues[0].lock().accept_data(chunk, index),
            }
            drain_all(&self.queues, &self.events);
        }

        if decoder.as_ref().is_some_and(|d| !d.is_at_boundary()) {
            tracing::warn!("Segment {} ended in the middle of a chunk", index);
        }

        Ok(PumpOutcome::Complete {
            bytes,
            elapsed: self.clock.now().saturating_sub(started),
        })
    }
}
