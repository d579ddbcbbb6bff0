//! Playback session
//!
//! Ties one stream's scheduler to buffer control: timing samples from the
//! decoder feed the delay history, a fixed-period tick feeds the append
//! buffers, prunes played media and runs the controller against the
//! player. Everything the application must react to comes out as a
//! [`SessionEvent`].
//!
//! A [`SessionHandle`] moves a running session onto another stream, e.g.
//! a lower quality after a downgrade: the scheduler is restarted on the new
//! stream, the queues are reset and buffer control sees a new stream start.

use crate::error::ClientError;
use crate::scheduler::{SchedulerConfig, SchedulerEvent, SegmentLayout, SegmentScheduler};
use crate::sink::{drain_all, SharedQueue};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use weft_io::{Clock, Net, TokioClock};
use weft_protocol::{
    BufferControl, BufferControlConfig, BufferControlObserver, BufferParams, ControlMessage,
    PlaybackClock, SegmentApplied, TickReport,
};

/// Session settings
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub scheduler: SchedulerConfig,
    pub buffer_control: BufferControlConfig,
    pub params: BufferParams,
}

/// Why a lower quality was recommended
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "camelCase")]
pub enum DowngradeReason {
    /// A segment took longer to download than it lasts
    SlowDownload {
        index: u64,
        #[serde(with = "weft_protocol::serde_millis")]
        elapsed: Duration,
    },
    /// The buffer target grew past the downgrade threshold
    BufferTarget {
        #[serde(with = "weft_protocol::serde_millis")]
        target: Duration,
    },
}

/// Session output
#[derive(Debug)]
pub enum SessionEvent {
    Downgrade(DowngradeReason),
    Control(ControlMessage),
    SegmentFailed { index: u64, error: ClientError },
    SegmentApplied { stream: usize, applied: SegmentApplied },
    Tick(TickReport),
}

enum SessionCommand {
    SwitchStream {
        layout: SegmentLayout,
        params: BufferParams,
    },
}

/// Control handle for a running [`Session`]
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<SessionCommand>,
}

impl SessionHandle {
    /// Continue playback from another stream with new buffer parameters
    pub fn switch_stream(
        &self,
        layout: SegmentLayout,
        params: BufferParams,
    ) -> Result<(), ClientError> {
        params.validate()?;
        self.commands
            .send(SessionCommand::SwitchStream { layout, params })
            .map_err(|_| ClientError::Cancelled)
    }
}

/// Forwards controller callbacks as session events
struct Forward<'a> {
    out: &'a mpsc::UnboundedSender<SessionEvent>,
}

impl BufferControlObserver for Forward<'_> {
    fn on_recommend_downgrade(&mut self, target: Duration) {
        let _ = self
            .out
            .send(SessionEvent::Downgrade(DowngradeReason::BufferTarget { target }));
    }

    fn on_tick(&mut self, report: &TickReport) {
        tracing::trace!(
            "Tick: buffer {:.3}s target {:?} {:?}",
            report.buffer_length,
            report.target,
            report.action
        );
        let _ = self.out.send(SessionEvent::Tick(*report));
    }
}

/// One stream playing into one player
pub struct Session<P: PlaybackClock + Send> {
    net: Arc<dyn Net>,
    scheduler: Arc<SegmentScheduler>,
    /// Stops the current scheduler only
    fetch_cancel: CancellationToken,
    commands_tx: mpsc::UnboundedSender<SessionCommand>,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    events_tx: mpsc::UnboundedSender<SchedulerEvent>,
    events: mpsc::UnboundedReceiver<SchedulerEvent>,
    control: BufferControl,
    params: BufferParams,
    player: P,
    queues: Vec<SharedQueue>,
    out: mpsc::UnboundedSender<SessionEvent>,
    cancel: CancellationToken,
    clock: TokioClock,
}

impl<P: PlaybackClock + Send> Session<P> {
    /// Create a session and the receiver for its events
    pub fn new(
        net: Arc<dyn Net>,
        config: SessionConfig,
        queues: Vec<SharedQueue>,
        player: P,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SessionEvent>), ClientError> {
        config.params.validate()?;

        let clock = TokioClock::new();
        let cancel = CancellationToken::new();
        let (events_tx, events) = mpsc::unbounded_channel();
        let (out, out_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands) = mpsc::unbounded_channel();

        let fetch_cancel = cancel.child_token();
        let scheduler = SegmentScheduler::new(
            net.clone(),
            clock,
            config.scheduler,
            queues.clone(),
            events_tx.clone(),
            fetch_cancel.clone(),
        )?;

        let session = Session {
            net,
            scheduler: Arc::new(scheduler),
            fetch_cancel,
            commands_tx,
            commands,
            events_tx,
            events,
            control: BufferControl::new(config.buffer_control, config.params),
            params: config.params,
            player,
            queues,
            out,
            cancel,
            clock,
        };
        Ok((session, out_rx))
    }

    /// Token that stops [`run`](Self::run)
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            commands: self.commands_tx.clone(),
        }
    }

    pub fn player(&self) -> &P {
        &self.player
    }

    pub fn control(&self) -> &BufferControl {
        &self.control
    }

    pub fn scheduler(&self) -> &SegmentScheduler {
        &self.scheduler
    }

    /// Clock the controller's timestamps are taken from
    pub fn clock(&self) -> TokioClock {
        self.clock
    }

    /// Play until cancelled or the scheduler fails
    pub async fn run(&mut self) -> Result<(), ClientError> {
        let Session {
            net,
            scheduler,
            fetch_cancel,
            commands_tx: _,
            commands,
            events_tx,
            events,
            control,
            params,
            player,
            queues,
            out,
            cancel,
            clock,
        } = self;

        control.on_new_stream_start(clock.now(), *params);

        let mut ticker = tokio::time::interval(control.config().tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut fetching = start(scheduler);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Err(ClientError::Cancelled),
                result = &mut fetching => return result,
                Some(event) = events.recv() => handle_event(event, control, out),
                Some(command) = commands.recv() => match command {
                    SessionCommand::SwitchStream { layout, params: next } => {
                        // Samples of the old stream still count towards its history
                        while let Ok(event) = events.try_recv() {
                            handle_event(event, control, out);
                        }
                        fetch_cancel.cancel();

                        let mut config = scheduler.config().clone();
                        config.layout = layout;
                        let token = cancel.child_token();
                        *scheduler = Arc::new(SegmentScheduler::new(
                            net.clone(),
                            *clock,
                            config,
                            queues.clone(),
                            events_tx.clone(),
                            token.clone(),
                        )?);
                        *fetch_cancel = token;
                        // Dropping the old run aborts its fetches
                        fetching = start(scheduler);

                        for queue in queues.iter() {
                            queue.lock().reset();
                        }
                        *params = next;
                        control.on_new_stream_start(clock.now(), next);
                        tracing::info!("Switched to {:?}", layout);
                    }
                },
                _ = ticker.tick() => {
                    drain_all(queues, events_tx);
                    let position = player.current_time();
                    for (stream, queue) in queues.iter().enumerate() {
                        let pruned = queue.lock().prune(position);
                        match pruned {
                            Ok(Some(range)) => {
                                tracing::debug!("Queue {}: pruned {:?}", stream, range)
                            }
                            Ok(None) => {}
                            Err(e) => tracing::warn!("Queue {}: prune failed: {}", stream, e),
                        }
                    }
                    control.tick(clock.now(), player, &mut Forward { out });
                }
            }
        }
    }
}

fn start(scheduler: &Arc<SegmentScheduler>) -> BoxFuture<'static, Result<(), ClientError>> {
    let scheduler = scheduler.clone();
    async move { scheduler.run().await }.boxed()
}

fn handle_event(
    event: SchedulerEvent,
    control: &mut BufferControl,
    out: &mpsc::UnboundedSender<SessionEvent>,
) {
    let forward = match event {
        SchedulerEvent::Timestamp(info) => {
            control.on_timestamp(info);
            None
        }
        SchedulerEvent::Control(message) => Some(SessionEvent::Control(message)),
        SchedulerEvent::DowngradeRecommended { index, elapsed } => Some(SessionEvent::Downgrade(
            DowngradeReason::SlowDownload { index, elapsed },
        )),
        SchedulerEvent::SegmentFailed { index, error } => {
            Some(SessionEvent::SegmentFailed { index, error })
        }
        SchedulerEvent::SegmentApplied { stream, applied } => {
            Some(SessionEvent::SegmentApplied { stream, applied })
        }
        SchedulerEvent::DescriptorFailed { error } => {
            tracing::debug!("Continuing on the previous descriptor: {}", error);
            None
        }
        SchedulerEvent::SegmentStarted { index } => {
            tracing::trace!("Segment {} started", index);
            None
        }
        SchedulerEvent::SegmentComplete { index, bytes, elapsed } => {
            tracing::trace!("Segment {} complete: {} bytes in {:?}", index, bytes, elapsed);
            None
        }
        SchedulerEvent::SegmentSuperseded { index } => {
            tracing::trace!("Segment {} superseded", index);
            None
        }
        SchedulerEvent::SegmentsSkipped { skipped } => {
            tracing::debug!("Segments {:?} skipped", skipped);
            None
        }
    };
    if let Some(event) = forward {
        let _ = out.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::SegmentLayout;
    use crate::sink::shared_queue;
    use crate::test_util::{Canned, FakeNet, IdlePlayer, RecordingBuffer};
    use bytes::BytesMut;
    use url::Url;
    use weft_protocol::{EncoderConfig, InterleaveEncoder, StreamIndex, TickAction};

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    fn session_config(layout: SegmentLayout) -> SessionConfig {
        SessionConfig {
            scheduler: SchedulerConfig::new(Url::parse("http://origin.test/live/").unwrap(), layout),
            buffer_control: BufferControlConfig::default(),
            params: BufferParams::default(),
        }
    }

    async fn run_for<P: PlaybackClock + Send>(
        session: &mut Session<P>,
        duration: Duration,
    ) -> Result<(), ClientError> {
        let cancel = session.cancel_token();
        tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            cancel.cancel();
        });
        session.run().await
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_ticks_and_forwards() {
        let net = FakeNet::default();
        net.descriptor("/live/chunk-stream0-index.json", 1, 0.0);
        for index in 1..=2 {
            net.serve(
                &format!("/live/chunk-stream0-{}.m4s", index),
                Canned::body(format!("seg{}", index)),
            );
        }

        let buffer = RecordingBuffer::default();
        let queues = vec![shared_queue(buffer.clone(), ms(1000))];
        let (mut session, mut rx) = Session::new(
            Arc::new(net),
            session_config(SegmentLayout::Plain { stream: 0 }),
            queues,
            IdlePlayer::default(),
        )
        .unwrap();

        let result = run_for(&mut session, ms(2600)).await;
        assert!(matches!(result, Err(ClientError::Cancelled)));
        assert_eq!(buffer.bytes(), b"seg1seg2".to_vec());

        let events = drain(&mut rx);
        let ticks: Vec<TickAction> = events
            .iter()
            .filter_map(|e| match e {
                SessionEvent::Tick(report) => Some(report.action),
                _ => None,
            })
            .collect();
        // Ticks every 250ms; the initial seek waits for minimum_init_time
        assert!(ticks.len() >= 10);
        assert_eq!(ticks[0], TickAction::AwaitingInit);
        assert!(ticks.contains(&TickAction::NoSeekableRange));

        let applied: Vec<u64> = events
            .iter()
            .filter_map(|e| match e {
                SessionEvent::SegmentApplied { applied, .. } => Some(applied.index),
                _ => None,
            })
            .collect();
        // Segment 3 failed; its empty slot is still closed
        assert_eq!(applied, vec![1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_collects_timestamps_and_control() {
        let net = FakeNet::default();
        net.descriptor("/live/chunk-stream0-index.json", 3, 0.0);

        let mut encoder = InterleaveEncoder::new(EncoderConfig::default());
        let video = StreamIndex::data(0).unwrap();
        let mut body = BytesMut::new();
        body.extend_from_slice(&encoder.encode_data(video, b"frame", ms(0)));
        body.extend_from_slice(&encoder.encode_control(
            &ControlMessage::UserString("hello".to_string()),
            ms(10),
        ));
        body.extend_from_slice(&encoder.encode_end_of_stream(video, ms(20)));
        net.serve("/live/interleaved0-3", Canned::body(body.freeze()));

        let queues = vec![shared_queue(RecordingBuffer::default(), ms(1000))];
        let (mut session, mut rx) = Session::new(
            Arc::new(net),
            session_config(SegmentLayout::Interleaved { stream: 0 }),
            queues,
            IdlePlayer::default(),
        )
        .unwrap();

        let _ = run_for(&mut session, ms(600)).await;

        // The only sample follows the stream start
        assert_eq!(session.control().network_stats().count, 0);
        assert!(session.control().conservative_target().is_some());
        assert_eq!(session.control().target(), ms(1500));

        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(
            e,
            SessionEvent::Control(ControlMessage::UserString(s)) if s == "hello"
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_download_forwarded_as_downgrade() {
        let net = FakeNet::default();
        net.descriptor("/live/chunk-stream0-index.json", 1, 0.0);
        net.serve(
            "/live/chunk-stream0-1.m4s",
            Canned {
                header_delay: ms(1200),
                ..Canned::body("slow")
            },
        );

        let queues = vec![shared_queue(RecordingBuffer::default(), ms(1000))];
        let (mut session, mut rx) = Session::new(
            Arc::new(net),
            session_config(SegmentLayout::Plain { stream: 0 }),
            queues,
            IdlePlayer::default(),
        )
        .unwrap();

        let _ = run_for(&mut session, ms(1500)).await;

        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(
            e,
            SessionEvent::Downgrade(DowngradeReason::SlowDownload { index: 1, .. })
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn test_switch_stream_restarts_playback() {
        let net = FakeNet::default();
        net.descriptor("/live/chunk-stream0-index.json", 1, 0.0);
        net.descriptor("/live/chunk-stream1-index.json", 20, 0.0);
        for index in 1..=5 {
            net.serve(
                &format!("/live/chunk-stream0-{}.m4s", index),
                Canned::body(format!("hi{}", index)),
            );
        }
        for index in 20..=25 {
            net.serve(
                &format!("/live/chunk-stream1-{}.m4s", index),
                Canned::body(format!("lo{}", index)),
            );
        }

        // With no samples the target is the initial buffer, past the threshold
        let params = BufferParams {
            initial_buffer: ms(4000),
            ..Default::default()
        };
        let mut config = session_config(SegmentLayout::Plain { stream: 0 });
        config.params = params;

        let buffer = RecordingBuffer::default();
        let queues = vec![shared_queue(buffer.clone(), ms(1000))];
        let (mut session, mut rx) =
            Session::new(Arc::new(net.clone()), config, queues, IdlePlayer::default()).unwrap();

        let handle = session.handle();
        let invalid = BufferParams {
            seek_buffer: Duration::ZERO,
            ..Default::default()
        };
        assert!(matches!(
            handle.switch_stream(SegmentLayout::Plain { stream: 1 }, invalid),
            Err(ClientError::Descriptor(_))
        ));

        let switcher = handle.clone();
        tokio::spawn(async move {
            tokio::time::sleep(ms(1500)).await;
            switcher
                .switch_stream(SegmentLayout::Plain { stream: 1 }, params)
                .unwrap();
        });
        let result = run_for(&mut session, ms(3000)).await;
        assert!(matches!(result, Err(ClientError::Cancelled)));

        assert_eq!(buffer.bytes(), b"hi1hi2lo20lo21".to_vec());
        assert_eq!(net.request_count("/live/chunk-stream1-index.json"), 1);
        assert!(!net
            .requests()
            .contains(&"/live/chunk-stream0-3.m4s".to_string()));

        let events = drain(&mut rx);
        // The latch re-arms on the new stream
        let downgrades = events
            .iter()
            .filter(|e| {
                matches!(
                    e,
                    SessionEvent::Downgrade(DowngradeReason::BufferTarget { .. })
                )
            })
            .count();
        assert_eq!(downgrades, 2);
        assert!(session.control().is_waiting_for_new_stream());

        // minimum_init_time counts from the switch again
        assert!(events.iter().any(|e| matches!(
            e,
            SessionEvent::Tick(report)
                if report.now >= ms(2250) && report.action == TickAction::AwaitingInit
        )));

        drop(session);
        assert!(matches!(
            handle.switch_stream(SegmentLayout::Plain { stream: 0 }, params),
            Err(ClientError::Cancelled)
        ));
    }

    #[test]
    fn test_invalid_params_rejected() {
        let mut config = session_config(SegmentLayout::Plain { stream: 0 });
        config.params.seek_buffer = Duration::ZERO;
        let queues = vec![shared_queue(RecordingBuffer::default(), ms(1000))];
        let result = Session::new(
            Arc::new(FakeNet::default()),
            config,
            queues,
            IdlePlayer::default(),
        );
        assert!(matches!(result, Err(ClientError::Descriptor(_))));
    }
}
