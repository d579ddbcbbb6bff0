//! Headless playback for `weft-play`
//!
//! Media is written to one file per stream instead of being decoded, and
//! the playback clock is simulated: every applied segment extends the
//! buffered range by one segment duration and the playhead advances in
//! real time while media is buffered.

use bytes::Bytes;
use parking_lot::Mutex;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use weft_io::Clock;
use weft_protocol::{AppendBuffer, AppendError, PlaybackClock, TimeRange};

/// Append buffer that stores bytes in a file
pub struct FileAppendBuffer {
    writer: BufWriter<File>,
    appended: u64,
}

impl FileAppendBuffer {
    pub fn create(path: impl AsRef<Path>) -> io::Result<Self> {
        Ok(FileAppendBuffer {
            writer: BufWriter::new(File::create(path)?),
            appended: 0,
        })
    }

    pub fn appended(&self) -> u64 {
        self.appended
    }
}

impl AppendBuffer for FileAppendBuffer {
    fn is_updating(&self) -> bool {
        false
    }

    fn append(&mut self, data: Bytes) -> Result<(), AppendError> {
        self.writer
            .write_all(&data)
            .map_err(|e| AppendError::Rejected(e.to_string()))?;
        self.appended += data.len() as u64;
        Ok(())
    }

    fn buffered(&self) -> Option<TimeRange> {
        None
    }

    fn remove(&mut self, _start: f64, _end: f64) -> Result<(), AppendError> {
        // Written media is kept
        Ok(())
    }
}

impl Drop for FileAppendBuffer {
    fn drop(&mut self) {
        if let Err(e) = self.writer.flush() {
            tracing::warn!("Failed to flush received media: {}", e);
        }
    }
}

#[derive(Debug, Default)]
struct PlayerState {
    buffered: Option<TimeRange>,
    /// Playhead at `anchor`
    position: f64,
    anchor: Duration,
    seeks: u64,
    stalls: u64,
    stalled: bool,
}

/// Simulated playback clock; clones share the same state
#[derive(Clone)]
pub struct SimulatedPlayer<C: Clock + Clone> {
    clock: C,
    segment_duration: f64,
    state: Arc<Mutex<PlayerState>>,
}

impl<C: Clock + Clone> SimulatedPlayer<C> {
    pub fn new(clock: C, segment_duration: Duration) -> Self {
        SimulatedPlayer {
            clock,
            segment_duration: segment_duration.as_secs_f64(),
            state: Arc::new(Mutex::new(PlayerState::default())),
        }
    }

    /// One more segment of media is playable
    pub fn segment_applied(&self) {
        let now = self.clock.now();
        let mut state = self.state.lock();
        Self::advance(&mut state, now);
        state.buffered = Some(match state.buffered {
            Some(range) => TimeRange::new(range.start, range.end + self.segment_duration),
            None => TimeRange::new(0.0, self.segment_duration),
        });
    }

    pub fn seeks(&self) -> u64 {
        self.state.lock().seeks
    }

    /// Times playback ran out of buffered media
    pub fn stalls(&self) -> u64 {
        self.state.lock().stalls
    }

    /// Move the playhead to `now`, stopping at the end of buffered media
    fn advance(state: &mut PlayerState, now: Duration) {
        let elapsed = now.saturating_sub(state.anchor).as_secs_f64();
        state.anchor = now;

        let Some(range) = state.buffered else {
            return;
        };
        let target = state.position + elapsed;
        if target >= range.end {
            if !state.stalled && elapsed > 0.0 {
                state.stalls += 1;
                tracing::debug!("Playback stalled at {:.3}", range.end);
            }
            state.stalled = true;
            state.position = range.end;
        } else {
            state.stalled = false;
            state.position = target.max(range.start);
        }
    }
}

impl<C: Clock + Clone> PlaybackClock for SimulatedPlayer<C> {
    fn current_time(&self) -> f64 {
        let now = self.clock.now();
        let mut state = self.state.lock();
        Self::advance(&mut state, now);
        state.position
    }

    fn buffered(&self) -> Option<TimeRange> {
        self.state.lock().buffered
    }

    fn seekable(&self) -> Option<TimeRange> {
        self.state.lock().buffered
    }

    fn seek(&mut self, to: f64) {
        let now = self.clock.now();
        let mut state = self.state.lock();
        Self::advance(&mut state, now);
        state.position = to;
        state.seeks += 1;
    }
}
