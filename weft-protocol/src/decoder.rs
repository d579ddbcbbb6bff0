//! Interleave decoder
//!
//! An incremental state machine that consumes byte buffers of any size and
//! alignment and reports demultiplexed data, end-of-stream markers, send
//! timestamps and control messages to an [`InterleaveHandler`].
//!
//! Media bytes are forwarded as soon as they arrive, so a data chunk may be
//! reported in several pieces. Control chunks are held back until their
//! whole body is available, up to a size limit; larger control chunks are
//! skipped (padding silently, anything else with a warning). Truncated
//! input never fails; the decoder simply waits for more bytes.

use crate::checksum::RollingChecksum;
use crate::chunk::{ChunkHeader, ContentId, StreamIndex};
use crate::control::{ControlMessage, ControlType};
use bytes::{Buf, Bytes, BytesMut};
use std::time::Duration;

/// Largest control body buffered by default
pub const DEFAULT_MAX_CONTROL_LEN: u64 = 1 << 20;

/// Timing sample taken from a timestamped chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimestampInfo {
    /// Server send time (ms, server epoch)
    pub sent_ms: i64,
    /// Local arrival time of the chunk's last byte (ms, client epoch)
    pub end_received_ms: i64,
    /// First sample after a new stream started
    pub first_for_interleave: bool,
}

impl TimestampInfo {
    /// Observed delay including the (constant) clock offset between ends
    pub fn delay_ms(&self) -> i64 {
        self.end_received_ms - self.sent_ms
    }
}

/// Consumer of decoded interleave events
pub trait InterleaveHandler {
    /// Media bytes for a data stream (may be a fragment of a chunk)
    fn on_data(&mut self, stream: StreamIndex, data: Bytes);

    /// A data stream ended
    fn on_end_of_stream(&mut self, stream: StreamIndex);

    /// A timestamped chunk finished arriving
    fn on_timestamp(&mut self, _info: TimestampInfo) {}

    /// A complete, non-discard control message
    fn on_control(&mut self, _message: ControlMessage) {}
}

/// Decoded event, for consumers that prefer collecting to callbacks
#[derive(Debug, Clone, PartialEq)]
pub enum DecodeEvent {
    Data(StreamIndex, Bytes),
    EndOfStream(StreamIndex),
    Timestamp(TimestampInfo),
    Control(ControlMessage),
}

impl InterleaveHandler for Vec<DecodeEvent> {
    fn on_data(&mut self, stream: StreamIndex, data: Bytes) {
        self.push(DecodeEvent::Data(stream, data));
    }

    fn on_end_of_stream(&mut self, stream: StreamIndex) {
        self.push(DecodeEvent::EndOfStream(stream));
    }

    fn on_timestamp(&mut self, info: TimestampInfo) {
        self.push(DecodeEvent::Timestamp(info));
    }

    fn on_control(&mut self, message: ControlMessage) {
        self.push(DecodeEvent::Control(message));
    }
}

/// Decoder statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecoderStats {
    /// Complete chunks seen
    pub chunks: u64,
    /// Bytes fed in
    pub bytes: u64,
    /// Timestamp samples reported
    pub timestamps: u64,
    /// Control messages delivered
    pub control_messages: u64,
    /// Discard (padding) chunks dropped
    pub discarded: u64,
    /// Non-padding control chunks dropped for exceeding the size limit
    pub oversized_control: u64,
}

#[derive(Debug, Clone, Copy)]
enum State {
    AwaitingHeader,
    InBody {
        stream: StreamIndex,
        remaining: u64,
        timestamp_us: Option<u64>,
    },
}

/// Incremental interleave decoder
pub struct InterleaveDecoder {
    state: State,
    /// Partial header carried across calls
    header_buf: BytesMut,
    /// Control chunk body being accumulated
    control_buf: BytesMut,
    max_control_len: u64,
    /// Current control chunk is too large; only its tag byte is kept
    control_oversized: bool,
    /// Whether the next timestamp is the first after a stream start
    first_pending: bool,
    checksum: Option<RollingChecksum>,
    stats: DecoderStats,
}

impl InterleaveDecoder {
    pub fn new() -> Self {
        InterleaveDecoder {
            state: State::AwaitingHeader,
            header_buf: BytesMut::with_capacity(crate::chunk::MAX_HEADER_SIZE),
            control_buf: BytesMut::new(),
            max_control_len: DEFAULT_MAX_CONTROL_LEN,
            control_oversized: false,
            first_pending: true,
            checksum: None,
            stats: DecoderStats::default(),
        }
    }

    /// Whether this decoder's first timestamp counts as the first after a
    /// stream start (default `true`)
    pub fn with_first_timestamp(mut self, first: bool) -> Self {
        self.first_pending = first;
        self
    }

    /// Skip control chunks with a body longer than `max` bytes
    pub fn with_max_control_len(mut self, max: u64) -> Self {
        self.max_control_len = max;
        self
    }

    /// Keep a debug checksum of every byte fed in
    pub fn with_checksum(mut self) -> Self {
        self.checksum = Some(RollingChecksum::new());
        self
    }

    /// Consume `data`, which arrived at local time `now`
    pub fn feed<H: InterleaveHandler + ?Sized>(
        &mut self,
        mut data: Bytes,
        now: Duration,
        handler: &mut H,
    ) {
        self.stats.bytes += data.len() as u64;
        if let Some(checksum) = self.checksum.as_mut() {
            checksum.update(&data);
        }

        while !data.is_empty() {
            match self.state {
                State::AwaitingHeader => {
                    let Some(header) = self.take_header(&mut data) else {
                        return;
                    };
                    self.start_chunk(header, now, handler);
                }
                State::InBody {
                    stream,
                    remaining,
                    timestamp_us,
                } => {
                    let take = remaining.min(data.len() as u64) as usize;
                    let piece = data.split_to(take);
                    let remaining = remaining - take as u64;

                    if stream.is_control() {
                        if !self.control_oversized {
                            self.control_buf.extend_from_slice(&piece);
                        } else if self.control_buf.is_empty() {
                            self.control_buf.extend_from_slice(&piece[..1]);
                        }
                    } else {
                        handler.on_data(stream, piece);
                    }

                    if remaining == 0 {
                        self.state = State::AwaitingHeader;
                        self.finish_chunk(stream, timestamp_us, false, now, handler);
                    } else {
                        self.state = State::InBody {
                            stream,
                            remaining,
                            timestamp_us,
                        };
                    }
                }
            }
        }
    }

    /// Check if the decoder sits exactly on a chunk boundary
    pub fn is_at_boundary(&self) -> bool {
        matches!(self.state, State::AwaitingHeader) && self.header_buf.is_empty()
    }

    pub fn stats(&self) -> DecoderStats {
        self.stats
    }

    /// Debug checksum of everything fed in so far
    pub fn checksum(&self) -> Option<u32> {
        self.checksum.map(|c| c.value())
    }

    /// Pull a complete header off the front of `data`, buffering a partial one
    fn take_header(&mut self, data: &mut Bytes) -> Option<ChunkHeader> {
        if self.header_buf.is_empty() {
            let needed = ContentId::from_byte(data[0]).header_len();
            if data.len() >= needed {
                let (header, _) = ChunkHeader::from_bytes(&data[..needed]).ok()?;
                data.advance(needed);
                return Some(header);
            }
        }

        let first = self.header_buf.first().copied().unwrap_or(data[0]);
        let needed = ContentId::from_byte(first).header_len();
        let take = (needed - self.header_buf.len()).min(data.len());
        self.header_buf.extend_from_slice(&data.split_to(take));

        if self.header_buf.len() < needed {
            return None;
        }

        let parsed = ChunkHeader::from_bytes(&self.header_buf).ok();
        self.header_buf.clear();
        parsed.map(|(header, _)| header)
    }

    fn start_chunk<H: InterleaveHandler + ?Sized>(
        &mut self,
        header: ChunkHeader,
        now: Duration,
        handler: &mut H,
    ) {
        if header.length == 0 {
            self.finish_chunk(header.stream, header.timestamp_us, true, now, handler);
            return;
        }

        self.control_buf.clear();
        self.control_oversized =
            header.stream.is_control() && header.length > self.max_control_len;
        self.state = State::InBody {
            stream: header.stream,
            remaining: header.length,
            timestamp_us: header.timestamp_us,
        };
    }

    fn finish_chunk<H: InterleaveHandler + ?Sized>(
        &mut self,
        stream: StreamIndex,
        timestamp_us: Option<u64>,
        empty: bool,
        now: Duration,
        handler: &mut H,
    ) {
        self.stats.chunks += 1;

        if stream.is_control() && self.control_oversized {
            self.control_oversized = false;
            let tag = self.control_buf.split().first().copied();
            if tag == Some(ControlType::Discard.as_u8()) {
                self.stats.discarded += 1;
            } else {
                tracing::warn!(
                    "Skipped control chunk over {} bytes (type {:?})",
                    self.max_control_len,
                    tag.and_then(ControlType::from_u8)
                );
                self.stats.oversized_control += 1;
            }
        } else if stream.is_control() {
            let body = self.control_buf.split().freeze();
            // An empty control chunk carries no type tag
            if !body.is_empty() {
                match ControlMessage::from_bytes(&body) {
                    Some(ControlMessage::Discard(_)) => self.stats.discarded += 1,
                    Some(message) => {
                        self.stats.control_messages += 1;
                        handler.on_control(message);
                    }
                    None => {}
                }
            }
        } else if empty {
            handler.on_end_of_stream(stream);
        }

        if let Some(us) = timestamp_us {
            let info = TimestampInfo {
                sent_ms: (us / 1000) as i64,
                end_received_ms: now.as_millis() as i64,
                first_for_interleave: self.first_pending,
            };
            self.first_pending = false;
            self.stats.timestamps += 1;
            handler.on_timestamp(info);
        }
    }
}

impl Default for InterleaveDecoder {
    fn default() -> Self {
        Self::new()
    }
}
