//! Interleave encoder
//!
//! Frames chunks from up to 31 source streams plus the control channel into
//! one byte stream. The first chunk of the interleave always carries a send
//! timestamp; after that at most one chunk per `timestamp_interval` does.

use crate::checksum::RollingChecksum;
use crate::chunk::{ChunkHeader, StreamIndex, WidthClass};
use crate::control::ControlMessage;
use crate::padding::{MinRateConfig, MinRatePadding};
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Encoder settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncoderConfig {
    /// Minimum wall-clock gap between two timestamped chunks
    #[serde(with = "crate::serde_millis")]
    pub timestamp_interval: Duration,
    /// Optional minimum-rate padding
    pub min_rate: Option<MinRateConfig>,
    /// Keep a debug checksum of every byte produced
    #[serde(default)]
    pub checksum: bool,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        EncoderConfig {
            timestamp_interval: Duration::from_millis(100),
            min_rate: None,
            checksum: false,
        }
    }
}

/// Encoder statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EncoderStats {
    /// Chunks produced (padding included)
    pub chunks: u64,
    /// Bytes produced (padding included)
    pub bytes: u64,
    /// Chunks carrying a timestamp
    pub timestamps: u64,
    /// Discard chunks produced by padding
    pub padding_chunks: u64,
    /// Bytes produced by padding
    pub padding_bytes: u64,
}

/// Interleave encoder
pub struct InterleaveEncoder {
    config: EncoderConfig,
    /// Whether the very first chunk has been produced
    started: bool,
    /// Time of the last timestamped chunk
    last_stamp: Option<Duration>,
    padding: Option<MinRatePadding>,
    checksum: Option<RollingChecksum>,
    stats: EncoderStats,
}

impl InterleaveEncoder {
    pub fn new(config: EncoderConfig) -> Self {
        InterleaveEncoder {
            config,
            started: false,
            last_stamp: None,
            padding: config.min_rate.map(MinRatePadding::new),
            checksum: config.checksum.then(RollingChecksum::new),
            stats: EncoderStats::default(),
        }
    }

    pub fn config(&self) -> &EncoderConfig {
        &self.config
    }

    /// Encode a data chunk for `stream`
    ///
    /// An empty payload is an end-of-stream marker; prefer
    /// [`encode_end_of_stream`](Self::encode_end_of_stream) for clarity.
    pub fn encode_data(&mut self, stream: StreamIndex, payload: &[u8], now: Duration) -> Bytes {
        let stamp = self.should_stamp(payload.len(), now);
        let chunk = self.frame(stream, payload, stamp.then_some(now));
        self.record_real(now, chunk.len());
        chunk
    }

    /// Encode the zero-length end-of-stream marker for `stream`
    pub fn encode_end_of_stream(&mut self, stream: StreamIndex, now: Duration) -> Bytes {
        self.encode_data(stream, &[], now)
    }

    /// Encode a control channel message
    pub fn encode_control(&mut self, message: &ControlMessage, now: Duration) -> Bytes {
        let payload = message.to_bytes();
        let stamp = self.should_stamp(payload.len(), now);
        let chunk = self.frame(StreamIndex::CONTROL, &payload, stamp.then_some(now));
        self.record_real(now, chunk.len());
        chunk
    }

    /// Produce filler if the padding window is below its minimum rate
    ///
    /// Returns `None` when padding is disabled, idle, or not needed.
    pub fn encode_padding(&mut self, now: Duration) -> Option<Bytes> {
        let deficit = self.padding.as_mut()?.deficit(now);
        if deficit == 0 {
            return None;
        }

        let message = ControlMessage::Discard(filler_len(deficit) as usize);
        let chunk = self.frame(StreamIndex::CONTROL, &message.to_bytes(), None);

        self.stats.padding_chunks += 1;
        self.stats.padding_bytes += chunk.len() as u64;
        if let Some(padding) = self.padding.as_mut() {
            padding.record_padding(now, chunk.len() as u64);
        }

        Some(chunk)
    }

    /// Stop padding; call once every source has finished
    pub fn finish(&mut self) {
        if let Some(padding) = self.padding.as_mut() {
            padding.finish();
        }
    }

    /// Re-arm padding after [`finish`](Self::finish) when a source returns
    pub fn resume(&mut self) {
        if let Some(padding) = self.padding.as_mut() {
            padding.resume();
        }
    }

    /// Period at which [`encode_padding`](Self::encode_padding) should be polled
    pub fn padding_period(&self) -> Option<Duration> {
        self.config.min_rate.map(|c| c.evaluation_period())
    }

    pub fn stats(&self) -> EncoderStats {
        self.stats
    }

    /// Debug checksum of everything produced so far
    pub fn checksum(&self) -> Option<u32> {
        self.checksum.map(|c| c.value())
    }

    fn should_stamp(&self, len: usize, now: Duration) -> bool {
        if !self.started {
            return true;
        }
        if len == 0 {
            return false;
        }
        match self.last_stamp {
            None => true,
            Some(last) => now.saturating_sub(last) >= self.config.timestamp_interval,
        }
    }

    fn frame(&mut self, stream: StreamIndex, payload: &[u8], stamp: Option<Duration>) -> Bytes {
        let timestamp_us = stamp.map(|t| t.as_micros() as u64);
        let header = ChunkHeader::new(stream, payload.len() as u64, timestamp_us);

        let mut buf = BytesMut::with_capacity(header.encoded_len() + payload.len());
        header.to_bytes(&mut buf);
        buf.put_slice(payload);

        self.started = true;
        if stamp.is_some() {
            self.last_stamp = stamp;
            self.stats.timestamps += 1;
        }
        self.stats.chunks += 1;
        self.stats.bytes += buf.len() as u64;
        if let Some(checksum) = self.checksum.as_mut() {
            checksum.update(&buf);
        }

        buf.freeze()
    }

    fn record_real(&mut self, now: Duration, bytes: usize) {
        if let Some(padding) = self.padding.as_mut() {
            padding.record_real(now, bytes as u64);
        }
    }
}

/// Smallest discard body whose full chunk covers `deficit` wire bytes
///
/// A discard chunk costs content ID + length field + payload, where the
/// payload is the type tag plus the body.
fn filler_len(deficit: u64) -> u64 {
    let mut lower = 1u64;
    for width in [WidthClass::One, WidthClass::Two, WidthClass::Four] {
        let field = width.byte_len() as u64;
        let upper = (1u64 << (8 * field)) - 1;
        let payload = deficit.saturating_sub(1 + field).max(lower);
        if payload <= upper {
            return payload - 1;
        }
        lower = upper + 1;
    }
    let field = WidthClass::Eight.byte_len() as u64;
    deficit.saturating_sub(1 + field).max(lower) - 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ContentId;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    fn stream(i: usize) -> StreamIndex {
        StreamIndex::data(i).unwrap()
    }

    fn has_timestamp(chunk: &[u8]) -> bool {
        ContentId::from_byte(chunk[0]).has_timestamp
    }

    #[test]
    fn test_first_chunk_stamped() {
        let mut enc = InterleaveEncoder::new(EncoderConfig::default());
        let chunk = enc.encode_data(stream(0), b"abcd", ms(1));

        assert!(has_timestamp(&chunk));
        assert_eq!(chunk.len(), 1 + 1 + 8 + 4);
        assert_eq!(&chunk[2..10], &1_000u64.to_le_bytes());
    }

    #[test]
    fn test_first_chunk_stamped_even_if_empty() {
        let mut enc = InterleaveEncoder::new(EncoderConfig::default());
        let chunk = enc.encode_end_of_stream(stream(3), ms(0));
        assert!(has_timestamp(&chunk));
        assert_eq!(chunk[1], 0);
    }

    #[test]
    fn test_timestamp_interval() {
        let mut enc = InterleaveEncoder::new(EncoderConfig {
            timestamp_interval: ms(100),
            ..Default::default()
        });

        assert!(has_timestamp(&enc.encode_data(stream(0), b"a", ms(0))));
        assert!(!has_timestamp(&enc.encode_data(stream(0), b"b", ms(50))));
        assert!(!has_timestamp(&enc.encode_data(stream(1), b"c", ms(99))));
        assert!(has_timestamp(&enc.encode_data(stream(1), b"d", ms(100))));
        assert!(!has_timestamp(&enc.encode_data(stream(0), b"e", ms(150))));
        assert_eq!(enc.stats().timestamps, 2);
    }

    #[test]
    fn test_end_of_stream_never_stamped_later() {
        let mut enc = InterleaveEncoder::new(EncoderConfig::default());
        enc.encode_data(stream(0), b"a", ms(0));
        let eof = enc.encode_end_of_stream(stream(0), ms(10_000));
        assert!(!has_timestamp(&eof));
        assert_eq!(&eof[..], &[0x00, 0x00]);
    }

    #[test]
    fn test_filler_len_exact() {
        for deficit in [3u64, 10, 257, 258, 300, 65_540, 70_000] {
            let body = filler_len(deficit);
            let payload = body + 1;
            let total = 1 + WidthClass::for_length(payload).byte_len() as u64 + payload;
            assert!(total >= deficit, "deficit {deficit} total {total}");
            assert!(total <= deficit + 1, "deficit {deficit} total {total}");
        }
    }

    #[test]
    fn test_padding_disabled_by_default() {
        let mut enc = InterleaveEncoder::new(EncoderConfig::default());
        enc.encode_data(stream(0), b"a", ms(0));
        assert!(enc.encode_padding(ms(10_000)).is_none());
        assert!(enc.padding_period().is_none());
    }

    #[test]
    fn test_padding_chunk_is_discard() {
        let mut enc = InterleaveEncoder::new(EncoderConfig {
            min_rate: Some(MinRateConfig::new(ms(1000), 1000)),
            ..Default::default()
        });
        let data = enc.encode_data(stream(0), &[0u8; 100], ms(0));
        let pad = enc.encode_padding(ms(500)).unwrap();

        let id = ContentId::from_byte(pad[0]);
        assert!(id.stream.is_control());
        assert!(!id.has_timestamp);
        assert_eq!(data.len() as u64 + pad.len() as u64, 500);
        assert_eq!(enc.stats().padding_bytes, pad.len() as u64);
    }

    #[test]
    fn test_checksum_tracks_output() {
        let mut enc = InterleaveEncoder::new(EncoderConfig {
            checksum: true,
            ..Default::default()
        });
        let chunk = enc.encode_data(stream(0), b"xyz", ms(0));

        let mut expected = RollingChecksum::new();
        expected.update(&chunk);
        assert_eq!(enc.checksum(), Some(expected.value()));
    }
}
