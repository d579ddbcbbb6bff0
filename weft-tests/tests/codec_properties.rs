//! Property-based tests for the interleave codec
//!
//! Whatever the encoder produces must decode to the same per-stream byte
//! sequences, end-of-stream markers and control messages, no matter how the
//! byte stream is cut into buffers on the way.

use bytes::{Bytes, BytesMut};
use proptest::prelude::*;
use std::collections::BTreeMap;
use std::time::Duration;
use weft_protocol::{
    ChunkHeader, ControlMessage, DecodeEvent, EncoderConfig, InterleaveDecoder, InterleaveEncoder,
    StreamIndex, MAX_DATA_STREAMS,
};

/// One encoder input
#[derive(Debug, Clone)]
enum Input {
    /// Payload for a data stream; empty means end of stream
    Data(usize, Vec<u8>),
    Control(String),
}

// Property test strategies

fn input_strategy() -> impl Strategy<Value = Input> {
    prop_oneof![
        8 => (0..MAX_DATA_STREAMS, prop::collection::vec(any::<u8>(), 1..600))
            .prop_map(|(s, data)| Input::Data(s, data)),
        1 => (0..MAX_DATA_STREAMS).prop_map(|s| Input::Data(s, Vec::new())),
        1 => "[a-z ]{1,40}".prop_map(Input::Control),
    ]
}

/// Split points for a buffer of unknown length, as fractions
fn cuts_strategy() -> impl Strategy<Value = Vec<f64>> {
    prop::collection::vec(0.0f64..1.0, 0..40)
}

/// Per-stream payload, grouped by end-of-stream markers
type StreamView = BTreeMap<u8, Vec<Vec<u8>>>;

#[derive(Debug, Default, PartialEq)]
struct Decoded {
    streams: StreamView,
    control: Vec<ControlMessage>,
    timestamps: Vec<i64>,
}

fn encode(inputs: &[Input], step_ms: u64) -> (Bytes, Decoded, u64) {
    let mut encoder = InterleaveEncoder::new(EncoderConfig {
        timestamp_interval: Duration::from_millis(50),
        ..Default::default()
    });
    let mut wire = BytesMut::new();
    let mut expected = Decoded::default();

    for (i, input) in inputs.iter().enumerate() {
        let now = Duration::from_millis(i as u64 * step_ms);
        let before = encoder.stats().timestamps;
        match input {
            Input::Data(s, data) => {
                let stream = StreamIndex::data(*s).unwrap();
                wire.extend_from_slice(&encoder.encode_data(stream, data, now));
                let groups = expected.streams.entry(*s as u8).or_insert_with(|| vec![Vec::new()]);
                if data.is_empty() {
                    groups.push(Vec::new());
                } else if let Some(last) = groups.last_mut() {
                    last.extend_from_slice(data);
                }
            }
            Input::Control(text) => {
                let message = ControlMessage::UserString(text.clone());
                wire.extend_from_slice(&encoder.encode_control(&message, now));
                expected.control.push(message);
            }
        }
        if encoder.stats().timestamps > before {
            expected.timestamps.push(now.as_millis() as i64);
        }
    }

    let chunks = encoder.stats().chunks;
    (wire.freeze(), expected, chunks)
}

fn decode_pieces(pieces: &[Bytes]) -> (Decoded, InterleaveDecoder) {
    let mut decoder = InterleaveDecoder::new();
    let mut events = Vec::new();
    for piece in pieces {
        decoder.feed(piece.clone(), Duration::ZERO, &mut events);
    }

    let mut decoded = Decoded::default();
    for event in events {
        match event {
            DecodeEvent::Data(stream, data) => {
                let groups = decoded
                    .streams
                    .entry(stream.as_u8())
                    .or_insert_with(|| vec![Vec::new()]);
                if let Some(last) = groups.last_mut() {
                    last.extend_from_slice(&data);
                }
            }
            DecodeEvent::EndOfStream(stream) => {
                decoded
                    .streams
                    .entry(stream.as_u8())
                    .or_insert_with(|| vec![Vec::new()])
                    .push(Vec::new());
            }
            DecodeEvent::Control(message) => decoded.control.push(message),
            DecodeEvent::Timestamp(info) => decoded.timestamps.push(info.sent_ms),
        }
    }
    (decoded, decoder)
}

fn split(wire: &Bytes, cuts: &[f64]) -> Vec<Bytes> {
    let mut points: Vec<usize> = cuts
        .iter()
        .map(|f| (f * wire.len() as f64) as usize)
        .collect();
    points.push(0);
    points.push(wire.len());
    points.sort_unstable();
    points.dedup();
    points.windows(2).map(|w| wire.slice(w[0]..w[1])).collect()
}

proptest! {
    #[test]
    fn prop_any_fragmentation_decodes_identically(
        inputs in prop::collection::vec(input_strategy(), 1..60),
        cuts in cuts_strategy(),
        step_ms in 0u64..120,
    ) {
        let (wire, expected, chunks) = encode(&inputs, step_ms);
        let (decoded, decoder) = decode_pieces(&split(&wire, &cuts));

        prop_assert_eq!(&decoded, &expected);
        prop_assert!(decoder.is_at_boundary());
        prop_assert_eq!(decoder.stats().chunks, chunks);
        prop_assert_eq!(decoder.stats().bytes, wire.len() as u64);
    }

    #[test]
    fn prop_byte_at_a_time_matches_whole_buffer(
        inputs in prop::collection::vec(input_strategy(), 1..20),
    ) {
        let (wire, _, _) = encode(&inputs, 30);
        let bytes: Vec<Bytes> = (0..wire.len()).map(|i| wire.slice(i..i + 1)).collect();

        let (whole, _) = decode_pieces(&[wire.clone()]);
        let (single, _) = decode_pieces(&bytes);
        prop_assert_eq!(whole, single);
    }

    #[test]
    fn prop_truncated_input_never_overreads(
        inputs in prop::collection::vec(input_strategy(), 1..20),
        keep in 0.0f64..1.0,
    ) {
        let (wire, _, _) = encode(&inputs, 10);
        let cut = (keep * wire.len() as f64) as usize;
        let (decoded, decoder) = decode_pieces(&[wire.slice(..cut)]);

        let delivered: usize = decoded
            .streams
            .values()
            .flat_map(|groups| groups.iter().map(Vec::len))
            .sum();
        prop_assert!(delivered <= cut);
        prop_assert_eq!(decoder.stats().bytes, cut as u64);
    }

    #[test]
    fn prop_header_uses_smallest_width(
        stream in 0..MAX_DATA_STREAMS,
        length in prop_oneof![0u64..=255, 256u64..=65_535, 65_536u64..=u32::MAX as u64, any::<u64>()],
        timestamp in prop::option::of(any::<u64>()),
    ) {
        let header = ChunkHeader::new(StreamIndex::data(stream).unwrap(), length, timestamp);
        let mut buf = BytesMut::new();
        header.to_bytes(&mut buf);

        let width = if length <= 0xFF {
            1
        } else if length <= 0xFFFF {
            2
        } else if length <= 0xFFFF_FFFF {
            4
        } else {
            8
        };
        prop_assert_eq!(buf.len(), 1 + width + if timestamp.is_some() { 8 } else { 0 });
        prop_assert_eq!(ChunkHeader::from_bytes(&buf).unwrap(), (header, buf.len()));
    }
}

const TWO_STREAMS: [u8; 16] = [
    0x00, 0x04, 0x00, 0x01, 0x02, 0x03, 0x01, 0x04, 0x10, 0x11, 0x12, 0x13, 0x00, 0x00, 0x01,
    0x00,
];

#[test]
fn test_two_streams_every_split() {
    let wire = Bytes::from_static(&TWO_STREAMS);
    let mut expected = StreamView::new();
    expected.insert(0, vec![vec![0x00, 0x01, 0x02, 0x03], Vec::new()]);
    expected.insert(1, vec![vec![0x10, 0x11, 0x12, 0x13], Vec::new()]);

    for a in 0..=wire.len() {
        for b in a..=wire.len() {
            let pieces = [wire.slice(..a), wire.slice(a..b), wire.slice(b..)];
            let (decoded, decoder) = decode_pieces(&pieces);
            assert_eq!(decoded.streams, expected, "split at {} / {}", a, b);
            assert!(decoded.timestamps.is_empty());
            assert!(decoder.is_at_boundary());
        }
    }
}

#[test]
fn test_two_streams_event_order() {
    let mut decoder = InterleaveDecoder::new();
    let mut events = Vec::new();
    for &byte in TWO_STREAMS.iter() {
        decoder.feed(Bytes::copy_from_slice(&[byte]), Duration::ZERO, &mut events);
    }

    // Fragments of the same chunk come in order and never interleave
    let order: Vec<String> = events
        .iter()
        .map(|e| match e {
            DecodeEvent::Data(s, _) => format!("{}:data", s.as_u8()),
            DecodeEvent::EndOfStream(s) => format!("{}:eos", s.as_u8()),
            other => format!("{:?}", other),
        })
        .fold(Vec::new(), |mut acc, label| {
            if acc.last() != Some(&label) {
                acc.push(label);
            }
            acc
        });
    assert_eq!(order, vec!["0:data", "1:data", "0:eos", "1:eos"]);
}

#[test]
fn test_end_of_stream_is_repeatable() {
    let mut encoder = InterleaveEncoder::new(EncoderConfig::default());
    let stream = StreamIndex::data(4).unwrap();
    let mut wire = BytesMut::new();
    wire.extend_from_slice(&encoder.encode_data(stream, b"tail", Duration::ZERO));
    wire.extend_from_slice(&encoder.encode_end_of_stream(stream, Duration::ZERO));
    wire.extend_from_slice(&encoder.encode_end_of_stream(stream, Duration::ZERO));

    let (decoded, _) = decode_pieces(&[wire.freeze()]);
    assert_eq!(
        decoded.streams.get(&4),
        Some(&vec![b"tail".to_vec(), Vec::new(), Vec::new()])
    );
}
