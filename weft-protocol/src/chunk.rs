//! Interleave chunk header
//!
//! Every chunk of an interleave starts with a one-byte content ID, followed by
//! a little-endian length field of 1, 2, 4 or 8 bytes and, when flagged, an
//! 8-byte little-endian send timestamp in microseconds.
//!
//! ```text
//!   7   6   5   4   3   2   1   0
//! +-------+---+-------------------+
//! | width | T |   stream index    |
//! +-------+---+-------------------+
//! ```
//!
//! Stream indices 0-30 carry media data, index 31 is the control channel.
//! All 256 content ID values decode to a valid header shape.

use bytes::{Buf, BufMut, BytesMut};
use std::fmt;
use thiserror::Error;

/// Maximum number of data streams in one interleave
pub const MAX_DATA_STREAMS: usize = 31;

/// Size of the optional send timestamp in bytes
pub const TIMESTAMP_SIZE: usize = 8;

/// Largest possible header: content ID + 8-byte length + timestamp
pub const MAX_HEADER_SIZE: usize = 1 + 8 + TIMESTAMP_SIZE;

/// Stream index bits (0-4 of the content ID)
const STREAM_MASK: u8 = 0x1F;

/// Timestamp flag (bit 5 of the content ID)
const TIMESTAMP_FLAG: u8 = 0x20;

/// Width class position (bits 6-7 of the content ID)
const WIDTH_SHIFT: u8 = 6;

/// Index of a logical stream within an interleave
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamIndex(u8);

impl StreamIndex {
    /// The out-of-band control channel
    pub const CONTROL: StreamIndex = StreamIndex(31);

    /// Create a data stream index (0-30)
    pub fn data(index: usize) -> Result<Self, ChunkError> {
        if index >= MAX_DATA_STREAMS {
            return Err(ChunkError::InvalidStreamIndex(index));
        }
        Ok(StreamIndex(index as u8))
    }

    /// Create an index from raw content ID bits; the value is masked to 5 bits
    #[inline]
    pub fn from_bits(bits: u8) -> Self {
        StreamIndex(bits & STREAM_MASK)
    }

    #[inline]
    pub fn as_u8(self) -> u8 {
        self.0
    }

    #[inline]
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// Check if this is the control channel
    #[inline]
    pub fn is_control(self) -> bool {
        self == Self::CONTROL
    }
}

impl fmt::Display for StreamIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_control() {
            write!(f, "control")
        } else {
            write!(f, "#{}", self.0)
        }
    }
}

/// Byte width of the length field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WidthClass {
    One = 0,
    Two = 1,
    Four = 2,
    Eight = 3,
}

impl WidthClass {
    /// Smallest width whose unsigned range covers `length`
    pub fn for_length(length: u64) -> Self {
        if length <= u8::MAX as u64 {
            WidthClass::One
        } else if length <= u16::MAX as u64 {
            WidthClass::Two
        } else if length <= u32::MAX as u64 {
            WidthClass::Four
        } else {
            WidthClass::Eight
        }
    }

    pub fn from_bits(value: u8) -> Self {
        match value & 0b11 {
            0 => WidthClass::One,
            1 => WidthClass::Two,
            2 => WidthClass::Four,
            3 => WidthClass::Eight,
            _ => unreachable!(),
        }
    }

    pub fn as_bits(self) -> u8 {
        self as u8
    }

    /// Number of bytes used by the length field
    pub fn byte_len(self) -> usize {
        1 << (self as usize)
    }
}

/// Decoded content ID byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentId {
    pub stream: StreamIndex,
    pub width: WidthClass,
    pub has_timestamp: bool,
}

impl ContentId {
    pub fn from_byte(byte: u8) -> Self {
        ContentId {
            stream: StreamIndex::from_bits(byte),
            width: WidthClass::from_bits(byte >> WIDTH_SHIFT),
            has_timestamp: byte & TIMESTAMP_FLAG != 0,
        }
    }

    pub fn to_byte(self) -> u8 {
        let mut byte = self.stream.as_u8() | (self.width.as_bits() << WIDTH_SHIFT);
        if self.has_timestamp {
            byte |= TIMESTAMP_FLAG;
        }
        byte
    }

    /// Full header length implied by this content ID
    pub fn header_len(self) -> usize {
        let ts = if self.has_timestamp { TIMESTAMP_SIZE } else { 0 };
        1 + self.width.byte_len() + ts
    }
}

/// Chunk header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    /// Logical stream this chunk belongs to
    pub stream: StreamIndex,
    /// Payload length in bytes
    pub length: u64,
    /// Send timestamp (microseconds since the server epoch)
    pub timestamp_us: Option<u64>,
}

impl ChunkHeader {
    pub fn new(stream: StreamIndex, length: u64, timestamp_us: Option<u64>) -> Self {
        ChunkHeader {
            stream,
            length,
            timestamp_us,
        }
    }

    pub fn content_id(&self) -> ContentId {
        ContentId {
            stream: self.stream,
            width: WidthClass::for_length(self.length),
            has_timestamp: self.timestamp_us.is_some(),
        }
    }

    /// Encoded header size in bytes
    pub fn encoded_len(&self) -> usize {
        self.content_id().header_len()
    }

    /// Check if this chunk marks the end of a data stream
    pub fn is_end_of_stream(&self) -> bool {
        self.length == 0 && !self.stream.is_control()
    }

    /// Serialize the header (little-endian)
    pub fn to_bytes(&self, buf: &mut BytesMut) {
        let content_id = self.content_id();
        buf.put_u8(content_id.to_byte());

        match content_id.width {
            WidthClass::One => buf.put_u8(self.length as u8),
            WidthClass::Two => buf.put_u16_le(self.length as u16),
            WidthClass::Four => buf.put_u32_le(self.length as u32),
            WidthClass::Eight => buf.put_u64_le(self.length),
        }

        if let Some(ts) = self.timestamp_us {
            buf.put_u64_le(ts);
        }
    }

    /// Parse a header from the start of `bytes`
    ///
    /// Returns the header and the number of bytes it occupied.
    pub fn from_bytes(bytes: &[u8]) -> Result<(Self, usize), ChunkError> {
        let Some(&first) = bytes.first() else {
            return Err(ChunkError::InsufficientData {
                expected: 1,
                actual: 0,
            });
        };

        let content_id = ContentId::from_byte(first);
        let header_len = content_id.header_len();
        if bytes.len() < header_len {
            return Err(ChunkError::InsufficientData {
                expected: header_len,
                actual: bytes.len(),
            });
        }

        let mut buf = &bytes[1..header_len];
        let length = match content_id.width {
            WidthClass::One => buf.get_u8() as u64,
            WidthClass::Two => buf.get_u16_le() as u64,
            WidthClass::Four => buf.get_u32_le() as u64,
            WidthClass::Eight => buf.get_u64_le(),
        };
        let timestamp_us = content_id.has_timestamp.then(|| buf.get_u64_le());

        Ok((
            ChunkHeader {
                stream: content_id.stream,
                length,
                timestamp_us,
            },
            header_len,
        ))
    }
}

/// Chunk construction and parsing errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ChunkError {
    #[error("Insufficient data: expected {expected} bytes, got {actual}")]
    InsufficientData { expected: usize, actual: usize },

    #[error("Invalid data stream index: {0} (must be below 31)")]
    InvalidStreamIndex(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_width_class_selection() {
        assert_eq!(WidthClass::for_length(0), WidthClass::One);
        assert_eq!(WidthClass::for_length(255), WidthClass::One);
        assert_eq!(WidthClass::for_length(256), WidthClass::Two);
        assert_eq!(WidthClass::for_length(65_535), WidthClass::Two);
        assert_eq!(WidthClass::for_length(65_536), WidthClass::Four);
        assert_eq!(WidthClass::for_length(u32::MAX as u64 + 1), WidthClass::Eight);
    }

    #[test]
    fn test_every_content_id_is_valid() {
        for byte in 0..=u8::MAX {
            let id = ContentId::from_byte(byte);
            assert_eq!(id.to_byte(), byte);
            assert!(id.header_len() <= MAX_HEADER_SIZE);
        }
    }

    #[test]
    fn test_content_id_layout() {
        let id = ContentId {
            stream: StreamIndex::data(2).unwrap(),
            width: WidthClass::Two,
            has_timestamp: true,
        };
        assert_eq!(id.to_byte(), 0x02 | 0x20 | 0x40);
    }

    #[test]
    fn test_header_roundtrip() {
        let header = ChunkHeader::new(StreamIndex::data(5).unwrap(), 70_000, Some(1_234_567));
        let mut buf = BytesMut::new();
        header.to_bytes(&mut buf);

        assert_eq!(buf.len(), 1 + 4 + 8);
        let (decoded, used) = ChunkHeader::from_bytes(&buf).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(used, buf.len());
    }

    #[test]
    fn test_header_little_endian() {
        let header = ChunkHeader::new(StreamIndex::data(1).unwrap(), 0x0102, None);
        let mut buf = BytesMut::new();
        header.to_bytes(&mut buf);
        assert_eq!(&buf[..], &[0x41, 0x02, 0x01]);
    }

    #[test]
    fn test_header_insufficient_data() {
        let err = ChunkHeader::from_bytes(&[0x60, 0x00]).unwrap_err();
        assert_eq!(
            err,
            ChunkError::InsufficientData {
                expected: 11,
                actual: 2
            }
        );
    }

    #[test]
    fn test_stream_index_bounds() {
        assert!(StreamIndex::data(30).is_ok());
        assert_eq!(
            StreamIndex::data(31),
            Err(ChunkError::InvalidStreamIndex(31))
        );
        assert!(StreamIndex::CONTROL.is_control());
    }
}
