//! Server-provided segment descriptor and buffer parameters
//!
//! Both arrive as JSON from the origin. They are parsed and validated once
//! on receipt and treated as immutable values afterwards.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Largest zero-padding width a `u64` index can need
const MAX_INDEX_WIDTH: usize = 20;

/// Descriptor and parameter errors
#[derive(Error, Debug)]
pub enum DescriptorError {
    #[error("Malformed JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid segment age: {0}")]
    InvalidAge(f64),

    #[error("Index width {0} exceeds {MAX_INDEX_WIDTH}")]
    IndexWidth(usize),

    #[error("Segment duration must be non-zero")]
    ZeroSegmentDuration,

    #[error("Seek buffer must be non-zero")]
    ZeroSeekBuffer,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawDescriptor {
    index: u64,
    age: f64,
    #[serde(default)]
    index_width: usize,
}

/// Latest published segment of a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentDescriptor {
    /// Most recently published segment index
    pub index: u64,
    /// Time since the server published `index`
    pub age: Duration,
    /// Zero-padding digits used in segment URLs
    pub index_width: usize,
}

impl SegmentDescriptor {
    pub fn new(index: u64, age: Duration, index_width: usize) -> Self {
        SegmentDescriptor {
            index,
            age,
            index_width,
        }
    }

    /// Parse and validate `{index, age, indexWidth}`
    pub fn from_json(bytes: &[u8]) -> Result<Self, DescriptorError> {
        let raw: RawDescriptor = serde_json::from_slice(bytes)?;

        // Rejects negative, non-finite and out-of-range ages alike
        let age = Duration::try_from_secs_f64(raw.age / 1000.0)
            .map_err(|_| DescriptorError::InvalidAge(raw.age))?;
        if raw.index_width > MAX_INDEX_WIDTH {
            return Err(DescriptorError::IndexWidth(raw.index_width));
        }

        Ok(SegmentDescriptor {
            index: raw.index,
            age,
            index_width: raw.index_width,
        })
    }

    /// Format `index` with this descriptor's zero padding
    pub fn pad_index(&self, index: u64) -> String {
        format!("{:0width$}", index, width = self.index_width)
    }
}

/// Buffer-control parameters for one quality level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BufferParams {
    /// Target buffer never drops below this
    #[serde(with = "crate::serde_millis")]
    pub min_buffer: Duration,
    /// Headroom added on top of the measured delay spread
    #[serde(with = "crate::serde_millis")]
    pub extra_buffer: Duration,
    /// Target used until enough delay samples exist
    #[serde(with = "crate::serde_millis")]
    pub initial_buffer: Duration,
    /// Distance kept from the live edge when seeking
    #[serde(with = "crate::serde_millis")]
    pub seek_buffer: Duration,
    /// Earliest initial seek after a stream start
    #[serde(with = "crate::serde_millis")]
    pub minimum_init_time: Duration,
}

impl BufferParams {
    /// Parse and validate server JSON
    pub fn from_json(bytes: &[u8]) -> Result<Self, DescriptorError> {
        let params: BufferParams = serde_json::from_slice(bytes)?;
        params.validate()?;
        Ok(params)
    }

    pub fn validate(&self) -> Result<(), DescriptorError> {
        if self.seek_buffer.is_zero() {
            return Err(DescriptorError::ZeroSeekBuffer);
        }
        Ok(())
    }
}

impl Default for BufferParams {
    fn default() -> Self {
        BufferParams {
            min_buffer: Duration::from_millis(500),
            extra_buffer: Duration::from_millis(180),
            initial_buffer: Duration::from_millis(1500),
            seek_buffer: Duration::from_millis(300),
            minimum_init_time: Duration::from_millis(2000),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_parse() {
        let d = SegmentDescriptor::from_json(br#"{"index": 42, "age": 250.0, "indexWidth": 6}"#)
            .unwrap();
        assert_eq!(d.index, 42);
        assert_eq!(d.age, Duration::from_millis(250));
        assert_eq!(d.pad_index(7), "000007");
    }

    #[test]
    fn test_descriptor_without_width() {
        let d = SegmentDescriptor::from_json(br#"{"index": 3, "age": 0}"#).unwrap();
        assert_eq!(d.pad_index(1234), "1234");
    }

    #[test]
    fn test_descriptor_rejects_bad_values() {
        assert!(matches!(
            SegmentDescriptor::from_json(br#"{"index": 1, "age": -5}"#),
            Err(DescriptorError::InvalidAge(_))
        ));
        assert!(matches!(
            SegmentDescriptor::from_json(br#"{"index": 1, "age": 1e300}"#),
            Err(DescriptorError::InvalidAge(_))
        ));
        assert!(matches!(
            SegmentDescriptor::from_json(br#"{"index": 1, "age": 5, "indexWidth": 64}"#),
            Err(DescriptorError::IndexWidth(64))
        ));
        assert!(matches!(
            SegmentDescriptor::from_json(br#"{"index": "x"}"#),
            Err(DescriptorError::Json(_))
        ));
    }

    #[test]
    fn test_buffer_params_parse() {
        let json = br#"{
            "minBuffer": 400,
            "extraBuffer": 180,
            "initialBuffer": 2000,
            "seekBuffer": 250,
            "minimumInitTime": 3000
        }"#;
        let params = BufferParams::from_json(json).unwrap();
        assert_eq!(params.min_buffer, Duration::from_millis(400));
        assert_eq!(params.minimum_init_time, Duration::from_millis(3000));
    }

    #[test]
    fn test_buffer_params_zero_seek_buffer() {
        let params = BufferParams {
            seek_buffer: Duration::ZERO,
            ..Default::default()
        };
        assert!(matches!(
            params.validate(),
            Err(DescriptorError::ZeroSeekBuffer)
        ));
    }
}
