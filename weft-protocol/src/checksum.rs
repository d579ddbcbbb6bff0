//! Debug checksum over interleave bytes
//!
//! Not part of the wire contract. Encoder and decoder can both fold every
//! byte they see into a Fletcher-style sum so the two ends can be compared
//! when diagnosing corruption.

const MODULUS: u32 = 65_535;

/// Incremental Fletcher-style checksum
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RollingChecksum {
    low: u32,
    high: u32,
    bytes: u64,
}

impl RollingChecksum {
    pub fn new() -> Self {
        RollingChecksum {
            low: 0,
            high: 0,
            bytes: 0,
        }
    }

    /// Fold `data` into the checksum
    pub fn update(&mut self, data: &[u8]) {
        for &byte in data {
            self.low = (self.low + byte as u32) % MODULUS;
            self.high = (self.high + self.low) % MODULUS;
        }
        self.bytes += data.len() as u64;
    }

    /// Current checksum value
    pub fn value(&self) -> u32 {
        (self.high << 16) | self.low
    }

    /// Number of bytes folded in so far
    pub fn byte_count(&self) -> u64 {
        self.bytes
    }
}

impl Default for RollingChecksum {
    fn default() -> Self {
        Self::new()
    }
}
