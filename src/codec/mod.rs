//! Audio encoder adapter
//!
//! The transport only needs one capability from a codec: turn a block of PCM
//! samples into a compressed frame. [`AudioEncoder`] is that seam;
//! [`OpusEncoder`] is the production implementation.

pub mod opus_encoder;

use bytes::Bytes;

use crate::error::Result;

pub use self::opus_encoder::OpusEncoder;

/// Compressed audio frame, immutable once created
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundFrame {
    data: Bytes,
}

impl OutboundFrame {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Encoded length in bytes
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Turns raw interleaved PCM into compressed frames
pub trait AudioEncoder: Send {
    /// Encode exactly one frame of interleaved samples
    fn encode(&mut self, samples: &[i16]) -> Result<OutboundFrame>;

    /// Interleaved samples expected by [`AudioEncoder::encode`]
    fn samples_per_frame(&self) -> usize;
}

/// Decode little-endian 16-bit PCM bytes into samples; a trailing odd byte is ignored
pub fn samples_from_le_bytes(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}
