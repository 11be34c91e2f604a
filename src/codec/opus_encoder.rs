//! Opus encoder wrapper

use crate::codec::{AudioEncoder, OutboundFrame};
use crate::config::{EncoderApplication, EncoderConfig};
use crate::constants::MAX_OPUS_PACKET_SIZE;
use crate::error::{Error, Result};

/// Opus encoder bound to one session's audio format
pub struct OpusEncoder {
    inner: opus::Encoder,
    config: EncoderConfig,
    output: Vec<u8>,
}

impl OpusEncoder {
    /// Create a new encoder
    pub fn new(config: EncoderConfig) -> Result<Self> {
        let channels = match config.channels {
            1 => opus::Channels::Mono,
            2 => opus::Channels::Stereo,
            n => return Err(Error::Codec(format!("unsupported channel count {}", n))),
        };

        let application = match config.application {
            EncoderApplication::Voip => opus::Application::Voip,
            EncoderApplication::Audio => opus::Application::Audio,
            EncoderApplication::LowDelay => opus::Application::LowDelay,
        };

        let mut inner = opus::Encoder::new(config.sample_rate, channels, application)?;
        if let Some(bitrate) = config.bitrate {
            inner.set_bitrate(opus::Bitrate::Bits(bitrate))?;
        }

        tracing::debug!(
            "Opus encoder: {}Hz, {} channel(s), {} samples/frame ({}ms)",
            config.sample_rate,
            config.channels,
            config.samples_per_frame(),
            config.frame_size_ms
        );

        Ok(Self {
            inner,
            config,
            output: vec![0u8; MAX_OPUS_PACKET_SIZE],
        })
    }

    /// Get frame duration in milliseconds
    pub fn frame_duration_ms(&self) -> u32 {
        self.config.frame_size_ms
    }
}

impl AudioEncoder for OpusEncoder {
    fn encode(&mut self, samples: &[i16]) -> Result<OutboundFrame> {
        let expected = self.config.samples_per_frame();
        if samples.len() != expected {
            return Err(Error::Codec(format!(
                "expected {} samples per frame, got {}",
                expected,
                samples.len()
            )));
        }

        let len = self.inner.encode(samples, &mut self.output)?;
        Ok(OutboundFrame::new(self.output[..len].to_vec()))
    }

    fn samples_per_frame(&self) -> usize {
        self.config.samples_per_frame()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_silence() {
        let mut encoder = OpusEncoder::new(EncoderConfig::default()).unwrap();
        let silence = vec![0i16; encoder.samples_per_frame()];

        let frame = encoder.encode(&silence).unwrap();
        assert!(!frame.is_empty());
        assert!(frame.len() <= MAX_OPUS_PACKET_SIZE);
    }

    #[test]
    fn test_rejects_partial_frame() {
        let mut encoder = OpusEncoder::new(EncoderConfig::default()).unwrap();
        assert!(matches!(encoder.encode(&[0i16; 10]), Err(Error::Codec(_))));
    }

    #[test]
    fn test_rejects_channel_count() {
        let config = EncoderConfig {
            channels: 3,
            ..Default::default()
        };
        assert!(OpusEncoder::new(config).is_err());
    }
}
