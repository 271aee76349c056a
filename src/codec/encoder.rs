//! Opus encoder wrapper
//!
//! One frame in, one packet out: exactly 320 samples of mono i16 PCM at
//! 16 kHz become one encoded payload. The encoder is tuned for VoIP; DTX is
//! left off so every 20 ms window yields a decodable frame and silence
//! suppression stays the noise gate's job.

use bytes::Bytes;
use opus::{Application, Channels, Encoder};

use crate::audio::frame::Frame;
use crate::constants::{DEFAULT_BITRATE, FRAME_SAMPLES, SAMPLE_RATE};
use crate::error::CodecError;

/// Opus encoder fixed to the voice frame contract
pub struct OpusEncoder {
    encoder: Encoder,
    /// Encoding buffer (reused to avoid allocations)
    encode_buffer: Vec<u8>,
    /// Frames encoded
    frames_encoded: u64,
    /// Total bytes produced
    bytes_produced: u64,
}

impl OpusEncoder {
    /// Create a VoIP-tuned encoder with the given bitrate.
    pub fn new(bitrate: u32) -> Result<Self, CodecError> {
        let mut encoder = Encoder::new(SAMPLE_RATE, Channels::Mono, Application::Voip)
            .map_err(|e| CodecError::EncoderInit(e.to_string()))?;

        encoder
            .set_bitrate(opus::Bitrate::Bits(bitrate as i32))
            .map_err(|e| CodecError::EncoderInit(format!("failed to set bitrate: {}", e)))?;
        encoder
            .set_inband_fec(false)
            .map_err(|e| CodecError::EncoderInit(format!("failed to set FEC: {}", e)))?;
        encoder
            .set_dtx(false)
            .map_err(|e| CodecError::EncoderInit(format!("failed to set DTX: {}", e)))?;

        Ok(Self {
            encoder,
            // Max Opus frame is about 1275 bytes
            encode_buffer: vec![0u8; 4000],
            frames_encoded: 0,
            bytes_produced: 0,
        })
    }

    /// Encoder with the default voice bitrate.
    pub fn voip() -> Result<Self, CodecError> {
        Self::new(DEFAULT_BITRATE)
    }

    /// Encode one 20 ms frame.
    pub fn encode(&mut self, frame: &Frame) -> Result<Bytes, CodecError> {
        if frame.len() != FRAME_SAMPLES {
            return Err(CodecError::InvalidFrameSize(frame.len()));
        }

        let size = self
            .encoder
            .encode(&frame.samples, &mut self.encode_buffer)
            .map_err(|e| CodecError::EncodingFailed(e.to_string()))?;

        self.frames_encoded += 1;
        self.bytes_produced += size as u64;

        Ok(Bytes::copy_from_slice(&self.encode_buffer[..size]))
    }

    pub fn frames_encoded(&self) -> u64 {
        self.frames_encoded
    }

    pub fn bytes_produced(&self) -> u64 {
        self.bytes_produced
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_rejects_wrong_frame_size() {
        let mut encoder = OpusEncoder::voip().unwrap();
        let short = Frame {
            samples: vec![0; 100],
        };
        assert!(matches!(
            encoder.encode(&short),
            Err(CodecError::InvalidFrameSize(100))
        ));
    }

    #[test]
    fn test_encode_silence() {
        let mut encoder = OpusEncoder::voip().unwrap();
        let encoded = encoder.encode(&Frame::silence()).unwrap();
        assert!(!encoded.is_empty());
        assert!(encoded.len() < crate::constants::FRAME_BYTES);
        assert_eq!(encoder.frames_encoded(), 1);
    }
}
