//! Opus decoder wrapper
//!
//! Always produces exactly one 20 ms frame. An empty payload invokes the
//! codec's native packet-loss concealment, so a lost packet still yields a
//! plausible frame for the jitter buffer to hand out.

use opus::{Channels, Decoder};

use crate::audio::frame::Frame;
use crate::constants::{FRAME_SAMPLES, SAMPLE_RATE};
use crate::error::CodecError;

/// Opus decoder fixed to the voice frame contract
pub struct OpusDecoder {
    decoder: Decoder,
    /// Decoding buffer (reused to avoid allocations)
    decode_buffer: Vec<i16>,
    /// Frames decoded from real payloads
    frames_decoded: u64,
    /// Frames synthesized by concealment
    frames_concealed: u64,
}

impl OpusDecoder {
    pub fn new() -> Result<Self, CodecError> {
        let decoder = Decoder::new(SAMPLE_RATE, Channels::Mono)
            .map_err(|e| CodecError::DecoderInit(e.to_string()))?;

        Ok(Self {
            decoder,
            decode_buffer: vec![0i16; FRAME_SAMPLES],
            frames_decoded: 0,
            frames_concealed: 0,
        })
    }

    /// Decode one packet. An empty payload synthesizes a concealment frame.
    pub fn decode(&mut self, payload: &[u8]) -> Result<Frame, CodecError> {
        let samples = self
            .decoder
            .decode(payload, &mut self.decode_buffer, false)
            .map_err(|e| CodecError::DecodingFailed(e.to_string()))?;

        if payload.is_empty() {
            self.frames_concealed += 1;
        } else {
            self.frames_decoded += 1;
        }

        Ok(Frame::from_samples(self.decode_buffer[..samples].to_vec()))
    }

    pub fn frames_decoded(&self) -> u64 {
        self.frames_decoded
    }

    pub fn frames_concealed(&self) -> u64 {
        self.frames_concealed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::OpusEncoder;
    use crate::constants::FRAME_BYTES;

    #[test]
    fn test_roundtrip_restores_frame_size() {
        let mut encoder = OpusEncoder::voip().unwrap();
        let mut decoder = OpusDecoder::new().unwrap();

        let samples: Vec<i16> = (0..FRAME_SAMPLES)
            .map(|i| {
                let t = i as f32 / SAMPLE_RATE as f32;
                ((t * 440.0 * std::f32::consts::TAU).sin() * 10_000.0) as i16
            })
            .collect();
        let frame = Frame::from_samples(samples);

        for _ in 0..5 {
            let encoded = encoder.encode(&frame).unwrap();
            let decoded = decoder.decode(&encoded).unwrap();
            assert_eq!(decoded.len(), FRAME_SAMPLES);
            assert_eq!(decoded.to_le_bytes().len(), FRAME_BYTES);
        }
    }

    #[test]
    fn test_empty_payload_conceals() {
        let mut decoder = OpusDecoder::new().unwrap();
        let frame = decoder.decode(&[]).unwrap();
        assert_eq!(frame.len(), FRAME_SAMPLES);
        assert_eq!(decoder.frames_concealed(), 1);
        assert_eq!(decoder.frames_decoded(), 0);
    }
}
