//! Capture-side pre-processing
//!
//! Applied to every captured frame before encoding, in order:
//!
//! 1. optional echo attenuation against the last played far-end frame
//! 2. one-pole DC blocker
//! 3. optional low-pass smoothing
//! 4. adaptive noise-floor estimate (asymmetric EMA)
//! 5. soft noise gate with attack/release envelope
//! 6. RMS voice-activity detection with hangover
//!
//! The VAD result is metadata only; gated silence is still transmitted so
//! receivers keep an unbroken sequence stream.

use crate::audio::frame::Frame;
use crate::constants::{
    DC_BLOCK_R, ECHO_ATTENUATE_GAIN, ECHO_FAR_TO_NEAR_RATIO, ECHO_SUPPRESS_MIN_RMS, GATE_ATTACK,
    GATE_MIN_GAIN, GATE_RELEASE, NOISE_FLOOR_ALPHA_DOWN, NOISE_FLOOR_ALPHA_UP,
    NOISE_GATE_ATTACK_RMS, NOISE_GATE_RMS, SMOOTH_NEW, SMOOTH_PREV, VAD_HANGOVER_FRAMES,
    VAD_THRESHOLD,
};

/// Preprocessor options, fixed at construction
#[derive(Debug, Clone, Copy)]
pub struct PreprocessorOptions {
    /// Attenuate the mic frame when it looks like speaker bleed
    pub echo_suppression: bool,
    /// Extra low-pass smoothing after the DC blocker
    pub smoothing: bool,
}

impl Default for PreprocessorOptions {
    fn default() -> Self {
        Self {
            echo_suppression: true,
            smoothing: false,
        }
    }
}

/// Stateful per-frame capture processor
pub struct Preprocessor {
    options: PreprocessorOptions,
    // DC blocker state, carried across frames
    dc_prev_input: f32,
    dc_prev_output: f32,
    // Low-pass state
    smooth_prev: f32,
    // Adaptive gate state
    noise_floor: f32,
    gate_gain: f32,
    // VAD state
    hangover: u32,
}

impl Preprocessor {
    pub fn new(options: PreprocessorOptions) -> Self {
        Self {
            options,
            dc_prev_input: 0.0,
            dc_prev_output: 0.0,
            smooth_prev: 0.0,
            noise_floor: 0.0,
            gate_gain: GATE_MIN_GAIN,
            hangover: 0,
        }
    }

    /// Process one frame in place against the far-end reference (the last
    /// played output frame, if any). Returns the voice-activity flag.
    pub fn process(&mut self, frame: &mut Frame, far_reference: Option<&Frame>) -> bool {
        if self.options.echo_suppression {
            if let Some(far) = far_reference {
                self.attenuate_echo(frame, far);
            }
        }

        self.block_dc(frame);

        if self.options.smoothing {
            self.smooth(frame);
        }

        let rms = frame.rms();
        self.update_noise_floor(rms);
        self.apply_gate(frame, rms);

        self.detect_voice(rms)
    }

    /// Crude speaker-bleed suppression: when the far end is loud in absolute
    /// terms and relative to the mic, duck the whole frame.
    fn attenuate_echo(&mut self, frame: &mut Frame, far: &Frame) {
        let far_rms = far.rms();
        let near_rms = frame.rms();
        if far_rms >= ECHO_SUPPRESS_MIN_RMS && far_rms >= ECHO_FAR_TO_NEAR_RATIO * near_rms {
            for s in &mut frame.samples {
                *s = (*s as f32 * ECHO_ATTENUATE_GAIN) as i16;
            }
        }
    }

    /// y[n] = x[n] - x[n-1] + R * y[n-1]
    fn block_dc(&mut self, frame: &mut Frame) {
        for s in &mut frame.samples {
            let x = *s as f32;
            let y = x - self.dc_prev_input + DC_BLOCK_R * self.dc_prev_output;
            self.dc_prev_input = x;
            self.dc_prev_output = y;
            *s = y.clamp(i16::MIN as f32, i16::MAX as f32) as i16;
        }
    }

    fn smooth(&mut self, frame: &mut Frame) {
        for s in &mut frame.samples {
            let y = SMOOTH_PREV * self.smooth_prev + SMOOTH_NEW * *s as f32;
            self.smooth_prev = y;
            *s = y.clamp(i16::MIN as f32, i16::MAX as f32) as i16;
        }
    }

    /// Slow to rise, quicker to fall, so speech does not drag the floor up.
    fn update_noise_floor(&mut self, rms: f32) {
        let alpha = if rms > self.noise_floor {
            NOISE_FLOOR_ALPHA_UP
        } else {
            NOISE_FLOOR_ALPHA_DOWN
        };
        self.noise_floor += alpha * (rms - self.noise_floor);
    }

    fn apply_gate(&mut self, frame: &mut Frame, rms: f32) {
        let open_thr = NOISE_GATE_ATTACK_RMS.max(self.noise_floor * 1.6);
        let close_thr = NOISE_GATE_RMS.max(self.noise_floor * 1.8);

        let desired = if rms >= open_thr {
            1.0
        } else if rms <= close_thr || open_thr <= close_thr {
            GATE_MIN_GAIN
        } else {
            let t = (rms - close_thr) / (open_thr - close_thr);
            GATE_MIN_GAIN + t * (1.0 - GATE_MIN_GAIN)
        };

        // Envelope smoothing keeps the gate from chattering on the edge.
        let coeff = if desired > self.gate_gain {
            GATE_ATTACK
        } else {
            GATE_RELEASE
        };
        self.gate_gain += coeff * (desired - self.gate_gain);

        if (self.gate_gain - 1.0).abs() > f32::EPSILON {
            for s in &mut frame.samples {
                *s = (*s as f32 * self.gate_gain) as i16;
            }
        }
    }

    fn detect_voice(&mut self, rms: f32) -> bool {
        if rms > VAD_THRESHOLD {
            self.hangover = VAD_HANGOVER_FRAMES;
            true
        } else if self.hangover > 0 {
            self.hangover -= 1;
            true
        } else {
            false
        }
    }

    /// Current adaptive noise-floor estimate (RMS)
    pub fn noise_floor(&self) -> f32 {
        self.noise_floor
    }

    /// Current applied gate gain
    pub fn gate_gain(&self) -> f32 {
        self.gate_gain
    }
}

impl Default for Preprocessor {
    fn default() -> Self {
        Self::new(PreprocessorOptions::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::FRAME_SAMPLES;

    fn dc_frame(offset: i16) -> Frame {
        Frame::from_samples(vec![offset; FRAME_SAMPLES])
    }

    fn tone_frame(amplitude: f32) -> Frame {
        let samples = (0..FRAME_SAMPLES)
            .map(|i| {
                let t = i as f32 / 16_000.0;
                (amplitude * (t * 440.0 * std::f32::consts::TAU).sin()) as i16
            })
            .collect();
        Frame::from_samples(samples)
    }

    #[test]
    fn test_dc_offset_removed() {
        let mut pre = Preprocessor::new(PreprocessorOptions {
            echo_suppression: false,
            smoothing: false,
        });
        let mut last_rms = 0.0;
        for _ in 0..50 {
            let mut frame = dc_frame(1000);
            pre.process(&mut frame, None);
            last_rms = frame.rms();
        }
        // A constant input settles toward zero after the high-pass.
        assert!(last_rms < 50.0, "residual rms {last_rms}");
    }

    #[test]
    fn test_gate_attenuates_quiet_input() {
        let mut pre = Preprocessor::new(PreprocessorOptions {
            echo_suppression: false,
            smoothing: false,
        });
        // Low-level noise, well under the gate close threshold
        for _ in 0..100 {
            let mut frame = tone_frame(30.0);
            pre.process(&mut frame, None);
        }
        assert!(pre.gate_gain() < 0.15, "gate gain {}", pre.gate_gain());
    }

    #[test]
    fn test_gate_opens_for_speech_level() {
        let mut pre = Preprocessor::new(PreprocessorOptions {
            echo_suppression: false,
            smoothing: false,
        });
        for _ in 0..50 {
            let mut frame = tone_frame(8000.0);
            pre.process(&mut frame, None);
        }
        assert!(pre.gate_gain() > 0.9, "gate gain {}", pre.gate_gain());
    }

    #[test]
    fn test_vad_hangover() {
        let mut pre = Preprocessor::new(PreprocessorOptions {
            echo_suppression: false,
            smoothing: false,
        });
        let mut loud = tone_frame(8000.0);
        assert!(pre.process(&mut loud, None));

        // Silence stays "voiced" through the hangover window, then drops.
        let mut voiced = 0;
        for _ in 0..VAD_HANGOVER_FRAMES + 5 {
            let mut quiet = Frame::silence();
            if pre.process(&mut quiet, None) {
                voiced += 1;
            }
        }
        assert_eq!(voiced, VAD_HANGOVER_FRAMES);
    }

    #[test]
    fn test_echo_attenuation_engages() {
        let mut pre = Preprocessor::new(PreprocessorOptions {
            echo_suppression: true,
            smoothing: false,
        });
        let far = tone_frame(8000.0);
        let mut near = tone_frame(8000.0);
        let before = near.rms();
        pre.attenuate_echo(&mut near, &far);
        let after = near.rms();
        assert!(after < before * 0.75, "before {before} after {after}");
    }

    #[test]
    fn test_echo_attenuation_skips_quiet_far_end() {
        let mut pre = Preprocessor::new(PreprocessorOptions::default());
        let far = tone_frame(50.0);
        let mut near = tone_frame(8000.0);
        let before = near.samples.clone();
        pre.attenuate_echo(&mut near, &far);
        assert_eq!(near.samples, before);
    }
}
