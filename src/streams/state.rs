//! Per-sender stream state
//!
//! Couples one remote sender's jitter buffer with last-frame concealment and
//! a per-source gain. Frames that arrive without sequence numbers (legacy
//! packets) bypass the jitter buffer through a bounded FIFO.

use std::collections::VecDeque;

use crate::audio::buffer::{JitterBuffer, JitterPop};
use crate::audio::frame::Frame;
use crate::constants::{CROSSFADE_NEW, CROSSFADE_OLD, JITTER_MAX_SIZE, PLC_DECAY};

/// Result of asking a stream for its next frame
#[derive(Debug, Clone, PartialEq)]
pub struct PopOutcome {
    /// Frame to mix, if the stream produced one
    pub frame: Option<Frame>,
    /// True when this poll hit a loss (skip, concealment, or a declared
    /// gap with nothing to play)
    pub miss: bool,
}

/// State for one remote sender
pub struct StreamState {
    jitter: JitterBuffer,
    /// FIFO for legacy frames without sequence numbers
    legacy_queue: VecDeque<Frame>,
    /// Most recent emitted frame, the concealment source
    last_frame: Option<Frame>,
    /// Last emission was concealment
    plc_active: bool,
    /// Per-source linear gain
    gain: f32,
}

impl StreamState {
    pub fn new(target_fill: usize) -> Self {
        Self {
            jitter: JitterBuffer::new(target_fill),
            legacy_queue: VecDeque::new(),
            last_frame: None,
            plc_active: false,
            gain: 1.0,
        }
    }

    /// Accept a decoded frame. Sequenced frames go through the jitter
    /// buffer; legacy frames append to the FIFO, dropping the oldest past
    /// the bound.
    pub fn push(&mut self, seq: Option<u16>, frame: Frame) {
        match seq {
            Some(seq) => self.jitter.push(seq, frame),
            None => {
                if self.legacy_queue.len() >= JITTER_MAX_SIZE {
                    self.legacy_queue.pop_front();
                }
                self.legacy_queue.push_back(frame);
            }
        }
    }

    /// Produce the next frame for the mixer.
    ///
    /// Preference order: jitter buffer, legacy FIFO, decayed concealment
    /// from the last emitted frame, nothing. The first fresh frame after
    /// concealment is crossfaded with the concealment tail to mask the
    /// discontinuity.
    pub fn pop_for_mix(&mut self) -> PopOutcome {
        let popped = self.jitter.pop();
        let mut miss = popped.is_miss();

        match popped {
            JitterPop::Ready(frame) | JitterPop::Recovered(frame) => {
                let emitted = if self.plc_active {
                    match &self.last_frame {
                        Some(last) => crossfade(last, &frame),
                        None => frame,
                    }
                } else {
                    frame
                };
                self.plc_active = false;
                self.last_frame = Some(emitted.clone());
                return PopOutcome {
                    frame: Some(emitted),
                    miss,
                };
            }
            JitterPop::Waiting | JitterPop::Missing => {}
        }

        if let Some(frame) = self.legacy_queue.pop_front() {
            self.plc_active = false;
            self.last_frame = Some(frame.clone());
            return PopOutcome {
                frame: Some(frame),
                miss,
            };
        }

        if let Some(last) = &self.last_frame {
            // Geometric decay caps concealment energy so prolonged loss
            // fades to silence instead of looping audibly.
            let decayed = last.scaled(PLC_DECAY);
            self.last_frame = Some(decayed.clone());
            self.plc_active = true;
            miss = true;
            return PopOutcome {
                frame: Some(decayed),
                miss,
            };
        }

        PopOutcome { frame: None, miss }
    }

    pub fn set_target_fill(&mut self, target_fill: usize) {
        self.jitter.set_target_fill(target_fill);
    }

    pub fn gain(&self) -> f32 {
        self.gain
    }

    pub fn set_gain(&mut self, gain: f32) {
        self.gain = gain.max(0.0);
    }

    pub fn jitter(&self) -> &JitterBuffer {
        &self.jitter
    }

    pub fn plc_active(&self) -> bool {
        self.plc_active
    }
}

fn crossfade(old: &Frame, new: &Frame) -> Frame {
    let samples = old
        .samples
        .iter()
        .zip(&new.samples)
        .map(|(&o, &n)| {
            (CROSSFADE_OLD * o as f32 + CROSSFADE_NEW * n as f32)
                .clamp(i16::MIN as f32, i16::MAX as f32) as i16
        })
        .collect();
    Frame { samples }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::FRAME_SAMPLES;

    fn marked(value: i16) -> Frame {
        Frame::from_samples(vec![value; FRAME_SAMPLES])
    }

    fn state_with_fill(fill: usize) -> StreamState {
        StreamState::new(fill)
    }

    #[test]
    fn test_ordered_delivery_then_plc_decay() {
        let mut state = state_with_fill(10);
        for seq in 100..120u16 {
            state.push(Some(seq), marked(1000));
        }

        for _ in 0..20 {
            let out = state.pop_for_mix();
            assert!(!out.miss);
            assert_eq!(out.frame.unwrap().samples[0], 1000);
        }

        // 21st pop conceals from frame 119
        let out = state.pop_for_mix();
        assert!(out.miss);
        assert_eq!(out.frame.unwrap().samples[0], 850);
    }

    #[test]
    fn test_plc_energy_decays_geometrically() {
        let mut state = state_with_fill(1);
        state.push(Some(0), marked(10_000));
        let first = state.pop_for_mix().frame.unwrap();
        let initial_energy = first.energy();

        let mut prev_energy = initial_energy;
        for n in 1..=9 {
            let out = state.pop_for_mix();
            assert!(out.miss);
            let frame = out.frame.unwrap();
            let energy = frame.energy();
            let expected_ratio = (PLC_DECAY as f64).powi(2 * n);
            let actual_ratio = energy / initial_energy;
            assert!(
                (actual_ratio - expected_ratio).abs() < 0.01,
                "pop {n}: ratio {actual_ratio} vs {expected_ratio}"
            );
            assert!(energy < prev_energy);
            prev_energy = energy;
        }
    }

    #[test]
    fn test_crossfade_after_plc() {
        let mut state = state_with_fill(1);
        state.push(Some(0), marked(1000));
        assert_eq!(state.pop_for_mix().frame.unwrap().samples[0], 1000);

        // One concealed frame: 1000 * 0.85 = 850
        let concealed = state.pop_for_mix().frame.unwrap();
        assert_eq!(concealed.samples[0], 850);
        assert!(state.plc_active());

        // Fresh frame blends 30% of the concealment tail with 70% new.
        state.push(Some(1), marked(2000));
        let out = state.pop_for_mix();
        assert!(!out.miss);
        let blended = out.frame.unwrap();
        assert_eq!(blended.samples[0], (0.3 * 850.0 + 0.7 * 2000.0) as i16);
        assert!(!state.plc_active());
    }

    #[test]
    fn test_legacy_frames_fifo() {
        let mut state = state_with_fill(10);
        state.push(None, marked(1));
        state.push(None, marked(2));

        assert_eq!(state.pop_for_mix().frame.unwrap().samples[0], 1);
        assert_eq!(state.pop_for_mix().frame.unwrap().samples[0], 2);
    }

    #[test]
    fn test_legacy_queue_bounded() {
        let mut state = state_with_fill(10);
        for i in 0..(JITTER_MAX_SIZE + 10) {
            state.push(None, marked(i as i16));
        }
        // Oldest entries were dropped; the first out is entry 10.
        assert_eq!(state.pop_for_mix().frame.unwrap().samples[0], 10);
    }

    #[test]
    fn test_empty_stream_produces_nothing() {
        let mut state = state_with_fill(10);
        let out = state.pop_for_mix();
        assert!(out.frame.is_none());
        assert!(!out.miss);
    }
}
