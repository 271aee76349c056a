//! Synchronous multi-source mixer
//!
//! An independent loop wakes every 20 ms, polls each heard stream once
//! under the table lock, sums the collected frames with per-source gain,
//! clips to i16, and pushes the result to the output queue. A tick always
//! emits a frame; with nothing to mix it emits silence so the playback
//! clock never starves by design.
//!
//! The adaptive jitter controller rides the same loop: every 200 ticks it
//! inspects playback-underrun and mixed-miss deltas and nudges the shared
//! jitter target.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crate::audio::buffer::SharedFrameQueue;
use crate::audio::frame::Frame;
use crate::constants::{
    ADAPT_WINDOW_TICKS, FRAME_DURATION, FRAME_SAMPLES, JITTER_TARGET_MAX, JITTER_TARGET_MIN,
};
use crate::streams::table::{SharedStreamTable, StreamTable};

/// What one mixer tick observed
#[derive(Debug, Clone, Copy, Default)]
pub struct TickOutcome {
    /// Streams polled this tick
    pub polled: usize,
    /// At least one poll hit a loss or concealment
    pub miss: bool,
}

/// Poll every heard stream once. Must run under the table lock; returns the
/// frames to sum so the arithmetic can happen outside it.
pub fn collect_for_mix(table: &mut StreamTable) -> (Vec<(Frame, f32)>, TickOutcome) {
    let targets: Vec<String> = table.hear_targets().iter().cloned().collect();
    let mut collected = Vec::with_capacity(targets.len());
    let mut outcome = TickOutcome::default();

    for id in targets {
        let Some(stream) = table.stream_mut(&id) else {
            continue;
        };
        outcome.polled += 1;
        let gain = stream.gain();
        let popped = stream.pop_for_mix();
        outcome.miss |= popped.miss;
        if let Some(frame) = popped.frame {
            collected.push((frame, gain));
        }
    }

    (collected, outcome)
}

/// Sum with per-source gain and clip each sample to the i16 range.
pub fn mix_frames(frames: &[(Frame, f32)]) -> Frame {
    if frames.is_empty() {
        return Frame::silence();
    }

    let mut acc = [0i32; FRAME_SAMPLES];
    for (frame, gain) in frames {
        for (a, &s) in acc.iter_mut().zip(&frame.samples) {
            *a += (s as f32 * gain) as i32;
        }
    }

    Frame {
        samples: acc
            .iter()
            .map(|&a| a.clamp(i16::MIN as i32, i16::MAX as i32) as i16)
            .collect(),
    }
}

/// Window-delta controller for the shared jitter target
///
/// Raises the target when playback underruns or mixed misses spike, lowers
/// it again once both stay quiet, within [JITTER_TARGET_MIN,
/// JITTER_TARGET_MAX].
#[derive(Debug, Default)]
pub struct AdaptiveJitterController {
    prev_callbacks: u64,
    prev_underruns: u64,
    prev_mixed: u64,
    prev_miss: u64,
}

impl AdaptiveJitterController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Evaluate one window. Returns the new target if it should change.
    pub fn evaluate(
        &mut self,
        current_target: usize,
        callbacks: u64,
        underruns: u64,
        mixed: u64,
        miss: u64,
    ) -> Option<usize> {
        let d_callbacks = callbacks.saturating_sub(self.prev_callbacks);
        let d_underruns = underruns.saturating_sub(self.prev_underruns);
        let d_mixed = mixed.saturating_sub(self.prev_mixed);
        let d_miss = miss.saturating_sub(self.prev_miss);

        self.prev_callbacks = callbacks;
        self.prev_underruns = underruns;
        self.prev_mixed = mixed;
        self.prev_miss = miss;

        let underrun_rate = if d_callbacks > 0 {
            d_underruns as f64 / d_callbacks as f64
        } else {
            0.0
        };
        let miss_rate = if d_mixed > 0 {
            d_miss as f64 / d_mixed as f64
        } else {
            0.0
        };

        if underrun_rate > 0.05 || miss_rate > 0.60 {
            let raised = (current_target + 1).min(JITTER_TARGET_MAX);
            if raised != current_target {
                return Some(raised);
            }
        } else if underrun_rate < 0.01 && miss_rate < 0.15 {
            let lowered = current_target.saturating_sub(1).max(JITTER_TARGET_MIN);
            if lowered != current_target {
                return Some(lowered);
            }
        }
        None
    }
}

/// Mixer statistics snapshot
#[derive(Debug, Clone, Copy, Default)]
pub struct MixerStats {
    pub ticks: u64,
    pub mixed_frames: u64,
    pub mixed_miss: u64,
}

/// The 20 ms mixing loop
pub struct Mixer {
    thread_handle: Option<JoinHandle<()>>,
    running: Arc<AtomicBool>,
    ticks: Arc<AtomicU64>,
    mixed_frames: Arc<AtomicU64>,
    mixed_miss: Arc<AtomicU64>,
}

impl Mixer {
    /// Start the mixer over the shared table and output queue. The playback
    /// counters feed the adaptive controller.
    pub fn start(
        streams: SharedStreamTable,
        output: SharedFrameQueue,
        playback_callbacks: Arc<AtomicU64>,
        playback_underruns: Arc<AtomicU64>,
    ) -> std::io::Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let ticks = Arc::new(AtomicU64::new(0));
        let mixed_frames = Arc::new(AtomicU64::new(0));
        let mixed_miss = Arc::new(AtomicU64::new(0));

        let thread_running = running.clone();
        let thread_ticks = ticks.clone();
        let thread_mixed = mixed_frames.clone();
        let thread_miss = mixed_miss.clone();

        let handle = thread::Builder::new()
            .name("mixer".to_string())
            .spawn(move || {
                let mut controller = AdaptiveJitterController::new();
                let mut next_deadline = Instant::now() + FRAME_DURATION;

                while thread_running.load(Ordering::Relaxed) {
                    let now = Instant::now();
                    if next_deadline > now {
                        thread::sleep(next_deadline - now);
                    } else {
                        // Fell behind: resynchronize rather than bursting
                        // multiple frames at once.
                        next_deadline = now;
                    }
                    next_deadline += FRAME_DURATION;

                    let (collected, outcome) = {
                        let mut table = streams.lock();
                        collect_for_mix(&mut table)
                    };

                    output.push(mix_frames(&collected));

                    let tick = thread_ticks.fetch_add(1, Ordering::Relaxed) + 1;
                    if outcome.polled > 0 {
                        thread_mixed.fetch_add(1, Ordering::Relaxed);
                        if outcome.miss {
                            thread_miss.fetch_add(1, Ordering::Relaxed);
                        }
                    }

                    if tick % ADAPT_WINDOW_TICKS == 0 {
                        let current = streams.lock().jitter_target();
                        if let Some(new_target) = controller.evaluate(
                            current,
                            playback_callbacks.load(Ordering::Relaxed),
                            playback_underruns.load(Ordering::Relaxed),
                            thread_mixed.load(Ordering::Relaxed),
                            thread_miss.load(Ordering::Relaxed),
                        ) {
                            tracing::debug!(
                                from = current,
                                to = new_target,
                                "adjusting jitter target"
                            );
                            streams.lock().set_jitter_target(new_target);
                        }
                    }
                }
            })?;

        Ok(Self {
            thread_handle: Some(handle),
            running,
            ticks,
            mixed_frames,
            mixed_miss,
        })
    }

    /// Stop the loop and join it.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }

    pub fn stats(&self) -> MixerStats {
        MixerStats {
            ticks: self.ticks.load(Ordering::Relaxed),
            mixed_frames: self.mixed_frames.load(Ordering::Relaxed),
            mixed_miss: self.mixed_miss.load(Ordering::Relaxed),
        }
    }
}

impl Drop for Mixer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::buffer::create_shared_queue;
    use crate::constants::{JITTER_TARGET_INITIAL, OUTPUT_QUEUE_CAPACITY};
    use crate::streams::table::create_shared_table;
    use std::time::Duration;

    fn marked(value: i16) -> Frame {
        Frame::from_samples(vec![value; FRAME_SAMPLES])
    }

    #[test]
    fn test_mix_sums_and_clips() {
        let mixed = mix_frames(&[(marked(20_000), 1.0), (marked(20_000), 1.0)]);
        assert!(mixed.samples.iter().all(|&s| s == i16::MAX));

        let mixed = mix_frames(&[(marked(100), 1.0), (marked(-40), 1.0)]);
        assert!(mixed.samples.iter().all(|&s| s == 60));
    }

    #[test]
    fn test_mix_applies_gain() {
        let mixed = mix_frames(&[(marked(1000), 0.5)]);
        assert!(mixed.samples.iter().all(|&s| s == 500));
    }

    #[test]
    fn test_mix_empty_is_silence() {
        assert_eq!(mix_frames(&[]), Frame::silence());
    }

    #[test]
    fn test_collect_polls_only_heard_streams() {
        let mut table = StreamTable::new();
        table.set_hear_targets(["1"]);
        table.push_frame("1", Some(0), marked(7));
        // Push enough to satisfy the fill target
        for seq in 1..JITTER_TARGET_INITIAL as u16 {
            table.push_frame("1", Some(seq), marked(7));
        }

        let (collected, outcome) = collect_for_mix(&mut table);
        assert_eq!(outcome.polled, 1);
        assert!(!outcome.miss);
        assert_eq!(collected.len(), 1);
        assert_eq!(collected[0].0.samples[0], 7);
    }

    #[test]
    fn test_controller_raises_on_underruns() {
        let mut ctrl = AdaptiveJitterController::new();
        // Window 1: 10% underruns
        assert_eq!(ctrl.evaluate(10, 200, 20, 200, 0), Some(11));
        // Window 2: continued pressure from misses instead
        assert_eq!(ctrl.evaluate(11, 400, 40, 400, 260), Some(12));
    }

    #[test]
    fn test_controller_caps_at_max() {
        let mut ctrl = AdaptiveJitterController::new();
        assert_eq!(ctrl.evaluate(JITTER_TARGET_MAX, 200, 50, 200, 0), None);
    }

    #[test]
    fn test_controller_lowers_when_quiet() {
        let mut ctrl = AdaptiveJitterController::new();
        assert_eq!(ctrl.evaluate(10, 200, 0, 200, 10), Some(9));
    }

    #[test]
    fn test_controller_floor() {
        let mut ctrl = AdaptiveJitterController::new();
        assert_eq!(ctrl.evaluate(JITTER_TARGET_MIN, 200, 0, 200, 0), None);
    }

    #[test]
    fn test_controller_holds_in_between() {
        let mut ctrl = AdaptiveJitterController::new();
        // 3% underruns, 30% miss: neither raise nor lower
        assert_eq!(ctrl.evaluate(10, 200, 6, 200, 60), None);
    }

    #[test]
    fn test_mixer_emits_roughly_fifty_frames_per_second() {
        let streams = create_shared_table();
        let output = create_shared_queue(OUTPUT_QUEUE_CAPACITY);
        let callbacks = Arc::new(AtomicU64::new(0));
        let underruns = Arc::new(AtomicU64::new(0));

        let mut mixer = Mixer::start(streams, output.clone(), callbacks, underruns).unwrap();
        thread::sleep(Duration::from_millis(1000));
        let ticks = mixer.stats().ticks;
        mixer.stop();

        assert!(
            (44..=56).contains(&ticks),
            "expected about 50 ticks in a second, got {ticks}"
        );
    }
}
