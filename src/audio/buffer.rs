//! Audio buffering: the output frame queue and the per-sender jitter buffer
//!
//! The `FrameQueue` is a bounded queue between the mixer and the playback
//! callback. Overflow policy everywhere in the pipeline is
//! drop-oldest-then-enqueue-new: fresh audio always wins over stale audio.
//!
//! The `JitterBuffer` orders and delays one sender's decoded frames so that
//! network-induced arrival variance does not reach the mixer. It is keyed by
//! the 16-bit wrapping sequence number and compared by signed circular
//! distance throughout.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam::queue::ArrayQueue;

use crate::audio::frame::Frame;
use crate::constants::{JITTER_MAX_SIZE, JITTER_TARGET_INITIAL};
use crate::protocol::seq_distance;

/// Bounded frame queue with drop-oldest overflow
pub struct FrameQueue {
    queue: ArrayQueue<Frame>,
    dropped: AtomicUsize,
    underruns: AtomicUsize,
}

impl FrameQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity),
            dropped: AtomicUsize::new(0),
            underruns: AtomicUsize::new(0),
        }
    }

    /// Enqueue a frame. On a full queue the oldest entry is discarded so the
    /// new frame always lands.
    pub fn push(&self, frame: Frame) {
        let mut frame = frame;
        while let Err(rejected) = self.queue.push(frame) {
            let _ = self.queue.pop();
            self.dropped.fetch_add(1, Ordering::Relaxed);
            frame = rejected;
        }
    }

    /// Dequeue without blocking, counting underruns.
    pub fn pop(&self) -> Option<Frame> {
        match self.queue.pop() {
            Some(frame) => Some(frame),
            None => {
                self.underruns.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Dequeue without counting an underrun.
    pub fn try_pop(&self) -> Option<Frame> {
        self.queue.pop()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn underruns(&self) -> usize {
        self.underruns.load(Ordering::Relaxed)
    }
}

/// Shared handle to a frame queue
pub type SharedFrameQueue = Arc<FrameQueue>;

pub fn create_shared_queue(capacity: usize) -> SharedFrameQueue {
    Arc::new(FrameQueue::new(capacity))
}

/// What a jitter buffer pop produced
#[derive(Debug, Clone, PartialEq)]
pub enum JitterPop {
    /// The expected frame was present
    Ready(Frame),
    /// The expected frame was missing; playback skipped ahead to this one
    Recovered(Frame),
    /// Not enough buffered yet, caller should wait
    Waiting,
    /// Loss declared and nothing newer buffered; expected advanced by one
    Missing,
}

impl JitterPop {
    /// True for the loss paths (`Recovered` / `Missing`)
    pub fn is_miss(&self) -> bool {
        matches!(self, Self::Recovered(_) | Self::Missing)
    }
}

/// Jitter buffer statistics
#[derive(Debug, Clone, Default)]
pub struct JitterStats {
    pub received: u64,
    pub late_discarded: u64,
    pub evicted: u64,
    pub losses: u64,
    pub emitted: u64,
}

/// Per-sender reordering buffer with loss skip
///
/// Frames are held until occupancy first reaches `target_fill` (the startup
/// delay), then drained one per pop. A missing expected frame with a full
/// enough buffer declares loss and skips forward, which keeps a burst of
/// loss from stalling the stream forever; a missing frame with a shallow
/// buffer waits for refill, which doubles as the post-loss resync delay.
pub struct JitterBuffer {
    frames: BTreeMap<u16, Frame>,
    /// Next sequence to emit; None until the first push
    expected_seq: Option<u16>,
    /// Occupancy required before draining starts
    target_fill: usize,
    /// Still accumulating the initial fill
    filling: bool,
    stats: JitterStats,
}

impl JitterBuffer {
    pub fn new(target_fill: usize) -> Self {
        Self {
            frames: BTreeMap::new(),
            expected_seq: None,
            target_fill,
            filling: true,
            stats: JitterStats::default(),
        }
    }

    /// Store a frame under its sequence number.
    ///
    /// Frames further than `JITTER_MAX_SIZE` behind the playback point are
    /// discarded. Duplicates overwrite. When the buffer would exceed its
    /// bound, the entry closest to the past edge is evicted.
    pub fn push(&mut self, seq: u16, frame: Frame) {
        let expected = match self.expected_seq {
            Some(e) => e,
            None => {
                self.expected_seq = Some(seq);
                seq
            }
        };

        if seq_distance(seq, expected) < -(JITTER_MAX_SIZE as i32) {
            self.stats.late_discarded += 1;
            return;
        }

        self.frames.insert(seq, frame);
        self.stats.received += 1;

        if self.frames.len() > JITTER_MAX_SIZE {
            if let Some(oldest) = self.farthest_past_key(expected) {
                self.frames.remove(&oldest);
                self.stats.evicted += 1;
            }
        }
    }

    /// Key with the smallest signed distance to `expected`
    fn farthest_past_key(&self, expected: u16) -> Option<u16> {
        self.frames
            .keys()
            .copied()
            .min_by_key(|&k| seq_distance(k, expected))
    }

    /// Smallest stored key at or after `expected` (signed distance >= 0)
    fn next_key_at_or_after(&self, expected: u16) -> Option<u16> {
        self.frames
            .keys()
            .copied()
            .filter(|&k| seq_distance(k, expected) >= 0)
            .min_by_key(|&k| seq_distance(k, expected))
    }

    /// Emit the next frame, if the buffer is ready to.
    pub fn pop(&mut self) -> JitterPop {
        let expected = match self.expected_seq {
            Some(e) => e,
            None => return JitterPop::Waiting,
        };

        if self.filling {
            if self.frames.len() < self.target_fill {
                return JitterPop::Waiting;
            }
            self.filling = false;
        }

        if let Some(frame) = self.frames.remove(&expected) {
            self.expected_seq = Some(expected.wrapping_add(1));
            self.stats.emitted += 1;
            return JitterPop::Ready(frame);
        }

        if self.frames.len() < self.target_fill {
            return JitterPop::Waiting;
        }

        // Expected is gone and the buffer is deep: declare loss and resume
        // at the nearest buffered frame that is not in the past.
        self.stats.losses += 1;
        match self.next_key_at_or_after(expected) {
            Some(next) => {
                let frame = self
                    .frames
                    .remove(&next)
                    .unwrap_or_else(Frame::silence);
                self.expected_seq = Some(next.wrapping_add(1));
                self.stats.emitted += 1;
                JitterPop::Recovered(frame)
            }
            None => {
                self.expected_seq = Some(expected.wrapping_add(1));
                JitterPop::Missing
            }
        }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn target_fill(&self) -> usize {
        self.target_fill
    }

    pub fn set_target_fill(&mut self, target_fill: usize) {
        self.target_fill = target_fill;
    }

    pub fn expected_seq(&self) -> Option<u16> {
        self.expected_seq
    }

    pub fn stats(&self) -> &JitterStats {
        &self.stats
    }
}

impl Default for JitterBuffer {
    fn default() -> Self {
        Self::new(JITTER_TARGET_INITIAL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::FRAME_SAMPLES;

    fn marked(value: i16) -> Frame {
        Frame::from_samples(vec![value; FRAME_SAMPLES])
    }

    #[test]
    fn test_frame_queue_drop_oldest() {
        let queue = FrameQueue::new(2);
        queue.push(marked(1));
        queue.push(marked(2));
        queue.push(marked(3));

        assert_eq!(queue.dropped(), 1);
        assert_eq!(queue.pop().unwrap().samples[0], 2);
        assert_eq!(queue.pop().unwrap().samples[0], 3);
        assert!(queue.pop().is_none());
        assert_eq!(queue.underruns(), 1);
    }

    #[test]
    fn test_holds_until_target_fill() {
        let mut jb = JitterBuffer::new(10);
        for seq in 0..9u16 {
            jb.push(seq, marked(seq as i16));
            assert_eq!(jb.pop(), JitterPop::Waiting);
        }
        jb.push(9, marked(9));
        match jb.pop() {
            JitterPop::Ready(f) => assert_eq!(f.samples[0], 0),
            other => panic!("expected Ready, got {other:?}"),
        }
    }

    #[test]
    fn test_in_order_emission_and_plc_handoff() {
        let mut jb = JitterBuffer::new(10);
        for seq in 100..120u16 {
            jb.push(seq, marked(seq as i16));
        }
        for seq in 100..120u16 {
            match jb.pop() {
                JitterPop::Ready(f) => assert_eq!(f.samples[0], seq as i16),
                other => panic!("expected Ready at {seq}, got {other:?}"),
            }
        }
        // Drained below target with nothing newer: waits, caller conceals.
        assert_eq!(jb.pop(), JitterPop::Waiting);
        assert_eq!(jb.expected_seq(), Some(120));
    }

    #[test]
    fn test_sequence_wrap_in_order() {
        let mut jb = JitterBuffer::new(10);
        for seq in (65530..=65535u16).chain(0..6u16) {
            jb.push(seq, marked((seq % 100) as i16));
        }
        let mut emitted = Vec::new();
        for _ in 0..12 {
            match jb.pop() {
                JitterPop::Ready(f) => emitted.push(f.samples[0]),
                other => panic!("expected Ready, got {other:?}"),
            }
        }
        let expected: Vec<i16> = (65530..=65535u16)
            .chain(0..6u16)
            .map(|s| (s % 100) as i16)
            .collect();
        assert_eq!(emitted, expected);
        assert_eq!(jb.expected_seq(), Some(6));
    }

    #[test]
    fn test_out_of_order_arrival_reordered() {
        let mut jb = JitterBuffer::new(3);
        jb.push(2, marked(2));
        jb.push(0, marked(0));
        jb.push(1, marked(1));
        // First push fixed expected at 2; 0 and 1 are in the past but within
        // the window, so they stay buffered yet are never emitted.
        match jb.pop() {
            JitterPop::Ready(f) => assert_eq!(f.samples[0], 2),
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn test_gap_skip_recovers() {
        let mut jb = JitterBuffer::new(10);
        jb.push(200, marked(0));
        jb.push(201, marked(1));
        jb.push(202, marked(2));
        for seq in 204..=215u16 {
            jb.push(seq, marked((seq - 200) as i16));
        }

        for want in [0, 1, 2] {
            match jb.pop() {
                JitterPop::Ready(f) => assert_eq!(f.samples[0], want),
                other => panic!("{other:?}"),
            }
        }
        // 203 never arrived; occupancy is still past the fill target, so the
        // 4th pop declares loss and resumes at 204.
        match jb.pop() {
            JitterPop::Recovered(f) => assert_eq!(f.samples[0], 4),
            other => panic!("expected Recovered, got {other:?}"),
        }
        assert_eq!(jb.expected_seq(), Some(205));
        assert_eq!(jb.stats().losses, 1);
    }

    #[test]
    fn test_too_old_frames_discarded() {
        let mut jb = JitterBuffer::new(1);
        jb.push(1000, marked(0));
        jb.push(1000u16.wrapping_sub(300), marked(1));
        assert_eq!(jb.len(), 1);
        assert_eq!(jb.stats().late_discarded, 1);
    }

    #[test]
    fn test_eviction_drops_farthest_past() {
        let mut jb = JitterBuffer::new(1);
        for i in 0..JITTER_MAX_SIZE as u16 {
            jb.push(i, marked(0));
        }
        assert_eq!(jb.len(), JITTER_MAX_SIZE);

        jb.push(JITTER_MAX_SIZE as u16, marked(0));
        assert_eq!(jb.len(), JITTER_MAX_SIZE);
        // Seq 0 was the farthest past and must be the one evicted.
        assert!(!jb.frames.contains_key(&0));
        assert!(jb.frames.contains_key(&(JITTER_MAX_SIZE as u16)));
        assert_eq!(jb.stats().evicted, 1);
    }

    #[test]
    fn test_duplicate_overwrites() {
        let mut jb = JitterBuffer::new(1);
        jb.push(5, marked(1));
        jb.push(5, marked(2));
        assert_eq!(jb.len(), 1);
        match jb.pop() {
            JitterPop::Ready(f) => assert_eq!(f.samples[0], 2),
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn test_missing_with_nothing_ahead_advances() {
        let mut jb = JitterBuffer::new(2);
        jb.push(10, marked(0));
        jb.push(11, marked(1));
        assert!(matches!(jb.pop(), JitterPop::Ready(_)));
        assert!(matches!(jb.pop(), JitterPop::Ready(_)));
        // Refill with frames that are all in the past relative to expected.
        jb.push(3, marked(9));
        jb.push(4, marked(9));
        assert_eq!(jb.pop(), JitterPop::Missing);
        assert_eq!(jb.expected_seq(), Some(13));
    }
}
