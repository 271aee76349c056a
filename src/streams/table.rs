//! Shared stream table
//!
//! The client's one coarse-grained piece of shared mutable state: the map of
//! per-sender streams, the set of senders the user wants to hear, and the
//! current adaptive jitter target. Critical sections stay down at map
//! lookups and small mutations; decode and mixing never happen under the
//! lock holder's I/O.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::audio::frame::Frame;
use crate::constants::JITTER_TARGET_INITIAL;
use crate::streams::state::StreamState;

/// Coarse-locked stream table
pub struct StreamTable {
    streams: HashMap<String, StreamState>,
    hear_targets: HashSet<String>,
    /// Applied to every stream and inherited by new ones
    jitter_target: usize,
}

impl StreamTable {
    pub fn new() -> Self {
        Self {
            streams: HashMap::new(),
            hear_targets: HashSet::new(),
            jitter_target: JITTER_TARGET_INITIAL,
        }
    }

    /// Replace the hear set. Streams for senders no longer heard are
    /// destroyed immediately; calling twice with the same set is a no-op.
    pub fn set_hear_targets<I, S>(&mut self, targets: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.hear_targets = targets.into_iter().map(Into::into).collect();
        let hear = self.hear_targets.clone();
        self.streams.retain(|id, _| hear.contains(id));
    }

    pub fn hear_targets(&self) -> &HashSet<String> {
        &self.hear_targets
    }

    /// Route a decoded frame to its sender's stream, creating the stream on
    /// first contact.
    pub fn push_frame(&mut self, sender_id: &str, seq: Option<u16>, frame: Frame) {
        let target = self.jitter_target;
        self.streams
            .entry(sender_id.to_string())
            .or_insert_with(|| StreamState::new(target))
            .push(seq, frame);
    }

    pub fn stream_mut(&mut self, sender_id: &str) -> Option<&mut StreamState> {
        self.streams.get_mut(sender_id)
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    pub fn contains(&self, sender_id: &str) -> bool {
        self.streams.contains_key(sender_id)
    }

    /// Per-source gain; unknown senders are ignored.
    pub fn set_gain(&mut self, sender_id: &str, gain: f32) {
        if let Some(stream) = self.streams.get_mut(sender_id) {
            stream.set_gain(gain);
        }
    }

    pub fn jitter_target(&self) -> usize {
        self.jitter_target
    }

    /// Apply a new adaptive target to every stream; new streams inherit it.
    pub fn set_jitter_target(&mut self, target: usize) {
        self.jitter_target = target;
        for stream in self.streams.values_mut() {
            stream.set_target_fill(target);
        }
    }
}

impl Default for StreamTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared handle to the stream table
pub type SharedStreamTable = Arc<Mutex<StreamTable>>;

pub fn create_shared_table() -> SharedStreamTable {
    Arc::new(Mutex::new(StreamTable::new()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::FRAME_SAMPLES;

    fn frame() -> Frame {
        Frame::from_samples(vec![100; FRAME_SAMPLES])
    }

    #[test]
    fn test_stream_created_on_first_frame() {
        let mut table = StreamTable::new();
        assert_eq!(table.stream_count(), 0);
        table.push_frame("2", Some(0), frame());
        assert_eq!(table.stream_count(), 1);
        table.push_frame("2", Some(1), frame());
        assert_eq!(table.stream_count(), 1);
    }

    #[test]
    fn test_hear_target_shrink_destroys_exactly_removed() {
        let mut table = StreamTable::new();
        table.set_hear_targets(["1", "2", "3"]);
        for id in ["1", "2", "3"] {
            table.push_frame(id, Some(0), frame());
        }

        table.set_hear_targets(["1", "3"]);
        assert_eq!(table.stream_count(), 2);
        assert!(table.contains("1"));
        assert!(!table.contains("2"));
        assert!(table.contains("3"));
    }

    #[test]
    fn test_set_hear_targets_idempotent() {
        let mut table = StreamTable::new();
        table.set_hear_targets(["1", "2"]);
        table.push_frame("1", Some(0), frame());
        table.push_frame("2", Some(0), frame());

        table.set_hear_targets(["1", "2"]);
        assert_eq!(table.stream_count(), 2);
        table.set_hear_targets(["1", "2"]);
        assert_eq!(table.stream_count(), 2);
    }

    #[test]
    fn test_new_streams_inherit_dynamic_target() {
        let mut table = StreamTable::new();
        table.set_jitter_target(12);
        table.push_frame("5", Some(0), frame());
        assert_eq!(
            table.stream_mut("5").unwrap().jitter().target_fill(),
            12
        );
    }

    #[test]
    fn test_target_applied_to_existing_streams() {
        let mut table = StreamTable::new();
        table.push_frame("5", Some(0), frame());
        table.set_jitter_target(14);
        assert_eq!(
            table.stream_mut("5").unwrap().jitter().target_fill(),
            14
        );
    }
}
