//! Receive-side stream plumbing: per-sender state, the shared table,
//! asynchronous decoding, and the 20 ms mixer.

pub mod decoder_pool;
pub mod mixer;
pub mod state;
pub mod table;

pub use decoder_pool::{enqueue_drop_oldest, DecodeItem, DecoderPool, DecoderPoolStats};
pub use mixer::{AdaptiveJitterController, Mixer, MixerStats};
pub use state::{PopOutcome, StreamState};
pub use table::{create_shared_table, SharedStreamTable, StreamTable};
