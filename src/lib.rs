//! # LAN Voice PTT
//!
//! Low-latency multi-party push-to-talk voice conferencing over LAN.
//!
//! Two programs cooperate: a **client** (capture/playback endpoint) and a
//! **hub** (UDP forwarder + control-plane registry).
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                               CLIENT                                     │
//! │                                                                         │
//! │  Microphone ──► CaptureSource ──► input queue ──► Sender thread         │
//! │                                     (128)          │  Preprocessor      │
//! │                                                    │  OpusEncoder       │
//! │                                                    ▼                    │
//! │                                            UDP id|seq|ts|vad|payload   │
//! │                                                    │                    │
//! │  Speaker ◄── PlaybackSink ◄── output queue ◄── Mixer (20 ms ticks)     │
//! │                                  (48)             ▲                     │
//! │                                                   │ pop_for_mix()       │
//! │              StreamTable { StreamState: jitter buffer + PLC + gain }    │
//! │                                                   ▲                     │
//! │              DecoderPool (N workers) ◄── decode queue (2048)            │
//! │                                                   ▲                     │
//! │                                     Receiver ◄── UDP from hub           │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                       │
//! ┌─────────────────────────────────────┼───────────────────────────────────┐
//! │                                HUB  │                                   │
//! │   Forwarder (UDP 50002): sender-id routing to per-sender target sets   │
//! │   Control   (TCP 50001): REGISTER / JOIN / TARGETS / PING / UNREGISTER │
//! │   Discovery (UDP 50000): "VOICE_SERVER" beacon + probe replies         │
//! │   Reaper: drops clients silent for CLIENT_TIMEOUT_SECS                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

pub mod audio;
pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod hub;
pub mod network;
pub mod protocol;
pub mod streams;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    use std::time::Duration;

    /// Sample rate all audio runs at
    pub const SAMPLE_RATE: u32 = 16_000;

    /// Mono everywhere
    pub const CHANNELS: u16 = 1;

    /// Samples per 20 ms frame
    pub const FRAME_SAMPLES: usize = 320;

    /// Bytes per frame (i16 PCM)
    pub const FRAME_BYTES: usize = FRAME_SAMPLES * 2;

    /// Frame duration
    pub const FRAME_DURATION: Duration = Duration::from_millis(20);

    /// Default Opus bitrate in bits per second
    pub const DEFAULT_BITRATE: u32 = 16_000;

    /// UDP discovery port (hub beacon + client probes)
    pub const DISCOVERY_PORT: u16 = 50_000;

    /// TCP control port (one command per connection)
    pub const CONTROL_PORT: u16 = 50_001;

    /// UDP audio port on the hub
    pub const AUDIO_PORT: u16 = 50_002;

    /// Hub beacon payload
    pub const DISCOVERY_MAGIC: &[u8] = b"VOICE_SERVER";

    /// Client probe payload
    pub const DISCOVER_REQUEST: &[u8] = b"VOICE_DISCOVER";

    /// Beacon interval
    pub const BROADCAST_INTERVAL: Duration = Duration::from_secs(2);

    /// Client heartbeat interval while registered
    pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

    /// Heartbeat age after which the hub reaps a client
    pub const CLIENT_TIMEOUT_SECS: u64 = 30;

    /// Timeout for a single control round-trip
    pub const CONTROL_TIMEOUT: Duration = Duration::from_secs(5);

    /// Maximum sparse jitter buffer occupancy per sender
    pub const JITTER_MAX_SIZE: usize = 256;

    /// Initial jitter target fill (frames buffered before draining)
    pub const JITTER_TARGET_INITIAL: usize = 10;

    /// Adaptive target fill floor
    pub const JITTER_TARGET_MIN: usize = 8;

    /// Adaptive target fill ceiling
    pub const JITTER_TARGET_MAX: usize = 14;

    /// Adaptive controller window, in mixer ticks
    pub const ADAPT_WINDOW_TICKS: u64 = 200;

    /// Per-frame gain applied to repeated PLC output
    pub const PLC_DECAY: f32 = 0.85;

    /// Gain applied to the replayed frame on playback underrun
    pub const UNDERRUN_DECAY: f32 = 0.90;

    /// Crossfade weights for the first fresh frame after PLC (old, new)
    pub const CROSSFADE_OLD: f32 = 0.30;
    pub const CROSSFADE_NEW: f32 = 0.70;

    /// Decode queue capacity (encoded frames awaiting a worker)
    pub const DECODE_QUEUE_CAPACITY: usize = 2048;

    /// Output queue capacity (mixed frames awaiting the device)
    pub const OUTPUT_QUEUE_CAPACITY: usize = 48;

    /// Input queue capacity (captured frames awaiting the sender)
    pub const INPUT_QUEUE_CAPACITY: usize = 128;

    /// Sender thread input-queue wait per iteration
    pub const SENDER_RECV_TIMEOUT: Duration = Duration::from_millis(200);

    /// Decoder worker decode-queue wait per iteration
    pub const DECODE_RECV_TIMEOUT: Duration = Duration::from_secs(1);

    /// How long `stop()` waits for the sender thread to exit
    pub const SENDER_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

    /// RMS above which a frame counts as voice
    pub const VAD_THRESHOLD: f32 = 35.0;

    /// Frames VAD stays open after the last voiced frame
    pub const VAD_HANGOVER_FRAMES: u32 = 20;

    /// Gate close threshold floor (RMS)
    pub const NOISE_GATE_RMS: f32 = 70.0;

    /// Gate open threshold floor (RMS)
    pub const NOISE_GATE_ATTACK_RMS: f32 = 180.0;

    /// Gain applied below the close threshold
    pub const GATE_MIN_GAIN: f32 = 0.08;

    /// Gate envelope attack coefficient (opening)
    pub const GATE_ATTACK: f32 = 0.35;

    /// Gate envelope release coefficient (closing)
    pub const GATE_RELEASE: f32 = 0.05;

    /// Noise floor EMA coefficient when the estimate rises
    pub const NOISE_FLOOR_ALPHA_UP: f32 = 0.005;

    /// Noise floor EMA coefficient when the estimate falls
    pub const NOISE_FLOOR_ALPHA_DOWN: f32 = 0.02;

    /// Far-end RMS below which echo suppression never engages
    pub const ECHO_SUPPRESS_MIN_RMS: f32 = 300.0;

    /// Far-end RMS must be at least this fraction of the mic RMS
    pub const ECHO_FAR_TO_NEAR_RATIO: f32 = 0.8;

    /// Attenuation applied to the mic frame when echo is suspected
    pub const ECHO_ATTENUATE_GAIN: f32 = 0.65;

    /// One-pole DC blocker feedback coefficient
    pub const DC_BLOCK_R: f32 = 0.995;

    /// Optional capture smoothing: y = SMOOTH_PREV*y_prev + SMOOTH_NEW*x
    pub const SMOOTH_PREV: f32 = 0.6;
    pub const SMOOTH_NEW: f32 = 0.4;

    /// Multicast TTL for room groups
    pub const MULTICAST_TTL: u32 = 1;

    /// Socket buffer sizing for the audio sockets
    pub const UDP_SEND_BUFFER_SIZE: usize = 256 * 1024;
    pub const UDP_RECV_BUFFER_SIZE: usize = 256 * 1024;

    /// Largest datagram the receive paths accept
    pub const MAX_PACKET_SIZE: usize = 2048;
}
