//! The client-side voice engine
//!
//! Owns the whole data plane: the receive socket and its decoder pool, the
//! stream table, the mixer and playback sink (always on), and the capture
//! session (capture + preprocess + encode + send), which starts and stops
//! with push-to-talk. Capture sessions are tied to a generation counter so
//! stop/start races can never leave two sender threads alive.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use crossbeam_channel::bounded;
use tokio::sync::broadcast;

use crate::audio::buffer::{create_shared_queue, SharedFrameQueue};
use crate::audio::capture::CaptureSource;
use crate::audio::frame::Frame;
use crate::audio::playback::{PlaybackSink, PlaybackStats};
use crate::audio::preprocess::PreprocessorOptions;
use crate::config::AppConfig;
use crate::constants::{
    AUDIO_PORT, DECODE_QUEUE_CAPACITY, INPUT_QUEUE_CAPACITY, OUTPUT_QUEUE_CAPACITY,
};
use crate::network::receiver::{AudioReceiver, ReceiverStats};
use crate::network::sender::{AudioSender, SenderStats};
use crate::network::udp::{create_receive_socket, create_send_socket};
use crate::streams::decoder_pool::{DecodeItem, DecoderPool, DecoderPoolStats};
use crate::streams::mixer::{Mixer, MixerStats};
use crate::streams::table::{create_shared_table, SharedStreamTable};
use crate::Result;

/// Engine lifecycle notifications
#[derive(Debug, Clone)]
pub enum EngineEvent {
    CaptureStarted,
    CaptureStopped,
    HearTargetsChanged(Vec<String>),
}

/// Aggregated statistics snapshot
#[derive(Debug, Clone, Default)]
pub struct EngineStats {
    pub receiver: ReceiverStats,
    pub sender: Option<SenderStats>,
    pub mixer: MixerStats,
    pub playback: PlaybackStats,
    pub decoder_pool: DecoderPoolStats,
    pub active_streams: usize,
    pub jitter_target: usize,
}

/// The assembled client data plane
pub struct VoiceEngine {
    client_id: String,
    config: AppConfig,

    streams: SharedStreamTable,
    output_queue: SharedFrameQueue,

    playback: PlaybackSink,
    mixer: Mixer,
    decoder_pool: DecoderPool,
    receiver: AudioReceiver,

    /// Local UDP port the hub should forward our peers' audio to
    audio_port: u16,

    /// Capture session, present while talking
    capture: Option<CaptureSource>,
    sender: Option<AudioSender>,

    /// Bumped on every capture start/stop
    generation: Arc<AtomicU64>,

    event_tx: broadcast::Sender<EngineEvent>,
}

impl VoiceEngine {
    /// Bring up the always-on receive side: socket, decoder pool, mixer,
    /// playback. A failure part-way through drops whatever was already
    /// built, which releases its threads and sockets.
    pub fn new(client_id: String, config: AppConfig) -> Result<Self> {
        let socket = create_receive_socket(&config.network)?;
        let audio_port = socket.local_addr().map(|a| a.port()).unwrap_or(0);

        let streams = create_shared_table();
        let output_queue = create_shared_queue(OUTPUT_QUEUE_CAPACITY);

        let (decode_tx, decode_rx) = bounded::<DecodeItem>(DECODE_QUEUE_CAPACITY);
        let decoder_pool = DecoderPool::start(decode_rx.clone(), streams.clone())?;

        let receiver =
            AudioReceiver::start(socket, client_id.clone(), decode_tx, decode_rx)?;

        let mut playback = PlaybackSink::new(
            config.audio.output_device.clone(),
            output_queue.clone(),
        );
        playback.start()?;

        let mixer = Mixer::start(
            streams.clone(),
            output_queue.clone(),
            playback.callback_counter(),
            playback.underrun_counter(),
        )?;

        let (event_tx, _) = broadcast::channel(64);

        tracing::info!(client = %client_id, port = audio_port, "engine listening");

        Ok(Self {
            client_id,
            config,
            streams,
            output_queue,
            playback,
            mixer,
            decoder_pool,
            receiver,
            audio_port,
            capture: None,
            sender: None,
            generation: Arc::new(AtomicU64::new(0)),
            event_tx,
        })
    }

    /// The ephemeral port our receive socket landed on (announced to the
    /// hub at registration).
    pub fn audio_port(&self) -> u16 {
        self.audio_port
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Subscribe to engine events.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.event_tx.subscribe()
    }

    /// Begin a capture session toward the hub. Idempotent while running.
    /// On any failure the transaction rolls back: whatever was started is
    /// stopped and released.
    pub fn start_capture(&mut self, hub_ip: IpAddr) -> Result<()> {
        if self.sender.is_some() {
            return Ok(());
        }

        let socket = create_send_socket(&self.config.network)?;

        // A fresh input queue per session; its only producer lives inside
        // the capture thread, so the sender's receive side disconnects the
        // moment capture dies.
        let (input_tx, input_rx) = bounded::<Frame>(INPUT_QUEUE_CAPACITY);

        let mut capture = CaptureSource::new(
            self.config.audio.input_device.clone(),
            input_tx,
            input_rx.clone(),
        );
        capture.start()?;

        let options = PreprocessorOptions {
            echo_suppression: self.config.audio.echo_suppression,
            smoothing: self.config.audio.smoothing,
        };

        let sender = match AudioSender::start(
            self.client_id.clone(),
            SocketAddr::new(hub_ip, AUDIO_PORT),
            socket,
            input_rx,
            self.playback.last_played(),
            options,
            self.config.audio.bitrate,
            self.generation.clone(),
        ) {
            Ok(sender) => sender,
            Err(e) => {
                capture.stop();
                return Err(e.into());
            }
        };

        self.capture = Some(capture);
        self.sender = Some(sender);
        let _ = self.event_tx.send(EngineEvent::CaptureStarted);
        Ok(())
    }

    /// End the capture session. The device stream stops before the send
    /// socket is released.
    pub fn stop_capture(&mut self) {
        if let Some(mut capture) = self.capture.take() {
            capture.stop();
        }
        if let Some(mut sender) = self.sender.take() {
            sender.stop();
        }
        let _ = self.event_tx.send(EngineEvent::CaptureStopped);
    }

    pub fn is_talking(&self) -> bool {
        self.sender.is_some()
    }

    /// Replace the set of senders we render. Streams for removed senders
    /// are destroyed immediately.
    pub fn set_hear_targets<I, S>(&self, targets: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let targets: Vec<String> = targets.into_iter().map(Into::into).collect();
        self.streams.lock().set_hear_targets(targets.clone());
        let _ = self
            .event_tx
            .send(EngineEvent::HearTargetsChanged(targets));
    }

    /// Per-source playback gain.
    pub fn set_stream_gain(&self, sender_id: &str, gain: f32) {
        self.streams.lock().set_gain(sender_id, gain);
    }

    pub fn stats(&self) -> EngineStats {
        let (active_streams, jitter_target) = {
            let table = self.streams.lock();
            (table.stream_count(), table.jitter_target())
        };
        EngineStats {
            receiver: self.receiver.stats(),
            sender: self.sender.as_ref().map(AudioSender::stats),
            mixer: self.mixer.stats(),
            playback: self.playback.stats(),
            decoder_pool: self.decoder_pool.stats(),
            active_streams,
            jitter_target,
        }
    }

    /// Depth of the output queue (frames awaiting the device)
    pub fn output_queue_depth(&self) -> usize {
        self.output_queue.len()
    }

    /// Tear the whole engine down: capture session first, then the
    /// always-on receive side.
    pub fn shutdown(&mut self) {
        self.stop_capture();
        self.mixer.stop();
        self.playback.stop();
        self.receiver.stop();
        self.decoder_pool.stop();
        tracing::info!(client = %self.client_id, "engine shut down");
    }
}

impl Drop for VoiceEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
