//! Capture-side encode-and-send loop
//!
//! One thread drains the input queue, runs the preprocessor against the
//! playback far-end reference, encodes, and emits sequenced datagrams to
//! the hub. The sequence and timestamp counters only advance after a
//! successful send so receivers never see holes caused by local errors.
//!
//! The loop is tied to a generation counter bumped on every start/stop:
//! even if `running` is reasserted by a racing start, a stale generation
//! forces the old thread out, keeping at most one active sender per client
//! lifetime.

use crossbeam_channel::{Receiver, RecvTimeoutError};
use parking_lot::Mutex;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::audio::frame::Frame;
use crate::audio::preprocess::{Preprocessor, PreprocessorOptions};
use crate::codec::OpusEncoder;
use crate::constants::{FRAME_SAMPLES, SENDER_JOIN_TIMEOUT, SENDER_RECV_TIMEOUT};
use crate::error::CodecError;
use crate::protocol::AudioPacket;

/// Sender statistics snapshot
#[derive(Debug, Clone, Copy, Default)]
pub struct SenderStats {
    pub packets_sent: u64,
    pub send_errors: u64,
    pub encode_errors: u64,
}

/// The encode/send thread for one capture session
pub struct AudioSender {
    thread_handle: Option<JoinHandle<()>>,
    running: Arc<AtomicBool>,
    generation: Arc<AtomicU64>,
    packets_sent: Arc<AtomicU64>,
    send_errors: Arc<AtomicU64>,
    encode_errors: Arc<AtomicU64>,
}

impl AudioSender {
    /// Start a sender for the given generation counter. The counter is
    /// owned by the engine so stop/start cycles stay totally ordered.
    #[allow(clippy::too_many_arguments)]
    pub fn start(
        client_id: String,
        hub_addr: SocketAddr,
        socket: UdpSocket,
        frame_rx: Receiver<Frame>,
        far_reference: Arc<Mutex<Frame>>,
        options: PreprocessorOptions,
        bitrate: u32,
        generation: Arc<AtomicU64>,
    ) -> Result<Self, CodecError> {
        // Build the encoder before spawning so a codec failure aborts the
        // start transaction instead of producing a dead thread.
        let encoder = OpusEncoder::new(bitrate)?;

        let running = Arc::new(AtomicBool::new(true));
        let packets_sent = Arc::new(AtomicU64::new(0));
        let send_errors = Arc::new(AtomicU64::new(0));
        let encode_errors = Arc::new(AtomicU64::new(0));

        let my_generation = generation.fetch_add(1, Ordering::SeqCst) + 1;

        let thread_running = running.clone();
        let thread_generation = generation.clone();
        let thread_sent = packets_sent.clone();
        let thread_send_errors = send_errors.clone();
        let thread_encode_errors = encode_errors.clone();

        let handle = thread::Builder::new()
            .name("sender".to_string())
            .spawn(move || {
                Self::sender_loop(
                    client_id,
                    hub_addr,
                    socket,
                    frame_rx,
                    far_reference,
                    options,
                    encoder,
                    thread_running,
                    thread_generation,
                    my_generation,
                    thread_sent,
                    thread_send_errors,
                    thread_encode_errors,
                );
            })
            .map_err(|e| CodecError::EncoderInit(e.to_string()))?;

        Ok(Self {
            thread_handle: Some(handle),
            running,
            generation,
            packets_sent,
            send_errors,
            encode_errors,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn sender_loop(
        client_id: String,
        hub_addr: SocketAddr,
        socket: UdpSocket,
        frame_rx: Receiver<Frame>,
        far_reference: Arc<Mutex<Frame>>,
        options: PreprocessorOptions,
        mut encoder: OpusEncoder,
        running: Arc<AtomicBool>,
        generation: Arc<AtomicU64>,
        my_generation: u64,
        packets_sent: Arc<AtomicU64>,
        send_errors: Arc<AtomicU64>,
        encode_errors: Arc<AtomicU64>,
    ) {
        let mut preprocessor = Preprocessor::new(options);
        let mut seq: u16 = 0;
        let mut timestamp: u32 = 0;

        tracing::info!(client = %client_id, hub = %hub_addr, "capture active");

        loop {
            if !running.load(Ordering::Relaxed)
                || generation.load(Ordering::Relaxed) != my_generation
            {
                break;
            }

            let mut frame = match frame_rx.recv_timeout(SENDER_RECV_TIMEOUT) {
                Ok(frame) => frame,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };

            let far = far_reference.lock().clone();
            let vad = preprocessor.process(&mut frame, Some(&far));

            let payload = match encoder.encode(&frame) {
                Ok(payload) => payload,
                Err(e) => {
                    let n = encode_errors.fetch_add(1, Ordering::Relaxed) + 1;
                    if n % 100 == 1 {
                        tracing::warn!(count = n, "encode failed: {}", e);
                    }
                    continue;
                }
            };

            let packet = AudioPacket::new(&client_id, seq, timestamp, vad, payload);
            match socket.send_to(&packet.serialize(), hub_addr) {
                Ok(_) => {
                    // Counters advance only on success.
                    seq = seq.wrapping_add(1);
                    timestamp = timestamp.wrapping_add(FRAME_SAMPLES as u32);
                    let sent = packets_sent.fetch_add(1, Ordering::Relaxed) + 1;
                    if sent % 500 == 0 {
                        tracing::debug!(client = %client_id, sent, "sending");
                    }
                }
                Err(e) => {
                    if !running.load(Ordering::Relaxed) {
                        break;
                    }
                    let n = send_errors.fetch_add(1, Ordering::Relaxed) + 1;
                    if n % 100 == 1 {
                        tracing::warn!(count = n, "send failed: {}", e);
                    }
                }
            }
        }

        tracing::info!(client = %client_id, "sender exited");
    }

    /// Signal shutdown and wait up to the join timeout for the thread.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        // Invalidate the generation so a racing restart cannot revive us.
        self.generation.fetch_add(1, Ordering::SeqCst);

        if let Some(handle) = self.thread_handle.take() {
            let deadline = Instant::now() + SENDER_JOIN_TIMEOUT;
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(10));
            }
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                tracing::warn!("sender thread did not exit within the join timeout");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> SenderStats {
        SenderStats {
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
            encode_errors: self.encode_errors.load(Ordering::Relaxed),
        }
    }
}

impl Drop for AudioSender {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::INPUT_QUEUE_CAPACITY;
    use crossbeam_channel::bounded;

    fn start_test_sender(
        frame_rx: Receiver<Frame>,
        generation: Arc<AtomicU64>,
    ) -> (AudioSender, UdpSocket) {
        let sink = UdpSocket::bind("127.0.0.1:0").unwrap();
        let hub_addr = sink.local_addr().unwrap();
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let sender = AudioSender::start(
            "t".to_string(),
            hub_addr,
            socket,
            frame_rx,
            Arc::new(Mutex::new(Frame::silence())),
            PreprocessorOptions {
                echo_suppression: false,
                smoothing: false,
            },
            crate::constants::DEFAULT_BITRATE,
            generation,
        )
        .unwrap();
        (sender, sink)
    }

    #[test]
    fn test_frames_become_sequenced_datagrams() {
        let (frame_tx, frame_rx) = bounded::<Frame>(INPUT_QUEUE_CAPACITY);
        let (mut sender, sink) = start_test_sender(frame_rx, Arc::new(AtomicU64::new(0)));
        sink.set_read_timeout(Some(Duration::from_secs(2))).unwrap();

        frame_tx.send(Frame::silence()).unwrap();
        frame_tx.send(Frame::silence()).unwrap();

        let mut buf = [0u8; 2048];
        let (size, _) = sink.recv_from(&mut buf).unwrap();
        let first = AudioPacket::parse(&buf[..size]).unwrap();
        assert_eq!(first.sender_id, "t");
        assert_eq!(first.seq, Some(0));
        assert_eq!(first.timestamp, 0);

        let (size, _) = sink.recv_from(&mut buf).unwrap();
        let second = AudioPacket::parse(&buf[..size]).unwrap();
        assert_eq!(second.seq, Some(1));
        assert_eq!(second.timestamp, FRAME_SAMPLES as u32);

        sender.stop();
        assert_eq!(sender.stats().packets_sent, 2);
    }

    #[test]
    fn test_stop_returns_promptly_and_thread_exits() {
        let (_frame_tx, frame_rx) = bounded::<Frame>(INPUT_QUEUE_CAPACITY);
        let (mut sender, _sink) = start_test_sender(frame_rx, Arc::new(AtomicU64::new(0)));

        let started = Instant::now();
        sender.stop();
        assert!(started.elapsed() < SENDER_JOIN_TIMEOUT);
        assert!(!sender.is_running());
    }

    #[test]
    fn test_generation_bump_forces_exit_despite_running_flag() {
        let (_frame_tx, frame_rx) = bounded::<Frame>(INPUT_QUEUE_CAPACITY);
        let generation = Arc::new(AtomicU64::new(0));
        let (mut sender, _sink) = start_test_sender(frame_rx, generation.clone());

        // Simulate a racing start: the flag stays true, only the
        // generation moves on.
        generation.fetch_add(1, Ordering::SeqCst);
        thread::sleep(SENDER_RECV_TIMEOUT + Duration::from_millis(100));

        assert!(sender
            .thread_handle
            .as_ref()
            .map(|h| h.is_finished())
            .unwrap_or(true));
        sender.stop();
    }
}
