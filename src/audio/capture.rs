//! Audio capture from the input device
//!
//! The device callback re-chunks whatever buffer sizes the backend delivers
//! into exact 20 ms frames and pushes them onto the bounded input queue.
//! The callback never blocks; on a full queue the oldest frame is dropped so
//! the sender always works on fresh audio.

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{BufferSize, SampleRate, StreamConfig};
use crossbeam_channel::{bounded, Receiver, Sender};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::audio::device::find_input_device;
use crate::audio::frame::Frame;
use crate::constants::{CHANNELS, FRAME_SAMPLES, SAMPLE_RATE};
use crate::error::AudioError;

/// Capture source feeding the input queue
///
/// The capture thread owns the queue's only producer handle. When the
/// stream dies, by `stop()` or by a device error, the handle drops and the
/// queue disconnects, which is how the sender loop learns capture is gone.
pub struct CaptureSource {
    /// Configured device name; None picks the host default
    device_name: Option<String>,

    /// Whether capture is running
    running: Arc<AtomicBool>,

    /// Producer side of the input queue, handed to the thread on start
    frame_tx: Option<Sender<Frame>>,

    /// Consumer handle used only to realize drop-oldest on overflow
    overflow_rx: Receiver<Frame>,

    /// Stream thread handle
    thread_handle: Option<JoinHandle<()>>,

    /// Channel for stream errors
    error_rx: Option<Receiver<AudioError>>,

    /// Frames dropped on input-queue overflow
    dropped: Arc<AtomicU64>,

    /// Frames captured
    captured: Arc<AtomicU64>,
}

impl CaptureSource {
    pub fn new(
        device_name: Option<String>,
        frame_tx: Sender<Frame>,
        overflow_rx: Receiver<Frame>,
    ) -> Self {
        Self {
            device_name,
            running: Arc::new(AtomicBool::new(false)),
            frame_tx: Some(frame_tx),
            overflow_rx,
            thread_handle: None,
            error_rx: None,
            dropped: Arc::new(AtomicU64::new(0)),
            captured: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Start capturing audio. A capture source runs at most one session;
    /// the engine builds a fresh one per push-to-talk press.
    pub fn start(&mut self) -> Result<(), AudioError> {
        if self.running.load(Ordering::SeqCst) {
            return Ok(());
        }
        let Some(frame_tx) = self.frame_tx.take() else {
            return Err(AudioError::StreamError(
                "capture source already consumed".to_string(),
            ));
        };

        // Resolve the device up front so a missing device fails the start
        // transaction instead of dying silently inside the thread.
        let device = find_input_device(self.device_name.as_deref())?;

        let (error_tx, error_rx) = bounded::<AudioError>(16);
        self.error_rx = Some(error_rx);

        let running = self.running.clone();
        let running_for_loop = self.running.clone();
        let running_for_error = self.running.clone();
        let overflow_rx = self.overflow_rx.clone();
        let dropped = self.dropped.clone();
        let captured = self.captured.clone();

        let config = StreamConfig {
            channels: CHANNELS,
            sample_rate: SampleRate(SAMPLE_RATE),
            buffer_size: BufferSize::Fixed(FRAME_SAMPLES as u32),
        };

        running.store(true, Ordering::SeqCst);

        let handle = thread::Builder::new()
            .name("capture".to_string())
            .spawn(move || {
                // Accumulates device buffers into exact 320-sample frames
                let mut pending: Vec<i16> = Vec::with_capacity(FRAME_SAMPLES * 2);

                let stream = device.build_input_stream(
                    &config,
                    move |data: &[i16], _: &cpal::InputCallbackInfo| {
                        if !running.load(Ordering::Relaxed) {
                            return;
                        }

                        pending.extend_from_slice(data);
                        while pending.len() >= FRAME_SAMPLES {
                            let rest = pending.split_off(FRAME_SAMPLES);
                            let frame = Frame {
                                samples: std::mem::replace(&mut pending, rest),
                            };
                            captured.fetch_add(1, Ordering::Relaxed);

                            if let Err(rejected) = frame_tx.try_send(frame) {
                                // Full: discard the oldest queued frame and
                                // retry once so the new frame lands.
                                let _ = overflow_rx.try_recv();
                                dropped.fetch_add(1, Ordering::Relaxed);
                                let _ = frame_tx.try_send(rejected.into_inner());
                            }
                        }
                    },
                    move |err| {
                        // A dead device ends the session; dropping the
                        // producer tells the sender.
                        running_for_error.store(false, Ordering::SeqCst);
                        let _ = error_tx.try_send(AudioError::StreamError(err.to_string()));
                    },
                    None,
                );

                match stream {
                    Ok(stream) => {
                        if let Err(e) = stream.play() {
                            tracing::error!("failed to start capture stream: {}", e);
                            running_for_loop.store(false, Ordering::SeqCst);
                            return;
                        }
                        while running_for_loop.load(Ordering::Relaxed) {
                            thread::sleep(std::time::Duration::from_millis(10));
                        }
                        // Stream drops here, and with it the input-queue
                        // producer, before the send socket goes away.
                    }
                    Err(e) => {
                        tracing::error!("failed to build capture stream: {}", e);
                        running_for_loop.store(false, Ordering::SeqCst);
                    }
                }
            })
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        self.thread_handle = Some(handle);
        Ok(())
    }

    /// Stop capturing
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Frames dropped because the input queue was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Frames delivered since start
    pub fn captured(&self) -> u64 {
        self.captured.load(Ordering::Relaxed)
    }

    /// Pull the most recent stream error, if any.
    pub fn check_errors(&self) -> Option<AudioError> {
        self.error_rx.as_ref().and_then(|rx| rx.try_recv().ok())
    }
}

impl Drop for CaptureSource {
    fn drop(&mut self) {
        self.stop();
    }
}
