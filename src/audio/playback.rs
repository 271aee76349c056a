//! Audio playback to the output device
//!
//! The device callback drains the mixer's output queue one frame per 20 ms
//! request. On underrun it replays the previous frame at reduced gain
//! instead of snapping to silence, which masks the occasional late mixer
//! tick without audible clicks. Whatever was emitted is cached as the
//! far-end reference for the capture preprocessor.

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{BufferSize, SampleRate, StreamConfig};
use crossbeam_channel::{bounded, Receiver};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::audio::buffer::SharedFrameQueue;
use crate::audio::device::find_output_device;
use crate::audio::frame::Frame;
use crate::constants::{CHANNELS, FRAME_SAMPLES, SAMPLE_RATE, UNDERRUN_DECAY};
use crate::error::AudioError;

/// Playback statistics snapshot
#[derive(Debug, Clone, Copy, Default)]
pub struct PlaybackStats {
    pub callbacks: u64,
    pub underruns: u64,
}

/// Playback sink consuming the output queue
pub struct PlaybackSink {
    /// Configured device name; None picks the host default
    device_name: Option<String>,

    /// Whether playback is running
    running: Arc<AtomicBool>,

    /// Mixed frames from the mixer
    output_queue: SharedFrameQueue,

    /// Last emitted frame, read by the preprocessor as the echo reference
    last_played: Arc<Mutex<Frame>>,

    /// Stream thread handle
    thread_handle: Option<JoinHandle<()>>,

    /// Channel for stream errors
    error_rx: Option<Receiver<AudioError>>,

    /// Device callback count
    callbacks: Arc<AtomicU64>,

    /// Underrun count
    underruns: Arc<AtomicU64>,
}

impl PlaybackSink {
    pub fn new(device_name: Option<String>, output_queue: SharedFrameQueue) -> Self {
        Self {
            device_name,
            running: Arc::new(AtomicBool::new(false)),
            output_queue,
            last_played: Arc::new(Mutex::new(Frame::silence())),
            thread_handle: None,
            error_rx: None,
            callbacks: Arc::new(AtomicU64::new(0)),
            underruns: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Start playback
    pub fn start(&mut self) -> Result<(), AudioError> {
        if self.running.load(Ordering::SeqCst) {
            return Ok(());
        }

        let device = find_output_device(self.device_name.as_deref())?;

        let (error_tx, error_rx) = bounded::<AudioError>(16);
        self.error_rx = Some(error_rx);

        let running = self.running.clone();
        let running_for_loop = self.running.clone();
        let output_queue = self.output_queue.clone();
        let last_played = self.last_played.clone();
        let callbacks = self.callbacks.clone();
        let underruns = self.underruns.clone();

        let config = StreamConfig {
            channels: CHANNELS,
            sample_rate: SampleRate(SAMPLE_RATE),
            buffer_size: BufferSize::Fixed(FRAME_SAMPLES as u32),
        };

        running.store(true, Ordering::SeqCst);

        let handle = thread::Builder::new()
            .name("playback".to_string())
            .spawn(move || {
                let stream = device.build_output_stream(
                    &config,
                    move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                        if !running.load(Ordering::Relaxed) {
                            data.fill(0);
                            return;
                        }

                        for chunk in data.chunks_mut(FRAME_SAMPLES) {
                            callbacks.fetch_add(1, Ordering::Relaxed);
                            let frame = match output_queue.try_pop() {
                                Some(frame) => frame,
                                None => {
                                    underruns.fetch_add(1, Ordering::Relaxed);
                                    let cached = last_played.lock().clone();
                                    if cached.len() == FRAME_SAMPLES {
                                        cached.scaled(UNDERRUN_DECAY)
                                    } else {
                                        Frame::silence()
                                    }
                                }
                            };

                            let n = chunk.len().min(frame.samples.len());
                            chunk[..n].copy_from_slice(&frame.samples[..n]);
                            if n < chunk.len() {
                                chunk[n..].fill(0);
                            }

                            *last_played.lock() = frame;
                        }
                    },
                    move |err| {
                        let _ = error_tx.try_send(AudioError::StreamError(err.to_string()));
                    },
                    None,
                );

                match stream {
                    Ok(stream) => {
                        if let Err(e) = stream.play() {
                            tracing::error!("failed to start playback stream: {}", e);
                            return;
                        }
                        while running_for_loop.load(Ordering::Relaxed) {
                            thread::sleep(std::time::Duration::from_millis(10));
                        }
                    }
                    Err(e) => {
                        tracing::error!("failed to build playback stream: {}", e);
                    }
                }
            })
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        self.thread_handle = Some(handle);
        Ok(())
    }

    /// Stop playback
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Shared handle to the most recently played frame
    pub fn last_played(&self) -> Arc<Mutex<Frame>> {
        self.last_played.clone()
    }

    pub fn stats(&self) -> PlaybackStats {
        PlaybackStats {
            callbacks: self.callbacks.load(Ordering::Relaxed),
            underruns: self.underruns.load(Ordering::Relaxed),
        }
    }

    /// Shared callback counter, consumed by the adaptive jitter controller.
    pub fn callback_counter(&self) -> Arc<AtomicU64> {
        self.callbacks.clone()
    }

    /// Shared underrun counter, consumed by the adaptive jitter controller.
    pub fn underrun_counter(&self) -> Arc<AtomicU64> {
        self.underruns.clone()
    }

    /// Pull the most recent stream error, if any.
    pub fn check_errors(&self) -> Option<AudioError> {
        self.error_rx.as_ref().and_then(|rx| rx.try_recv().ok())
    }
}

impl Drop for PlaybackSink {
    fn drop(&mut self) {
        self.stop();
    }
}
