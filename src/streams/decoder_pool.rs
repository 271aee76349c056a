//! Asynchronous decode of incoming encoded frames
//!
//! A fixed pool of worker threads drains the bounded decode queue. Each
//! worker owns an independent decoder instance, so decoding never serializes
//! across senders. Decoded frames land in the stream table under its lock;
//! everything expensive happens outside it.

use bytes::Bytes;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::codec::OpusDecoder;
use crate::constants::DECODE_RECV_TIMEOUT;
use crate::streams::table::SharedStreamTable;

/// One encoded frame waiting for a decoder
#[derive(Debug, Clone)]
pub struct DecodeItem {
    pub sender_id: String,
    pub payload: Bytes,
    pub seq: Option<u16>,
}

/// Enqueue with the pipeline-wide overflow policy: a full queue sheds its
/// oldest item to admit the new one. Returns true when something was shed.
pub fn enqueue_drop_oldest(tx: &Sender<DecodeItem>, rx: &Receiver<DecodeItem>, item: DecodeItem) -> bool {
    match tx.try_send(item) {
        Ok(()) => false,
        Err(err) => {
            let _ = rx.try_recv();
            let _ = tx.try_send(err.into_inner());
            true
        }
    }
}

/// Decoder pool statistics snapshot
#[derive(Debug, Clone, Copy, Default)]
pub struct DecoderPoolStats {
    pub decoded: u64,
    pub failures: u64,
    pub empty_results: u64,
}

/// Fixed pool of decoder workers
pub struct DecoderPool {
    workers: Vec<JoinHandle<()>>,
    running: Arc<AtomicBool>,
    decoded: Arc<AtomicU64>,
    failures: Arc<AtomicU64>,
    empty_results: Arc<AtomicU64>,
}

impl DecoderPool {
    /// Worker count: at least 4, or half the CPUs on bigger machines.
    pub fn worker_count() -> usize {
        let cpus = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        (cpus / 2).max(4)
    }

    /// Spawn the pool over a shared decode queue. A failed spawn stops and
    /// joins whatever workers already started before reporting the error.
    pub fn start(
        queue_rx: Receiver<DecodeItem>,
        streams: SharedStreamTable,
    ) -> std::io::Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let decoded = Arc::new(AtomicU64::new(0));
        let failures = Arc::new(AtomicU64::new(0));
        let empty_results = Arc::new(AtomicU64::new(0));

        let mut workers = Vec::with_capacity(Self::worker_count());
        for i in 0..Self::worker_count() {
            let queue_rx = queue_rx.clone();
            let streams = streams.clone();
            let worker_running = running.clone();
            let decoded = decoded.clone();
            let failures = failures.clone();
            let empty_results = empty_results.clone();

            let spawned = thread::Builder::new()
                .name(format!("decode-{i}"))
                .spawn(move || {
                    Self::worker_loop(
                        queue_rx,
                        streams,
                        worker_running,
                        decoded,
                        failures,
                        empty_results,
                    );
                });

            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    running.store(false, Ordering::SeqCst);
                    for handle in workers {
                        let _ = handle.join();
                    }
                    return Err(e);
                }
            }
        }

        Ok(Self {
            workers,
            running,
            decoded,
            failures,
            empty_results,
        })
    }

    fn worker_loop(
        queue_rx: Receiver<DecodeItem>,
        streams: SharedStreamTable,
        running: Arc<AtomicBool>,
        decoded: Arc<AtomicU64>,
        failures: Arc<AtomicU64>,
        empty_results: Arc<AtomicU64>,
    ) {
        let mut decoder = match OpusDecoder::new() {
            Ok(d) => d,
            Err(e) => {
                tracing::error!("decoder worker failed to initialize: {}", e);
                return;
            }
        };

        while running.load(Ordering::Relaxed) {
            let item = match queue_rx.recv_timeout(DECODE_RECV_TIMEOUT) {
                Ok(item) => item,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };

            // Empty payloads run the codec's native concealment.
            match decoder.decode(&item.payload) {
                Ok(frame) => {
                    if frame.is_empty() {
                        empty_results.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }
                    decoded.fetch_add(1, Ordering::Relaxed);
                    streams
                        .lock()
                        .push_frame(&item.sender_id, item.seq, frame);
                }
                Err(_) => {
                    failures.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    /// Stop the pool and join the workers.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }

    pub fn stats(&self) -> DecoderPoolStats {
        DecoderPoolStats {
            decoded: self.decoded.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            empty_results: self.empty_results.load(Ordering::Relaxed),
        }
    }
}

impl Drop for DecoderPool {
    fn drop(&mut self) {
        self.stop();
    }
}
