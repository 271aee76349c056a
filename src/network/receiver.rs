//! Client-side audio receiver
//!
//! Reads datagrams off the audio socket, parses both packet forms, rejects
//! reflections of our own stream, and dispatches encoded payloads to the
//! decode queue with the usual drop-oldest overflow policy.

use crossbeam_channel::{Receiver, Sender};
use dashmap::DashMap;
use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::constants::MAX_PACKET_SIZE;
use crate::error::NetworkError;
use crate::protocol::AudioPacket;
use crate::streams::decoder_pool::{enqueue_drop_oldest, DecodeItem};

/// Receiver statistics snapshot
#[derive(Debug, Clone, Default)]
pub struct ReceiverStats {
    pub packets_received: u64,
    pub malformed: u64,
    pub self_rejected: u64,
    pub queue_dropped: u64,
}

/// UDP receive loop feeding the decoder pool
pub struct AudioReceiver {
    thread_handle: Option<JoinHandle<()>>,
    running: Arc<AtomicBool>,
    packets_received: Arc<AtomicU64>,
    malformed: Arc<AtomicU64>,
    self_rejected: Arc<AtomicU64>,
    queue_dropped: Arc<AtomicU64>,
    /// Per-sender packet counts, for rate-limited logging
    per_sender: Arc<DashMap<String, u64>>,
}

impl AudioReceiver {
    /// Spawn the receive loop on an already-bound socket.
    pub fn start(
        socket: UdpSocket,
        client_id: String,
        decode_tx: Sender<DecodeItem>,
        decode_rx: Receiver<DecodeItem>,
    ) -> Result<Self, NetworkError> {
        socket
            .set_read_timeout(Some(Duration::from_millis(500)))
            .map_err(|e| NetworkError::ReceiveFailed(e.to_string()))?;

        let running = Arc::new(AtomicBool::new(true));
        let packets_received = Arc::new(AtomicU64::new(0));
        let malformed = Arc::new(AtomicU64::new(0));
        let self_rejected = Arc::new(AtomicU64::new(0));
        let queue_dropped = Arc::new(AtomicU64::new(0));
        let per_sender = Arc::new(DashMap::new());

        let thread_running = running.clone();
        let thread_received = packets_received.clone();
        let thread_malformed = malformed.clone();
        let thread_rejected = self_rejected.clone();
        let thread_dropped = queue_dropped.clone();
        let thread_per_sender = per_sender.clone();

        let handle = thread::Builder::new()
            .name("receiver".to_string())
            .spawn(move || {
                let mut buf = [0u8; MAX_PACKET_SIZE];
                while thread_running.load(Ordering::Relaxed) {
                    let (size, addr) = match socket.recv_from(&mut buf) {
                        Ok(r) => r,
                        Err(ref e)
                            if e.kind() == std::io::ErrorKind::WouldBlock
                                || e.kind() == std::io::ErrorKind::TimedOut =>
                        {
                            continue;
                        }
                        Err(e) => {
                            if thread_running.load(Ordering::Relaxed) {
                                tracing::warn!("audio socket error: {}", e);
                            }
                            thread::sleep(Duration::from_millis(10));
                            continue;
                        }
                    };

                    let Some(packet) = AudioPacket::parse(&buf[..size]) else {
                        let n = thread_malformed.fetch_add(1, Ordering::Relaxed) + 1;
                        if n % 50 == 1 {
                            tracing::warn!(from = %addr, count = n, "malformed audio packet");
                        }
                        continue;
                    };

                    // A misrouted copy of our own stream would otherwise
                    // play back as an echo.
                    if packet.sender_id == client_id {
                        thread_rejected.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }

                    thread_received.fetch_add(1, Ordering::Relaxed);
                    let count = {
                        let mut entry = thread_per_sender
                            .entry(packet.sender_id.clone())
                            .or_insert(0);
                        *entry += 1;
                        *entry
                    };
                    if count == 1 {
                        tracing::info!(sender = %packet.sender_id, "first packet from sender");
                    } else if count % 500 == 0 {
                        tracing::debug!(
                            sender = %packet.sender_id,
                            count,
                            bytes = packet.payload.len(),
                            "receiving"
                        );
                    }

                    let item = DecodeItem {
                        sender_id: packet.sender_id,
                        payload: packet.payload,
                        seq: packet.seq,
                    };
                    if enqueue_drop_oldest(&decode_tx, &decode_rx, item) {
                        thread_dropped.fetch_add(1, Ordering::Relaxed);
                    }
                }
            })
            .map_err(|e| NetworkError::ReceiveFailed(e.to_string()))?;

        Ok(Self {
            thread_handle: Some(handle),
            running,
            packets_received,
            malformed,
            self_rejected,
            queue_dropped,
            per_sender,
        })
    }

    /// Stop the loop and join it.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }

    pub fn stats(&self) -> ReceiverStats {
        ReceiverStats {
            packets_received: self.packets_received.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            self_rejected: self.self_rejected.load(Ordering::Relaxed),
            queue_dropped: self.queue_dropped.load(Ordering::Relaxed),
        }
    }

    /// Senders seen since start
    pub fn known_senders(&self) -> Vec<String> {
        self.per_sender.iter().map(|e| e.key().clone()).collect()
    }
}

impl Drop for AudioReceiver {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::DECODE_QUEUE_CAPACITY;
    use bytes::Bytes;
    use crossbeam_channel::bounded;
    use std::time::Instant;

    fn localhost_pair() -> (UdpSocket, UdpSocket, std::net::SocketAddr) {
        let rx = UdpSocket::bind("127.0.0.1:0").unwrap();
        let tx = UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = rx.local_addr().unwrap();
        (rx, tx, addr)
    }

    #[test]
    fn test_receiver_dispatches_and_rejects_self() {
        let (rx_socket, tx_socket, addr) = localhost_pair();
        let (decode_tx, decode_rx) = bounded::<DecodeItem>(DECODE_QUEUE_CAPACITY);

        let mut receiver = AudioReceiver::start(
            rx_socket,
            "me".to_string(),
            decode_tx,
            decode_rx.clone(),
        )
        .unwrap();

        let from_peer =
            AudioPacket::new("peer", 7, 320, true, Bytes::from_static(b"xx")).serialize();
        let from_self = AudioPacket::new("me", 1, 320, true, Bytes::from_static(b"yy")).serialize();
        tx_socket.send_to(&from_peer, addr).unwrap();
        tx_socket.send_to(&from_self, addr).unwrap();
        tx_socket.send_to(b"garbage with no delimiters", addr).unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        let item = loop {
            if let Ok(item) = decode_rx.try_recv() {
                break item;
            }
            assert!(Instant::now() < deadline, "nothing dispatched");
            thread::sleep(Duration::from_millis(10));
        };
        assert_eq!(item.sender_id, "peer");
        assert_eq!(item.seq, Some(7));

        // Give the other two datagrams time to be processed, then check
        // nothing else was enqueued.
        thread::sleep(Duration::from_millis(100));
        assert!(decode_rx.try_recv().is_err());

        let stats = receiver.stats();
        assert_eq!(stats.packets_received, 1);
        assert_eq!(stats.self_rejected, 1);
        assert_eq!(stats.malformed, 1);
        receiver.stop();
    }
}
