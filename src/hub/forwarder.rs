//! Sender-identified UDP fan-out
//!
//! One socket on the audio port. Each inbound datagram is routed by its
//! first delimited field: to the sender's explicit target set when one is
//! set, otherwise to the sender's room. Packets are forwarded verbatim,
//! so sender identity and sequencing survive end-to-end. An IP mismatch
//! against the registered endpoint is counted but tolerated (clients roam).

use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::config::HubConfig;
use crate::constants::MAX_PACKET_SIZE;
use crate::hub::registry::{Route, SharedRegistry};
use crate::protocol::AudioPacket;

/// Forwarder statistics snapshot
#[derive(Debug, Clone, Copy, Default)]
pub struct ForwarderStats {
    pub packets_in: u64,
    pub packets_out: u64,
    pub malformed: u64,
    pub unregistered: u64,
    pub ip_mismatch: u64,
    pub silence_dropped: u64,
}

/// The UDP forwarding loop
pub struct Forwarder {
    thread_handle: Option<JoinHandle<()>>,
    running: Arc<AtomicBool>,
    packets_in: Arc<AtomicU64>,
    packets_out: Arc<AtomicU64>,
    malformed: Arc<AtomicU64>,
    unregistered: Arc<AtomicU64>,
    ip_mismatch: Arc<AtomicU64>,
    silence_dropped: Arc<AtomicU64>,
}

impl Forwarder {
    /// Spawn the forwarding loop on an already-bound audio socket.
    pub fn start(
        socket: UdpSocket,
        registry: SharedRegistry,
        config: HubConfig,
    ) -> std::io::Result<Self> {
        socket.set_read_timeout(Some(Duration::from_millis(500)))?;

        let running = Arc::new(AtomicBool::new(true));
        let packets_in = Arc::new(AtomicU64::new(0));
        let packets_out = Arc::new(AtomicU64::new(0));
        let malformed = Arc::new(AtomicU64::new(0));
        let unregistered = Arc::new(AtomicU64::new(0));
        let ip_mismatch = Arc::new(AtomicU64::new(0));
        let silence_dropped = Arc::new(AtomicU64::new(0));

        let counters = (
            running.clone(),
            packets_in.clone(),
            packets_out.clone(),
            malformed.clone(),
            unregistered.clone(),
            ip_mismatch.clone(),
            silence_dropped.clone(),
        );

        let handle = thread::Builder::new()
            .name("hub-forwarder".to_string())
            .spawn(move || {
                let (running, packets_in, packets_out, malformed, unregistered, ip_mismatch, silence_dropped) =
                    counters;
                let mut buf = [0u8; MAX_PACKET_SIZE];

                while running.load(Ordering::Relaxed) {
                    let (size, src) = match socket.recv_from(&mut buf) {
                        Ok(r) => r,
                        Err(ref e)
                            if e.kind() == std::io::ErrorKind::WouldBlock
                                || e.kind() == std::io::ErrorKind::TimedOut =>
                        {
                            continue;
                        }
                        // Windows surfaces ICMP port-unreachable as a recv
                        // error on UDP sockets; keep going.
                        Err(ref e) if e.kind() == std::io::ErrorKind::ConnectionReset => continue,
                        Err(e) => {
                            if running.load(Ordering::Relaxed) {
                                tracing::warn!("forwarder socket error: {}", e);
                            }
                            thread::sleep(Duration::from_millis(10));
                            continue;
                        }
                    };

                    let packet = &buf[..size];
                    packets_in.fetch_add(1, Ordering::Relaxed);

                    let Some(sender_id) = AudioPacket::sender_id_of(packet) else {
                        let n = malformed.fetch_add(1, Ordering::Relaxed) + 1;
                        if n % 50 == 1 {
                            tracing::warn!(from = %src, count = n, "malformed packet");
                        }
                        continue;
                    };

                    if !config.forward_silence && !AudioPacket::vad_of(packet) {
                        silence_dropped.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }

                    let Some(route) = registry.lock().route_for(sender_id) else {
                        let n = unregistered.fetch_add(1, Ordering::Relaxed) + 1;
                        if n % 500 == 1 {
                            tracing::warn!(sender = %sender_id, count = n, "audio from unregistered sender");
                        }
                        continue;
                    };

                    if src.ip() != route.expected_ip {
                        let n = ip_mismatch.fetch_add(1, Ordering::Relaxed) + 1;
                        if n % 100 == 1 {
                            tracing::warn!(
                                sender = %sender_id,
                                expected = %route.expected_ip,
                                got = %src.ip(),
                                "source IP mismatch, forwarding anyway"
                            );
                        }
                    }

                    match route.route {
                        Route::Targets(destinations) => {
                            for dest in destinations {
                                match socket.send_to(packet, dest) {
                                    Ok(_) => {
                                        packets_out.fetch_add(1, Ordering::Relaxed);
                                    }
                                    Err(e) => {
                                        tracing::debug!(to = %dest, "forward failed: {}", e);
                                    }
                                }
                            }
                        }
                        Route::Room { members, group } => {
                            if config.multicast_rooms {
                                match socket.send_to(packet, group) {
                                    Ok(_) => {
                                        packets_out.fetch_add(1, Ordering::Relaxed);
                                    }
                                    Err(e) => {
                                        tracing::debug!(to = %group, "multicast failed: {}", e);
                                    }
                                }
                            } else {
                                for dest in members {
                                    match socket.send_to(packet, dest) {
                                        Ok(_) => {
                                            packets_out.fetch_add(1, Ordering::Relaxed);
                                        }
                                        Err(e) => {
                                            tracing::debug!(to = %dest, "forward failed: {}", e);
                                        }
                                    }
                                }
                            }
                        }
                        Route::Nowhere => {}
                    }
                }
            })?;

        Ok(Self {
            thread_handle: Some(handle),
            running,
            packets_in,
            packets_out,
            malformed,
            unregistered,
            ip_mismatch,
            silence_dropped,
        })
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }

    pub fn stats(&self) -> ForwarderStats {
        ForwarderStats {
            packets_in: self.packets_in.load(Ordering::Relaxed),
            packets_out: self.packets_out.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            unregistered: self.unregistered.load(Ordering::Relaxed),
            ip_mismatch: self.ip_mismatch.load(Ordering::Relaxed),
            silence_dropped: self.silence_dropped.load(Ordering::Relaxed),
        }
    }
}

impl Drop for Forwarder {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::registry::create_shared_registry;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Instant;

    struct Peer {
        socket: UdpSocket,
        port: u16,
    }

    fn peer() -> Peer {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let port = socket.local_addr().unwrap().port();
        Peer { socket, port }
    }

    fn recv(peer: &Peer) -> Vec<u8> {
        let mut buf = [0u8; MAX_PACKET_SIZE];
        let (size, _) = peer.socket.recv_from(&mut buf).unwrap();
        buf[..size].to_vec()
    }

    #[test]
    fn test_fan_out_to_targets_verbatim() {
        let hub_socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let hub_addr = hub_socket.local_addr().unwrap();

        let a = peer();
        let b = peer();
        let c = peer();
        let localhost = IpAddr::V4(Ipv4Addr::LOCALHOST);

        let registry = create_shared_registry(None);
        {
            let mut reg = registry.lock();
            reg.register("A", localhost, a.port, None);
            reg.register("B", localhost, b.port, None);
            reg.register("C", localhost, c.port, None);
            for id in ["A", "B", "C"] {
                reg.join(id, "main");
            }
            reg.set_targets("A", &["B".into(), "C".into()]);
        }

        let mut forwarder =
            Forwarder::start(hub_socket, registry, HubConfig::default()).unwrap();

        let wire = b"A|5|1600|1|\x01\x02\x03".to_vec();
        a.socket.send_to(&wire, hub_addr).unwrap();

        // Byte-identical delivery to both targets, none back to the sender.
        assert_eq!(recv(&b), wire);
        assert_eq!(recv(&c), wire);
        let mut buf = [0u8; 64];
        a.socket
            .set_read_timeout(Some(Duration::from_millis(200)))
            .unwrap();
        assert!(a.socket.recv_from(&mut buf).is_err());

        forwarder.stop();
    }

    #[test]
    fn test_empty_targets_unicasts_to_room() {
        let hub_socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let hub_addr = hub_socket.local_addr().unwrap();

        let a = peer();
        let b = peer();
        let localhost = IpAddr::V4(Ipv4Addr::LOCALHOST);

        let registry = create_shared_registry(None);
        {
            let mut reg = registry.lock();
            reg.register("A", localhost, a.port, None);
            reg.register("B", localhost, b.port, None);
            reg.join("A", "main");
            reg.join("B", "main");
        }

        let mut forwarder =
            Forwarder::start(hub_socket, registry, HubConfig::default()).unwrap();

        let wire = b"A|0|0|1|pp".to_vec();
        a.socket.send_to(&wire, hub_addr).unwrap();
        assert_eq!(recv(&b), wire);

        forwarder.stop();
    }

    #[test]
    fn test_unregistered_and_malformed_dropped() {
        let hub_socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let hub_addr = hub_socket.local_addr().unwrap();
        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();

        let registry = create_shared_registry(None);
        let mut forwarder =
            Forwarder::start(hub_socket, registry, HubConfig::default()).unwrap();

        sender.send_to(b"ghost|0|0|1|xx", hub_addr).unwrap();
        sender.send_to(b"no delimiters here", hub_addr).unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            let stats = forwarder.stats();
            if stats.unregistered == 1 && stats.malformed == 1 {
                break;
            }
            assert!(Instant::now() < deadline, "stats never converged: {stats:?}");
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(forwarder.stats().packets_out, 0);
        forwarder.stop();
    }

    #[test]
    fn test_silence_dropped_when_configured() {
        let hub_socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let hub_addr = hub_socket.local_addr().unwrap();

        let a = peer();
        let b = peer();
        let localhost = IpAddr::V4(Ipv4Addr::LOCALHOST);

        let registry = create_shared_registry(None);
        {
            let mut reg = registry.lock();
            reg.register("A", localhost, a.port, None);
            reg.register("B", localhost, b.port, None);
            reg.set_targets("A", &["B".into()]);
        }

        let config = HubConfig {
            forward_silence: false,
            ..Default::default()
        };
        let mut forwarder = Forwarder::start(hub_socket, registry, config).unwrap();

        a.socket.send_to(b"A|0|0|0|silent", hub_addr).unwrap();
        a.socket.send_to(b"A|1|320|1|voiced", hub_addr).unwrap();

        // Only the voiced packet makes it through.
        assert_eq!(recv(&b), b"A|1|320|1|voiced".to_vec());
        assert_eq!(forwarder.stats().silence_dropped, 1);
        forwarder.stop();
    }

    #[test]
    fn test_ip_mismatch_still_forwarded() {
        let hub_socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let hub_addr = hub_socket.local_addr().unwrap();

        let a = peer();
        let b = peer();

        let registry = create_shared_registry(None);
        {
            let mut reg = registry.lock();
            // Register A under an address it will not actually send from.
            reg.register("A", IpAddr::V4(Ipv4Addr::new(10, 9, 9, 9)), a.port, None);
            reg.register("B", IpAddr::V4(Ipv4Addr::LOCALHOST), b.port, None);
            reg.set_targets("A", &["B".into()]);
        }

        let mut forwarder =
            Forwarder::start(hub_socket, registry, HubConfig::default()).unwrap();

        let wire = b"A|0|0|1|roam".to_vec();
        a.socket.send_to(&wire, hub_addr).unwrap();
        assert_eq!(recv(&b), wire);
        assert_eq!(forwarder.stats().ip_mismatch, 1);
        forwarder.stop();
    }
}
