//! Hub discovery beacon
//!
//! Broadcasts `VOICE_SERVER` every couple of seconds and answers client
//! `VOICE_DISCOVER` probes with a direct reply, which reaches clients on
//! segments where broadcast is filtered.

use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::constants::{BROADCAST_INTERVAL, DISCOVERY_MAGIC, DISCOVERY_PORT, DISCOVER_REQUEST};
use crate::network::discovery::get_broadcast_addresses;

/// Periodic beacon + probe responder
pub struct DiscoveryBeacon {
    thread_handle: Option<JoinHandle<()>>,
    running: Arc<AtomicBool>,
}

impl DiscoveryBeacon {
    /// Spawn the beacon on an already-bound discovery socket.
    pub fn start(socket: UdpSocket) -> std::io::Result<Self> {
        socket.set_broadcast(true)?;
        socket.set_read_timeout(Some(Duration::from_millis(500)))?;

        let running = Arc::new(AtomicBool::new(true));
        let thread_running = running.clone();

        let handle = thread::Builder::new()
            .name("hub-discovery".to_string())
            .spawn(move || {
                let broadcasts = get_broadcast_addresses();
                let mut next_beacon = Instant::now();
                let mut buf = [0u8; 64];

                while thread_running.load(Ordering::Relaxed) {
                    if Instant::now() >= next_beacon {
                        for broadcast in &broadcasts {
                            let dest = SocketAddr::from((*broadcast, DISCOVERY_PORT));
                            let _ = socket.send_to(DISCOVERY_MAGIC, dest);
                        }
                        next_beacon = Instant::now() + BROADCAST_INTERVAL;
                    }

                    match socket.recv_from(&mut buf) {
                        Ok((size, addr)) => {
                            if &buf[..size] == DISCOVER_REQUEST {
                                tracing::debug!(from = %addr, "discovery probe");
                                let _ = socket.send_to(DISCOVERY_MAGIC, addr);
                            }
                        }
                        Err(ref e)
                            if e.kind() == std::io::ErrorKind::WouldBlock
                                || e.kind() == std::io::ErrorKind::TimedOut => {}
                        Err(_) => {
                            thread::sleep(Duration::from_millis(100));
                        }
                    }
                }
            })?;

        Ok(Self {
            thread_handle: Some(handle),
            running,
        })
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for DiscoveryBeacon {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Bind the discovery socket (reuse enabled so a client on the same host
/// can share the port).
pub fn bind_discovery_socket() -> std::io::Result<UdpSocket> {
    use socket2::{Domain, Protocol, Socket, Type};

    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    {
        let _ = socket.set_reuse_port(true);
    }
    let addr: SocketAddr = (Ipv4Addr::UNSPECIFIED, DISCOVERY_PORT).into();
    socket.bind(&addr.into())?;
    Ok(socket.into())
}
