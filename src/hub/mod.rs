//! The hub process: control plane, UDP forwarder, discovery beacon, reaper

pub mod control;
pub mod discovery;
pub mod forwarder;
pub mod registry;

pub use control::ControlServer;
pub use discovery::DiscoveryBeacon;
pub use forwarder::{Forwarder, ForwarderStats};
pub use registry::{
    create_shared_registry, room_multicast_addr, ClientEntry, RegisterOutcome, Registry, Route,
    SenderRoute, SharedRegistry,
};

use std::net::{Ipv4Addr, TcpListener, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tokio::sync::broadcast;

use crate::config::HubConfig;
use crate::constants::{AUDIO_PORT, CONTROL_PORT};
use crate::error::HubError;

/// Registry lifecycle notifications
#[derive(Debug, Clone)]
pub enum HubEvent {
    Registered(String),
    Unregistered(String),
    Joined(String, String),
    Reaped(String),
}

/// The assembled hub
pub struct Hub {
    registry: SharedRegistry,
    control: ControlServer,
    forwarder: Forwarder,
    beacon: DiscoveryBeacon,
    reaper_handle: Option<JoinHandle<()>>,
    reaper_running: Arc<AtomicBool>,
    event_tx: broadcast::Sender<HubEvent>,
}

impl Hub {
    /// Bind every port and spawn all hub threads. Any bind failure aborts
    /// the whole start.
    pub fn start(config: HubConfig) -> crate::Result<Self> {
        let registry = create_shared_registry(config.secret.clone());
        let (event_tx, _) = broadcast::channel(64);

        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, CONTROL_PORT))
            .map_err(|e| HubError::ControlBind(e.to_string()))?;
        let audio_socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, AUDIO_PORT))
            .map_err(|e| HubError::ForwarderBind(e.to_string()))?;
        if config.multicast_rooms {
            crate::network::udp::enable_multicast_send(&audio_socket)?;
        }
        let discovery_socket = discovery::bind_discovery_socket()
            .map_err(|e| HubError::DiscoveryBind(e.to_string()))?;

        let control = ControlServer::start(listener, registry.clone(), event_tx.clone())
            .map_err(|e| HubError::ControlBind(e.to_string()))?;
        let forwarder = Forwarder::start(audio_socket, registry.clone(), config.clone())
            .map_err(|e| HubError::ForwarderBind(e.to_string()))?;
        let beacon = DiscoveryBeacon::start(discovery_socket)
            .map_err(|e| HubError::DiscoveryBind(e.to_string()))?;

        let reaper_running = Arc::new(AtomicBool::new(true));
        let reaper_handle = Self::spawn_reaper(
            registry.clone(),
            event_tx.clone(),
            Duration::from_secs(config.client_timeout_secs),
            reaper_running.clone(),
        )?;

        tracing::info!(
            control = CONTROL_PORT,
            audio = AUDIO_PORT,
            "hub running"
        );

        Ok(Self {
            registry,
            control,
            forwarder,
            beacon,
            reaper_handle: Some(reaper_handle),
            reaper_running,
            event_tx,
        })
    }

    fn spawn_reaper(
        registry: SharedRegistry,
        events: broadcast::Sender<HubEvent>,
        timeout: Duration,
        running: Arc<AtomicBool>,
    ) -> std::io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("hub-reaper".to_string())
            .spawn(move || {
                while running.load(Ordering::Relaxed) {
                    thread::sleep(Duration::from_secs(1));
                    let reaped = registry.lock().reap(timeout);
                    for id in reaped {
                        tracing::info!(client = %id, "client timed out");
                        let _ = events.send(HubEvent::Reaped(id));
                    }
                }
            })
    }

    /// Subscribe to registry lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<HubEvent> {
        self.event_tx.subscribe()
    }

    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    pub fn forwarder_stats(&self) -> ForwarderStats {
        self.forwarder.stats()
    }

    /// Stop every hub thread.
    pub fn stop(&mut self) {
        self.reaper_running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.reaper_handle.take() {
            let _ = handle.join();
        }
        self.beacon.stop();
        self.forwarder.stop();
        self.control.stop();
    }
}

impl Drop for Hub {
    fn drop(&mut self) {
        self.stop();
    }
}
