//! Hub control plane
//!
//! A TCP acceptor on the control port. Each connection carries exactly one
//! newline-terminated command; the reply is written and the connection
//! dropped. Anything unparseable gets `ERR`.

use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tokio::sync::broadcast;

use crate::constants::CONTROL_TIMEOUT;
use crate::hub::registry::{RegisterOutcome, SharedRegistry};
use crate::hub::HubEvent;
use crate::protocol::{Command, Reply};

/// The control acceptor
pub struct ControlServer {
    thread_handle: Option<JoinHandle<()>>,
    running: Arc<AtomicBool>,
}

impl ControlServer {
    /// Spawn the acceptor on an already-bound listener.
    pub fn start(
        listener: TcpListener,
        registry: SharedRegistry,
        events: broadcast::Sender<HubEvent>,
    ) -> std::io::Result<Self> {
        listener.set_nonblocking(true)?;

        let running = Arc::new(AtomicBool::new(true));
        let thread_running = running.clone();

        let handle = thread::Builder::new()
            .name("hub-control".to_string())
            .spawn(move || {
                while thread_running.load(Ordering::Relaxed) {
                    match listener.accept() {
                        Ok((stream, addr)) => {
                            let registry = registry.clone();
                            let events = events.clone();
                            let _ = thread::Builder::new()
                                .name("hub-control-conn".to_string())
                                .spawn(move || {
                                    handle_connection(stream, addr, registry, events);
                                });
                        }
                        Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                            thread::sleep(Duration::from_millis(50));
                        }
                        Err(e) => {
                            tracing::warn!("control accept error: {}", e);
                            thread::sleep(Duration::from_millis(200));
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

impl Drop for ControlServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn handle_connection(
    stream: TcpStream,
    addr: std::net::SocketAddr,
    registry: SharedRegistry,
    events: broadcast::Sender<HubEvent>,
) {
    let _ = stream.set_read_timeout(Some(CONTROL_TIMEOUT));
    let _ = stream.set_write_timeout(Some(CONTROL_TIMEOUT));

    let mut writer = match stream.try_clone() {
        Ok(w) => w,
        Err(_) => return,
    };

    let mut line = String::new();
    let mut reader = BufReader::new(stream);
    if reader.read_line(&mut line).is_err() {
        let _ = writer.write_all(Reply::Err.encode().as_bytes());
        return;
    }

    let reply = match Command::parse(&line) {
        Some(command) => dispatch(command, addr.ip(), &registry, &events),
        None => {
            tracing::debug!(from = %addr, line = line.trim(), "unparseable command");
            Reply::Err
        }
    };

    let _ = writer.write_all(reply.encode().as_bytes());
}

/// Apply one command to the registry. Lock scope stays down at the map
/// mutation; replies are formatted outside.
fn dispatch(
    command: Command,
    peer_ip: std::net::IpAddr,
    registry: &SharedRegistry,
    events: &broadcast::Sender<HubEvent>,
) -> Reply {
    match command {
        Command::Register {
            id,
            audio_port,
            secret,
        } => {
            let outcome = registry
                .lock()
                .register(&id, peer_ip, audio_port, secret.as_deref());
            match outcome {
                RegisterOutcome::Registered => {
                    tracing::info!(client = %id, ip = %peer_ip, port = audio_port, "registered");
                    let _ = events.send(HubEvent::Registered(id));
                    Reply::Ok
                }
                RegisterOutcome::Taken => {
                    tracing::warn!(client = %id, "identity already in use");
                    Reply::Taken
                }
                RegisterOutcome::BadSecret => {
                    tracing::warn!(client = %id, ip = %peer_ip, "register with bad secret");
                    Reply::Err
                }
            }
        }
        Command::Join { id, room } => match registry.lock().join(&id, &room) {
            Some(group) => {
                tracing::info!(client = %id, room = %room, group = %group, "joined room");
                let _ = events.send(HubEvent::Joined(id, room));
                Reply::OkPayload(group.to_string())
            }
            None => Reply::Err,
        },
        Command::Targets { id, targets } => {
            if registry.lock().set_targets(&id, &targets) {
                tracing::debug!(client = %id, ?targets, "targets updated");
                Reply::Ok
            } else {
                Reply::Err
            }
        }
        Command::Ping { id } => {
            if registry.lock().ping(&id) {
                Reply::Ok
            } else {
                Reply::Err
            }
        }
        Command::Unregister { id } => {
            registry.lock().unregister(&id);
            tracing::info!(client = %id, "unregistered");
            let _ = events.send(HubEvent::Unregistered(id));
            Reply::Ok
        }
        Command::List => Reply::OkPayload(registry.lock().list().join(",")),
    }
}
