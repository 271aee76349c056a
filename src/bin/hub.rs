//! The hub process: UDP audio forwarder + control-plane registry.
//!
//! Runs with no arguments and exits non-zero if any of its ports cannot be
//! bound. `RUST_LOG` tunes verbosity.

use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use lan_voice_ptt::config::AppConfig;
use lan_voice_ptt::hub::{Hub, HubEvent};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = AppConfig::load_or_default();
    let mut hub = Hub::start(config.hub).context("failed to start hub")?;

    // Surface registry lifecycle events in the log.
    let mut events = hub.subscribe();
    thread::spawn(move || {
        while let Ok(event) = events.blocking_recv() {
            match event {
                HubEvent::Registered(id) => tracing::info!(client = %id, "event: registered"),
                HubEvent::Unregistered(id) => tracing::info!(client = %id, "event: unregistered"),
                HubEvent::Joined(id, room) => {
                    tracing::info!(client = %id, room = %room, "event: joined")
                }
                HubEvent::Reaped(id) => tracing::info!(client = %id, "event: reaped"),
            }
        }
    });

    let running = Arc::new(AtomicBool::new(true));
    let ctrlc_running = running.clone();
    ctrlc::set_handler(move || {
        ctrlc_running.store(false, Ordering::SeqCst);
    })
    .context("failed to install signal handler")?;

    let mut last_stats = std::time::Instant::now();
    while running.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(200));
        if last_stats.elapsed() >= Duration::from_secs(30) {
            let stats = hub.forwarder_stats();
            tracing::info!(
                clients = hub.registry().lock().len(),
                packets_in = stats.packets_in,
                packets_out = stats.packets_out,
                "forwarder stats"
            );
            last_stats = std::time::Instant::now();
        }
    }

    tracing::info!("shutting down");
    hub.stop();
    Ok(())
}
