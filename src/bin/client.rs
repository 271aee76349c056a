//! Headless push-to-talk client.
//!
//! Discovers the hub (or takes `--server <ip>` / `VOICE_SERVER_IP` as an
//! override), registers, joins a room, and then drives the audio engine
//! from stdin:
//!
//! ```text
//! talk 2,3     direct audio at clients 2 and 3 and start capturing
//! stop         stop capturing and clear targets
//! hear 2,3     choose whose audio to render
//! gain 2 0.5   per-source playback gain
//! list         registered clients
//! stats        engine statistics
//! quit         unregister and exit
//! ```

use anyhow::{bail, Context, Result};
use std::io::BufRead;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use lan_voice_ptt::config::AppConfig;
use lan_voice_ptt::constants::HEARTBEAT_INTERVAL;
use lan_voice_ptt::engine::VoiceEngine;
use lan_voice_ptt::error::ControlError;
use lan_voice_ptt::network::{discover_server, ControlClient};

struct Args {
    id: Option<String>,
    server: Option<String>,
    room: String,
    secret: Option<String>,
}

fn parse_args() -> Result<Args> {
    let mut args = Args {
        id: None,
        server: std::env::var("VOICE_SERVER_IP").ok(),
        room: "main".to_string(),
        secret: None,
    };

    let mut iter = std::env::args().skip(1);
    while let Some(flag) = iter.next() {
        match flag.as_str() {
            "--id" => args.id = iter.next(),
            "--server" => args.server = iter.next(),
            "--room" => {
                if let Some(room) = iter.next() {
                    args.room = room;
                }
            }
            "--secret" => args.secret = iter.next(),
            other => bail!("unknown argument: {other}"),
        }
    }
    Ok(args)
}

fn csv_targets(csv: &str) -> Vec<String> {
    csv.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = parse_args()?;
    let mut config = AppConfig::load_or_default();
    if args.server.is_some() {
        config.network.server_ip = args.server.clone();
    }

    let hub_ip: IpAddr = match &config.network.server_ip {
        Some(ip) => ip.parse().context("invalid server ip")?,
        None => discover_server(Duration::from_secs(10))
            .context("no hub found; pass --server <ip>")?,
    };

    let client_id = args
        .id
        .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string()[..8].to_string());

    let mut engine = VoiceEngine::new(client_id.clone(), config)?;
    let control = ControlClient::new(hub_ip);

    match control.register(&client_id, engine.audio_port(), args.secret.as_deref()) {
        Ok(()) => {}
        Err(ControlError::IdentityTaken) => bail!("identity '{client_id}' is already in use"),
        Err(e) => return Err(e).context("registration failed"),
    }

    let group = control.join(&client_id, &args.room)?;
    tracing::info!(
        id = %client_id,
        room = %args.room,
        group = %group,
        "connected to hub at {hub_ip}"
    );

    // Heartbeat so the hub's reaper leaves us alone while idle.
    let heartbeat_running = Arc::new(AtomicBool::new(true));
    let heartbeat_handle = {
        let running = heartbeat_running.clone();
        let control = control.clone();
        let id = client_id.clone();
        thread::spawn(move || {
            while running.load(Ordering::Relaxed) {
                thread::sleep(HEARTBEAT_INTERVAL);
                if running.load(Ordering::Relaxed) {
                    if let Err(e) = control.ping(&id) {
                        tracing::warn!("heartbeat failed: {e}");
                    }
                }
            }
        })
    };

    println!(
        "commands: talk <ids> | stop | hear <ids> | gain <id> <g> | list | devices | stats | quit"
    );

    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = line?;
        let mut parts = line.trim().split_whitespace();
        match parts.next() {
            Some("talk") => {
                let targets = csv_targets(parts.next().unwrap_or(""));
                if targets.is_empty() {
                    println!("usage: talk <id,id,...>");
                    continue;
                }
                control.set_targets(&client_id, &targets)?;
                engine.start_capture(hub_ip)?;
                println!("talking to {}", targets.join(","));
            }
            Some("stop") => {
                engine.stop_capture();
                control.set_targets(&client_id, &[])?;
                println!("stopped");
            }
            Some("hear") => {
                let targets = csv_targets(parts.next().unwrap_or(""));
                engine.set_hear_targets(targets.clone());
                println!("hearing {}", targets.join(","));
            }
            Some("gain") => {
                let (Some(id), Some(gain)) = (parts.next(), parts.next()) else {
                    println!("usage: gain <id> <gain>");
                    continue;
                };
                match gain.parse::<f32>() {
                    Ok(gain) => engine.set_stream_gain(id, gain),
                    Err(_) => println!("bad gain: {gain}"),
                }
            }
            Some("list") => match control.list() {
                Ok(ids) => println!("registered: {}", ids.join(",")),
                Err(e) => println!("list failed: {e}"),
            },
            Some("devices") => match lan_voice_ptt::audio::list_devices() {
                Ok(devices) => {
                    for d in devices {
                        let kind = if d.is_input { "in " } else { "out" };
                        let marker = if d.is_default { "*" } else { " " };
                        println!("{kind} {marker} {}", d.name);
                    }
                }
                Err(e) => println!("device listing failed: {e}"),
            },
            Some("stats") => {
                println!("{:#?}", engine.stats());
            }
            Some("quit") | Some("exit") => break,
            Some(other) => println!("unknown command: {other}"),
            None => {}
        }
    }

    heartbeat_running.store(false, Ordering::SeqCst);
    engine.stop_capture();
    if let Err(e) = control.unregister(&client_id) {
        tracing::warn!("unregister failed: {e}");
    }
    engine.shutdown();
    let _ = heartbeat_handle.join();
    Ok(())
}
