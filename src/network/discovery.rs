//! Hub discovery over UDP broadcast
//!
//! The hub announces itself with a `VOICE_SERVER` beacon every couple of
//! seconds. Clients listen on the discovery port and, while waiting, send
//! `VOICE_DISCOVER` probes at broadcast and common gateway addresses to
//! elicit a direct reply across segments that filter broadcasts.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, Socket, Type};

use crate::constants::{DISCOVERY_MAGIC, DISCOVERY_PORT, DISCOVER_REQUEST};
use crate::error::NetworkError;

/// Local addresses of the default outbound interfaces.
///
/// Connecting a UDP socket never sends a packet but does resolve the route,
/// which yields the interface address the OS would use.
pub fn get_local_addresses() -> Vec<IpAddr> {
    let mut addresses = Vec::new();
    if let Ok(socket) = UdpSocket::bind("0.0.0.0:0") {
        for target in ["8.8.8.8:53", "1.1.1.1:53"] {
            if socket.connect(target).is_ok() {
                if let Ok(local) = socket.local_addr() {
                    let ip = local.ip();
                    if !ip.is_loopback() && !addresses.contains(&ip) {
                        addresses.push(ip);
                    }
                }
            }
        }
    }
    addresses
}

/// Broadcast addresses for all local /24 subnets, plus the global broadcast.
pub fn get_broadcast_addresses() -> Vec<Ipv4Addr> {
    let mut broadcasts = Vec::new();
    for addr in get_local_addresses() {
        if let IpAddr::V4(v4) = addr {
            let o = v4.octets();
            let broadcast = Ipv4Addr::new(o[0], o[1], o[2], 255);
            if !broadcasts.contains(&broadcast) {
                broadcasts.push(broadcast);
            }
        }
    }
    if !broadcasts.contains(&Ipv4Addr::BROADCAST) {
        broadcasts.push(Ipv4Addr::BROADCAST);
    }
    broadcasts
}

fn discovery_socket() -> Result<UdpSocket, NetworkError> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| NetworkError::BindFailed(e.to_string()))?;
    socket
        .set_reuse_address(true)
        .map_err(|e| NetworkError::BindFailed(e.to_string()))?;
    #[cfg(unix)]
    {
        // Multiple clients on one machine share the discovery port
        let _ = socket.set_reuse_port(true);
    }
    socket
        .set_broadcast(true)
        .map_err(|e| NetworkError::BindFailed(e.to_string()))?;

    let addr: SocketAddr = (Ipv4Addr::UNSPECIFIED, DISCOVERY_PORT).into();
    socket
        .bind(&addr.into())
        .map_err(|e| NetworkError::BindFailed(e.to_string()))?;

    let socket: UdpSocket = socket.into();
    socket
        .set_read_timeout(Some(Duration::from_millis(500)))
        .map_err(|e| NetworkError::BindFailed(e.to_string()))?;
    Ok(socket)
}

/// Wait for a hub beacon, probing actively between read timeouts.
pub fn discover_server(timeout: Duration) -> Result<IpAddr, NetworkError> {
    let socket = discovery_socket()?;
    let deadline = Instant::now() + timeout;
    let mut buf = [0u8; 64];

    tracing::info!(port = DISCOVERY_PORT, "discovering hub");

    while Instant::now() < deadline {
        match socket.recv_from(&mut buf) {
            Ok((size, addr)) => {
                if &buf[..size] == DISCOVERY_MAGIC {
                    tracing::info!(ip = %addr.ip(), "hub found");
                    return Ok(addr.ip());
                }
            }
            Err(ref e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                send_probes(&socket);
            }
            Err(e) => {
                return Err(NetworkError::ReceiveFailed(e.to_string()));
            }
        }
    }

    Err(NetworkError::ServerNotFound)
}

/// Fire probes at broadcast addresses and common gateways.
fn send_probes(socket: &UdpSocket) {
    for broadcast in get_broadcast_addresses() {
        let _ = socket.send_to(DISCOVER_REQUEST, (broadcast, DISCOVERY_PORT));
    }
    for gateway in ["192.168.1.255", "192.168.0.255", "10.0.0.255"] {
        if let Ok(ip) = gateway.parse::<Ipv4Addr>() {
            let _ = socket.send_to(DISCOVER_REQUEST, (ip, DISCOVERY_PORT));
        }
    }
}
