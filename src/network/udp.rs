//! Low-level UDP socket construction
//!
//! All audio sockets are built through socket2 so buffer sizes, address
//! reuse, broadcast, and multicast TTL are set before binding.

use socket2::{Domain, Protocol, Socket, Type};
use std::net::{SocketAddr, UdpSocket};

use crate::config::NetworkConfig;
use crate::constants::MULTICAST_TTL;
use crate::error::NetworkError;

/// Create a configured UDP socket bound to `addr`.
pub fn create_socket(addr: SocketAddr, config: &NetworkConfig) -> Result<UdpSocket, NetworkError> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| NetworkError::BindFailed(e.to_string()))?;

    if config.reuse_addr {
        socket
            .set_reuse_address(true)
            .map_err(|e| NetworkError::BindFailed(format!("failed to set SO_REUSEADDR: {}", e)))?;
    }

    // Generous buffers ride out burst traffic without drops.
    socket
        .set_send_buffer_size(config.send_buffer_size)
        .map_err(|e| NetworkError::BindFailed(format!("failed to set send buffer: {}", e)))?;
    socket
        .set_recv_buffer_size(config.recv_buffer_size)
        .map_err(|e| NetworkError::BindFailed(format!("failed to set recv buffer: {}", e)))?;

    socket
        .set_broadcast(true)
        .map_err(|e| NetworkError::BindFailed(format!("failed to set broadcast: {}", e)))?;

    socket
        .bind(&addr.into())
        .map_err(|e| NetworkError::BindFailed(format!("{addr}: {e}")))?;

    Ok(socket.into())
}

/// Audio receive socket on an ephemeral port (the port is announced to the
/// hub at registration).
pub fn create_receive_socket(config: &NetworkConfig) -> Result<UdpSocket, NetworkError> {
    let addr: SocketAddr = format!("{}:0", config.bind_address)
        .parse()
        .map_err(|e: std::net::AddrParseError| NetworkError::BindFailed(e.to_string()))?;
    create_socket(addr, config)
}

/// Send-only socket on an ephemeral port.
pub fn create_send_socket(config: &NetworkConfig) -> Result<UdpSocket, NetworkError> {
    let addr: SocketAddr = format!("{}:0", config.bind_address)
        .parse()
        .map_err(|e: std::net::AddrParseError| NetworkError::BindFailed(e.to_string()))?;
    create_socket(addr, config)
}

/// Configure a socket for sending to administratively-scoped multicast
/// groups (TTL 1 keeps the traffic on the local segment).
pub fn enable_multicast_send(socket: &UdpSocket) -> Result<(), NetworkError> {
    socket
        .set_multicast_ttl_v4(MULTICAST_TTL)
        .map_err(|e| NetworkError::SendFailed(format!("failed to set multicast TTL: {}", e)))
}
