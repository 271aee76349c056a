//! Network subsystem: UDP transport, hub discovery, and the control client

pub mod control;
pub mod discovery;
pub mod receiver;
pub mod sender;
pub mod udp;

pub use control::ControlClient;
pub use discovery::{discover_server, get_broadcast_addresses, get_local_addresses};
pub use receiver::{AudioReceiver, ReceiverStats};
pub use sender::{AudioSender, SenderStats};
pub use udp::{create_receive_socket, create_send_socket, create_socket, enable_multicast_send};
