//! Control-plane client
//!
//! Every operation is one short-lived TCP connection: write a single
//! newline-terminated command, read a single newline-terminated reply,
//! close. Connect, read, and write are all bounded by the control timeout.

use std::io::{BufRead, BufReader, Write};
use std::net::{IpAddr, SocketAddr, TcpStream};

use crate::constants::{CONTROL_PORT, CONTROL_TIMEOUT};
use crate::error::ControlError;
use crate::protocol::{Command, Reply};

/// Client side of the hub control plane
#[derive(Debug, Clone)]
pub struct ControlClient {
    server: SocketAddr,
}

impl ControlClient {
    pub fn new(server_ip: IpAddr) -> Self {
        Self {
            server: SocketAddr::new(server_ip, CONTROL_PORT),
        }
    }

    pub fn server(&self) -> SocketAddr {
        self.server
    }

    fn roundtrip(&self, command: &Command) -> Result<Reply, ControlError> {
        let stream = TcpStream::connect_timeout(&self.server, CONTROL_TIMEOUT)
            .map_err(|e| ControlError::ConnectionFailed(e.to_string()))?;
        stream
            .set_read_timeout(Some(CONTROL_TIMEOUT))
            .map_err(|e| ControlError::ConnectionFailed(e.to_string()))?;
        stream
            .set_write_timeout(Some(CONTROL_TIMEOUT))
            .map_err(|e| ControlError::ConnectionFailed(e.to_string()))?;

        let mut writer = stream
            .try_clone()
            .map_err(|e| ControlError::ConnectionFailed(e.to_string()))?;
        writer
            .write_all(command.encode().as_bytes())
            .map_err(|e| ControlError::ConnectionFailed(e.to_string()))?;

        let mut line = String::new();
        let mut reader = BufReader::new(stream);
        match reader.read_line(&mut line) {
            Ok(0) => Err(ControlError::MalformedReply("connection closed".into())),
            Ok(_) => Ok(Reply::parse(&line)),
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                Err(ControlError::Timeout)
            }
            Err(e) => Err(ControlError::ConnectionFailed(e.to_string())),
        }
    }

    /// Claim an identity and announce the audio receive port.
    pub fn register(
        &self,
        id: &str,
        audio_port: u16,
        secret: Option<&str>,
    ) -> Result<(), ControlError> {
        let command = Command::Register {
            id: id.to_string(),
            audio_port,
            secret: secret.map(str::to_string),
        };
        match self.roundtrip(&command)? {
            Reply::Ok | Reply::OkPayload(_) => Ok(()),
            Reply::Taken => Err(ControlError::IdentityTaken),
            Reply::Err => Err(ControlError::Rejected("REGISTER".into())),
        }
    }

    /// Join a room. Returns the room's derived multicast address.
    pub fn join(&self, id: &str, room: &str) -> Result<String, ControlError> {
        let command = Command::Join {
            id: id.to_string(),
            room: room.to_string(),
        };
        match self.roundtrip(&command)? {
            Reply::OkPayload(addr) => Ok(addr),
            Reply::Ok => Ok(String::new()),
            _ => Err(ControlError::Rejected("JOIN".into())),
        }
    }

    /// Replace this sender's forwarding target set.
    pub fn set_targets(&self, id: &str, targets: &[String]) -> Result<(), ControlError> {
        let command = Command::Targets {
            id: id.to_string(),
            targets: targets.to_vec(),
        };
        match self.roundtrip(&command)? {
            Reply::Ok | Reply::OkPayload(_) => Ok(()),
            _ => Err(ControlError::Rejected("TARGETS".into())),
        }
    }

    /// Refresh the hub-side heartbeat.
    pub fn ping(&self, id: &str) -> Result<(), ControlError> {
        match self.roundtrip(&Command::Ping { id: id.to_string() })? {
            Reply::Ok | Reply::OkPayload(_) => Ok(()),
            _ => Err(ControlError::Rejected("PING".into())),
        }
    }

    /// Release the identity.
    pub fn unregister(&self, id: &str) -> Result<(), ControlError> {
        match self.roundtrip(&Command::Unregister { id: id.to_string() })? {
            Reply::Ok | Reply::OkPayload(_) => Ok(()),
            _ => Err(ControlError::Rejected("UNREGISTER".into())),
        }
    }

    /// Sorted identities currently registered.
    pub fn list(&self) -> Result<Vec<String>, ControlError> {
        match self.roundtrip(&Command::List)? {
            Reply::OkPayload(csv) => Ok(csv
                .split(',')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()),
            Reply::Ok => Ok(Vec::new()),
            _ => Err(ControlError::Rejected("LIST".into())),
        }
    }
}
