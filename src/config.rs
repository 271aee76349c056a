//! Configuration management

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::constants::*;

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    /// Network configuration
    pub network: NetworkConfig,

    /// Audio configuration
    pub audio: AudioConfig,

    /// Hub configuration
    pub hub: HubConfig,
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Local bind address
    pub bind_address: String,

    /// Hub address override; None means discover via broadcast
    pub server_ip: Option<String>,

    /// Socket send buffer size
    pub send_buffer_size: usize,

    /// Socket receive buffer size
    pub recv_buffer_size: usize,

    /// Enable SO_REUSEADDR
    pub reuse_addr: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            server_ip: None,
            send_buffer_size: UDP_SEND_BUFFER_SIZE,
            recv_buffer_size: UDP_RECV_BUFFER_SIZE,
            reuse_addr: true,
        }
    }
}

/// Audio configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    /// Opus bitrate in bits per second
    pub bitrate: u32,

    /// Input device name; None picks the host default
    pub input_device: Option<String>,

    /// Output device name; None picks the host default
    pub output_device: Option<String>,

    /// Duck the mic when the speaker output is loud
    pub echo_suppression: bool,

    /// Extra low-pass smoothing on capture
    pub smoothing: bool,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            bitrate: DEFAULT_BITRATE,
            input_device: None,
            output_device: None,
            echo_suppression: true,
            smoothing: false,
        }
    }
}

/// Hub configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    /// Heartbeat age before a client is reaped, in seconds
    pub client_timeout_secs: u64,

    /// Deliver room audio to the derived multicast group instead of
    /// unicasting to each member
    pub multicast_rooms: bool,

    /// Forward frames flagged vad=0 (keeps receiver sequences contiguous)
    pub forward_silence: bool,

    /// When set, REGISTER must carry this secret
    pub secret: Option<String>,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            client_timeout_secs: CLIENT_TIMEOUT_SECS,
            multicast_rooms: false,
            forward_silence: true,
            secret: None,
        }
    }
}

impl AppConfig {
    /// Load configuration from file
    pub fn load(path: &PathBuf) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self =
            toml::from_str(&content).map_err(|e| crate::Error::Config(e.to_string()))?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: &PathBuf) -> crate::Result<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| crate::Error::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Default config file path
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "lan-voice", "ptt")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Load the default config file, or defaults when it does not exist.
    pub fn load_or_default() -> Self {
        Self::default_path()
            .filter(|p| p.exists())
            .and_then(|p| Self::load(&p).ok())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_toml_roundtrip() {
        let config = AppConfig {
            hub: HubConfig {
                multicast_rooms: true,
                secret: Some("s3cret".into()),
                ..Default::default()
            },
            ..Default::default()
        };
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: AppConfig = toml::from_str(&text).unwrap();
        assert!(parsed.hub.multicast_rooms);
        assert_eq!(parsed.hub.secret.as_deref(), Some("s3cret"));
        assert_eq!(parsed.audio.bitrate, DEFAULT_BITRATE);
    }
}
