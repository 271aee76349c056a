//! Error types for the voice conferencing application

use thiserror::Error;

/// Main error type for the application
#[derive(Error, Debug)]
pub enum Error {
    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Control error: {0}")]
    Control(#[from] ControlError),

    #[error("Hub error: {0}")]
    Hub(#[from] HubError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Audio subsystem errors
#[derive(Error, Debug)]
pub enum AudioError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Failed to open stream: {0}")]
    StreamError(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("cpal error: {0}")]
    CpalError(String),
}

/// Codec errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Encoder initialization failed: {0}")]
    EncoderInit(String),

    #[error("Decoder initialization failed: {0}")]
    DecoderInit(String),

    #[error("Encoding failed: {0}")]
    EncodingFailed(String),

    #[error("Decoding failed: {0}")]
    DecodingFailed(String),

    #[error("Invalid frame size: {0}")]
    InvalidFrameSize(usize),
}

/// Network errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Socket bind failed: {0}")]
    BindFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    #[error("Invalid packet format")]
    InvalidPacket,

    #[error("Server not found")]
    ServerNotFound,

    #[error("Timeout")]
    Timeout,
}

/// Control-plane errors (client side)
#[derive(Error, Debug)]
pub enum ControlError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Identity already taken")]
    IdentityTaken,

    #[error("Server rejected command: {0}")]
    Rejected(String),

    #[error("Malformed reply: {0}")]
    MalformedReply(String),

    #[error("Timeout")]
    Timeout,
}

/// Hub errors
#[derive(Error, Debug)]
pub enum HubError {
    #[error("Control bind failed: {0}")]
    ControlBind(String),

    #[error("Forwarder bind failed: {0}")]
    ForwarderBind(String),

    #[error("Discovery bind failed: {0}")]
    DiscoveryBind(String),

    #[error("Unknown client: {0}")]
    UnknownClient(String),
}

/// Result type alias for the application
pub type Result<T> = std::result::Result<T, Error>;
