//! Opus codec wrappers fixed to the 16 kHz / mono / 20 ms frame contract

pub mod decoder;
pub mod encoder;

pub use decoder::OpusDecoder;
pub use encoder::OpusEncoder;
