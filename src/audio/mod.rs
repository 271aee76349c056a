//! Audio subsystem: frames, buffering, device I/O, capture pre-processing

pub mod buffer;
pub mod capture;
pub mod device;
pub mod frame;
pub mod playback;
pub mod preprocess;

pub use buffer::{create_shared_queue, FrameQueue, JitterBuffer, JitterPop, SharedFrameQueue};
pub use capture::CaptureSource;
pub use device::{find_input_device, find_output_device, list_devices, AudioDeviceInfo};
pub use frame::Frame;
pub use playback::{PlaybackSink, PlaybackStats};
pub use preprocess::{Preprocessor, PreprocessorOptions};
