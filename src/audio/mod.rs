//! Audio subsystem module

pub mod buffer;
pub mod device;
pub mod output;
pub mod playback;

pub use buffer::{frame_queue, EncodedFrame, FrameReceiver, FrameSender, PlaybackBuffer, Pop};
pub use device::{find_output_device, list_output_devices, OutputDeviceInfo};
pub use output::{AudioOutput, CpalOutput};
pub use playback::{
    PlaybackEngine, PlaybackOptions, PlaybackSnapshot, PlaybackStats,
};
