//! # LAN Audio Receiver
//!
//! Firmware core of a network-attached audio receiver: it joins a network,
//! answers discovery broadcasts, accepts one transmitter at a time and plays
//! the Opus stream it receives.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                              RECEIVER                                │
//! │                                                                      │
//! │  ┌──────────────────────────┐      connected?                        │
//! │  │  Connectivity Manager    │─────────────┬──────────────────┐       │
//! │  │  (network::connectivity) │             │                  │       │
//! │  └────────────┬─────────────┘             ▼                  ▼       │
//! │               │ link layer   ┌──────────────────┐  ┌──────────────┐  │
//! │               ▼              │ Audio Session    │  │  Discovery   │  │
//! │        ┌────────────┐        │ Server (TCP)     │  │  Responder   │  │
//! │        │ LinkLayer  │        │ network::session │  │  (UDP)       │  │
//! │        └────────────┘        └────────┬─────────┘  └──────────────┘  │
//! │                                       │ EncodedFrame (move)          │
//! │                                       ▼                              │
//! │                         ┌───────────────────────────┐                │
//! │                         │ Bounded Frame Queue (40)  │                │
//! │                         └─────────────┬─────────────┘                │
//! │                                       ▼                              │
//! │                         ┌───────────────────────────┐                │
//! │                         │ Playback Engine           │                │
//! │                         │  FrameCodec ─► PCM buffer │                │
//! │                         └─────────────┬─────────────┘                │
//! │                                       ▼                              │
//! │                               ┌──────────────┐                       │
//! │                               │ AudioOutput  │                       │
//! │                               └──────────────┘                       │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```

pub mod audio;
pub mod codec;
pub mod config;
pub mod error;
pub mod fault;
pub mod network;
pub mod protocol;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// Sample rate all frames are decoded at
    pub const DECODE_SAMPLE_RATE: u32 = 48000;

    /// Decoded channel count (stereo)
    pub const DECODE_CHANNELS: u16 = 2;

    /// Bytes per decoded sample (signed 16 bit)
    pub const SAMPLE_WIDTH_BYTES: usize = 2;

    /// Longest Opus frame duration in milliseconds
    pub const MAX_FRAME_DURATION_MS: usize = 120;

    /// Largest compressed frame accepted from a transmitter
    pub const MAX_ENCODED_FRAME_SIZE: usize = 4000;

    /// Size of the PCM scratch buffer in bytes
    pub const MAX_DECODED_FRAME_SIZE: usize = MAX_FRAME_DURATION_MS
        * DECODE_SAMPLE_RATE as usize
        / 1000
        * DECODE_CHANNELS as usize
        * SAMPLE_WIDTH_BYTES;

    /// Encoded frames buffered between session and playback
    pub const FRAME_QUEUE_CAPACITY: usize = 40;

    /// UDP port for discovery broadcasts
    pub const DISCOVERY_PORT: u16 = 58765;

    /// TCP port for audio sessions
    pub const AUDIO_PORT: u16 = 58764;

    /// Name announced in discovery responses
    pub const DEVICE_NAME: &str = "Audio-Network Receiver";

    /// Immediate reassociation attempts before a cooldown
    pub const MAX_CONNECT_RETRY_ATTEMPTS: u32 = 10;

    /// Pause after exhausting immediate reassociation attempts
    pub const RECONNECT_COOLDOWN_MS: u64 = 1000;

    /// Scan results considered when choosing an access point
    pub const MAX_SCAN_RESULTS: usize = 10;

    /// Audio buffered by the output device per service period
    pub const DEFAULT_OUTPUT_BUFFER_MS: u64 = 20;

    /// Receive buffer for discovery datagrams
    pub const DISCOVERY_BUFFER_SIZE: usize = 512;
}
