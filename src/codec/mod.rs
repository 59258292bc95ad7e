//! Opus codec wrapper
//!
//! The receiver decodes through [`FrameCodec`]; the encoder exists for the
//! transmitter tool and for tests.

pub mod decoder;
pub mod encoder;

pub use decoder::{Codec, FrameCodec, FrameDecoder, OpusCodec, OpusDecoder};
pub use encoder::{EncoderSettings, OpusEncoder};
