//! Opus encoder wrapper
//!
//! Used by the transmitter tool to produce frames a receiver accepts.

use bytes::Bytes;
use opus::{Application, Channels, Encoder};

use crate::error::CodecError;

/// Largest packet libopus produces for a single frame
const MAX_PACKET_SIZE: usize = 1275;

/// Encoder settings
#[derive(Debug, Clone, PartialEq)]
pub struct EncoderSettings {
    pub sample_rate: u32,
    pub channels: u16,
    /// Samples per channel per frame
    pub frame_size: usize,
    pub bitrate: u32,
    pub application: Application,
}

impl EncoderSettings {
    pub fn frame_size_from_ms(sample_rate: u32, frame_ms: f32) -> usize {
        (sample_rate as f32 * frame_ms / 1000.0) as usize
    }

    pub fn frame_duration_ms(&self) -> f32 {
        self.frame_size as f32 * 1000.0 / self.sample_rate as f32
    }
}

/// Opus encoder wrapper
pub struct OpusEncoder {
    encoder: Encoder,
    settings: EncoderSettings,
    /// Encoding buffer (reused to avoid allocations)
    encode_buffer: Vec<u8>,
    frames_encoded: u64,
    bytes_produced: u64,
}

impl OpusEncoder {
    pub fn new(settings: EncoderSettings) -> Result<Self, CodecError> {
        let channels = match settings.channels {
            1 => Channels::Mono,
            2 => Channels::Stereo,
            _ => {
                return Err(CodecError::EncoderInit(format!(
                    "Unsupported channel count: {}",
                    settings.channels
                )))
            }
        };

        let mut encoder = Encoder::new(settings.sample_rate, channels, settings.application)
            .map_err(|e| CodecError::EncoderInit(e.to_string()))?;

        encoder
            .set_bitrate(opus::Bitrate::Bits(settings.bitrate as i32))
            .map_err(|e| CodecError::EncoderInit(format!("Failed to set bitrate: {}", e)))?;

        Ok(Self {
            encoder,
            settings,
            encode_buffer: vec![0u8; MAX_PACKET_SIZE],
            frames_encoded: 0,
            bytes_produced: 0,
        })
    }

    /// 20 ms frames at 128 kbit/s
    pub fn music(sample_rate: u32, channels: u16) -> Result<Self, CodecError> {
        Self::new(EncoderSettings {
            sample_rate,
            channels,
            frame_size: EncoderSettings::frame_size_from_ms(sample_rate, 20.0),
            bitrate: 128_000,
            application: Application::Audio,
        })
    }

    /// Encodes interleaved 16 bit samples; the length must be one full frame.
    pub fn encode(&mut self, samples: &[i16]) -> Result<Bytes, CodecError> {
        if samples.len() != self.samples_per_frame() {
            return Err(CodecError::InvalidFrameSize(samples.len()));
        }

        let size = self
            .encoder
            .encode(samples, &mut self.encode_buffer)
            .map_err(|e| CodecError::EncodingFailed(e.to_string()))?;

        self.frames_encoded += 1;
        self.bytes_produced += size as u64;

        Ok(Bytes::copy_from_slice(&self.encode_buffer[..size]))
    }

    pub fn settings(&self) -> &EncoderSettings {
        &self.settings
    }

    /// Samples per channel per frame
    pub fn frame_size(&self) -> usize {
        self.settings.frame_size
    }

    /// Interleaved samples per frame
    pub fn samples_per_frame(&self) -> usize {
        self.settings.frame_size * self.settings.channels as usize
    }

    pub fn frame_duration_ms(&self) -> f32 {
        self.settings.frame_duration_ms()
    }

    pub fn stats(&self) -> EncoderStats {
        EncoderStats {
            frames_encoded: self.frames_encoded,
            bytes_produced: self.bytes_produced,
            average_frame_size: if self.frames_encoded > 0 {
                self.bytes_produced as f32 / self.frames_encoded as f32
            } else {
                0.0
            },
        }
    }
}

/// Encoder statistics
#[derive(Debug, Clone)]
pub struct EncoderStats {
    pub frames_encoded: u64,
    pub bytes_produced: u64,
    pub average_frame_size: f32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::MAX_ENCODED_FRAME_SIZE;

    #[test]
    fn test_encoder_creation() {
        let encoder = OpusEncoder::music(48000, 2).unwrap();
        assert_eq!(encoder.settings().sample_rate, 48000);
        assert_eq!(encoder.frame_size(), 960);
        assert!((encoder.frame_duration_ms() - 20.0).abs() < 0.1);
    }

    #[test]
    fn test_encoded_frames_fit_receiver_limit() {
        let mut encoder = OpusEncoder::music(48000, 2).unwrap();
        let samples: Vec<i16> = (0..encoder.samples_per_frame())
            .map(|i| ((i as f32 * 0.05).sin() * 8000.0) as i16)
            .collect();

        let encoded = encoder.encode(&samples).unwrap();
        assert!(!encoded.is_empty());
        assert!(encoded.len() <= MAX_ENCODED_FRAME_SIZE);
        assert_eq!(encoder.stats().frames_encoded, 1);
    }

    #[test]
    fn test_wrong_frame_length_rejected() {
        let mut encoder = OpusEncoder::music(48000, 2).unwrap();
        assert!(matches!(
            encoder.encode(&[0i16; 10]),
            Err(CodecError::InvalidFrameSize(10))
        ));
    }
}
