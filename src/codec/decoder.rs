//! Frame codec adapter
//!
//! Decodes one compressed frame at a time into the playback PCM buffer and
//! owns the decoder lifecycle: a stream restart destroys the decoder, the
//! next frame creates a fresh one.

use opus::{Channels, Decoder};

use crate::audio::buffer::PlaybackBuffer;
use crate::error::CodecError;

/// A stateful decoder for one stream
pub trait FrameDecoder: Send {
    /// Decodes `frame` into interleaved samples, returning samples per channel.
    fn decode(&mut self, frame: &[u8], pcm: &mut [i16]) -> Result<usize, CodecError>;
}

/// Factory for decoders plus codec metadata
pub trait Codec: Send {
    type Decoder: FrameDecoder;

    fn create_decoder(&self, sample_rate: u32, channels: u16) -> Result<Self::Decoder, CodecError>;

    /// Library version string announced to transmitters
    fn version(&self) -> String;
}

/// libopus
#[derive(Debug, Default, Clone, Copy)]
pub struct OpusCodec;

impl Codec for OpusCodec {
    type Decoder = OpusDecoder;

    fn create_decoder(&self, sample_rate: u32, channels: u16) -> Result<OpusDecoder, CodecError> {
        OpusDecoder::new(sample_rate, channels)
    }

    fn version(&self) -> String {
        opus::version().to_string()
    }
}

/// Opus decoder wrapper
pub struct OpusDecoder {
    decoder: Decoder,
}

impl OpusDecoder {
    pub fn new(sample_rate: u32, channels: u16) -> Result<Self, CodecError> {
        let opus_channels = match channels {
            1 => Channels::Mono,
            2 => Channels::Stereo,
            _ => {
                return Err(CodecError::DecoderInit(format!(
                    "Unsupported channel count: {}",
                    channels
                )))
            }
        };

        let decoder = Decoder::new(sample_rate, opus_channels)
            .map_err(|e| CodecError::DecoderInit(e.to_string()))?;

        Ok(Self { decoder })
    }
}

impl FrameDecoder for OpusDecoder {
    fn decode(&mut self, frame: &[u8], pcm: &mut [i16]) -> Result<usize, CodecError> {
        self.decoder
            .decode(frame, pcm, false)
            .map_err(|e| CodecError::DecodingFailed(e.to_string()))
    }
}

/// Owns the codec and the decoder of the current stream
pub struct FrameCodec<C: Codec> {
    codec: C,
    sample_rate: u32,
    channels: u16,
    decoder: Option<C::Decoder>,
    /// Frames decoded since startup
    frames_decoded: u64,
    /// Decoders created since startup
    decoders_created: u64,
}

impl<C: Codec> FrameCodec<C> {
    pub fn new(codec: C, sample_rate: u32, channels: u16) -> Self {
        Self {
            codec,
            sample_rate,
            channels,
            decoder: None,
            frames_decoded: 0,
            decoders_created: 0,
        }
    }

    /// Discards the decoder so no state leaks into the next stream.
    pub fn reset(&mut self) {
        if self.decoder.take().is_some() {
            tracing::debug!("Decoder destroyed for new stream");
        }
    }

    /// Decodes `frame` into `buffer` and returns the PCM bytes produced.
    pub fn decode<'b>(
        &mut self,
        frame: &[u8],
        buffer: &'b mut PlaybackBuffer,
    ) -> Result<&'b [u8], CodecError> {
        let decoder = match self.decoder.take() {
            Some(decoder) => decoder,
            None => {
                let decoder = self.codec.create_decoder(self.sample_rate, self.channels)?;
                self.decoders_created += 1;
                decoder
            }
        };
        let decoder = self.decoder.insert(decoder);

        let samples_per_channel = decoder.decode(frame, buffer.pcm_mut())?;
        self.frames_decoded += 1;
        buffer.commit(samples_per_channel)
    }

    pub fn version(&self) -> String {
        self.codec.version()
    }

    pub fn frames_decoded(&self) -> u64 {
        self.frames_decoded
    }

    pub fn decoders_created(&self) -> u64 {
        self.decoders_created
    }

    pub fn has_decoder(&self) -> bool {
        self.decoder.is_some()
    }
}
