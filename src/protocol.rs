//! Wire protocol between transmitter and receiver
//!
//! Two channels share one message family:
//!
//! - **Discovery** (UDP): one [`BroadcastMessage`] per datagram, no framing.
//! - **Audio session** (TCP): length-delimited messages. The receiver sends a
//!   single [`ToTransmitter`] handshake, the transmitter then streams
//!   [`ToReceiver`] audio frames.
//!
//! Messages are Protocol Buffers. Every scalar is encoded even when it holds
//! its default value, so the output stays readable by proto2 peers.

use bytes::{Bytes, BytesMut};
use prost::Message;
use std::fmt;
use std::io::{self, Read, Write};
use std::str::FromStr;

use crate::error::ProtocolError;

/// Guards the broadcast port against unrelated traffic
pub const MAGIC_WORD: u32 = 0x2C5D_A044;

/// Version reported in every discovery response
pub const PROTOCOL_VERSION: u32 = 1;

/// Upper bound for any string carried in a [`DiscoveryResponse`]
pub const MAX_DESCRIPTOR_STRING_BYTES: usize = 127;

/// Upper bound for a serialized discovery datagram
pub const MAX_DISCOVERY_MESSAGE_SIZE: usize = 300;

/// Bytes a [`ToReceiver`] envelope may add around an audio payload
pub const AUDIO_ENVELOPE_OVERHEAD: usize = 16;

/// Longest varint accepted as a length prefix (32 bit values)
const MAX_VARINT_BYTES: usize = 5;

#[derive(Clone, PartialEq, Message)]
pub struct BroadcastMessage {
    /// must be [`MAGIC_WORD`]
    #[prost(uint32, required, tag = "1")]
    pub magic_word: u32,
    #[prost(oneof = "broadcast_message::Message", tags = "2, 3")]
    pub message: Option<broadcast_message::Message>,
}

pub mod broadcast_message {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Message {
        #[prost(bool, tag = "2")]
        DiscoveryRequest(bool),
        #[prost(message, tag = "3")]
        DiscoveryResponse(super::DiscoveryResponse),
    }
}

#[derive(Clone, PartialEq, Message)]
pub struct DiscoveryResponse {
    #[prost(uint32, required, tag = "1")]
    pub protocol_version: u32,
    #[prost(uint64, required, tag = "2")]
    pub mac_address: u64,
    #[prost(string, required, tag = "3")]
    pub device_name: String,
    #[prost(bool, required, tag = "4")]
    pub currently_streaming: bool,
    /// version string of the codec library
    #[prost(string, required, tag = "5")]
    pub opus_version: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct ReceiverInformation {
    #[prost(message, optional, tag = "1")]
    pub discovery_data: Option<DiscoveryResponse>,
    /// maximum number of bytes of `AudioData::opus_encoded_frame`
    #[prost(uint32, required, tag = "2")]
    pub max_encoded_frame_size: u32,
    /// size of the decode buffer in bytes
    #[prost(uint32, required, tag = "3")]
    pub max_decoded_frame_size: u32,
}

#[derive(Clone, PartialEq, Message)]
pub struct ReceiverError {
    #[prost(bool, required, tag = "1")]
    pub audio_underflow: bool,
    #[prost(bool, required, tag = "2")]
    pub audio_decode_error: bool,
}

#[derive(Clone, PartialEq, Message)]
pub struct ToTransmitter {
    #[prost(oneof = "to_transmitter::Message", tags = "1, 2")]
    pub message: Option<to_transmitter::Message>,
}

pub mod to_transmitter {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Message {
        #[prost(message, tag = "1")]
        ReceiverInformation(super::ReceiverInformation),
        #[prost(message, tag = "2")]
        Error(super::ReceiverError),
    }
}

#[derive(Clone, PartialEq, Message)]
pub struct AudioData {
    #[prost(bytes = "bytes", tag = "1")]
    pub opus_encoded_frame: Bytes,
}

#[derive(Clone, PartialEq, Message)]
pub struct ToReceiver {
    #[prost(oneof = "to_receiver::Message", tags = "1")]
    pub message: Option<to_receiver::Message>,
}

pub mod to_receiver {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Message {
        #[prost(message, tag = "1")]
        AudioData(super::AudioData),
    }
}

impl BroadcastMessage {
    pub fn discovery_request() -> Self {
        Self {
            magic_word: MAGIC_WORD,
            message: Some(broadcast_message::Message::DiscoveryRequest(true)),
        }
    }

    pub fn discovery_response(response: DiscoveryResponse) -> Self {
        Self {
            magic_word: MAGIC_WORD,
            message: Some(broadcast_message::Message::DiscoveryResponse(response)),
        }
    }
}

impl ToReceiver {
    pub fn audio_data(frame: Bytes) -> Self {
        Self {
            message: Some(to_receiver::Message::AudioData(AudioData {
                opus_encoded_frame: frame,
            })),
        }
    }
}

/// 48-bit hardware address of the receiver's network interface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    /// Packs the octets little-endian: octet `i` lands in bits `8 * i`.
    pub fn to_u64(self) -> u64 {
        self.0
            .iter()
            .enumerate()
            .fold(0u64, |acc, (i, octet)| acc | (u64::from(*octet) << (i * 8)))
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
    }
}

impl FromStr for MacAddress {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut octets = [0u8; 6];
        let mut parts = s.split(|c| c == ':' || c == '-');
        for octet in &mut octets {
            let part = parts.next().ok_or_else(|| format!("too few octets in {s:?}"))?;
            *octet = u8::from_str_radix(part, 16).map_err(|e| format!("{part:?}: {e}"))?;
        }
        if parts.next().is_some() {
            return Err(format!("too many octets in {s:?}"));
        }
        Ok(Self(octets))
    }
}

/// Identity of this receiver, fixed at startup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub protocol_version: u32,
    pub mac_address: MacAddress,
    pub device_name: String,
    pub codec_version: String,
}

impl DeviceDescriptor {
    /// Strings longer than [`MAX_DESCRIPTOR_STRING_BYTES`] are cut at the last
    /// character boundary that fits.
    pub fn new(mac_address: MacAddress, device_name: &str, codec_version: &str) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            mac_address,
            device_name: truncate_utf8(device_name, MAX_DESCRIPTOR_STRING_BYTES).to_string(),
            codec_version: truncate_utf8(codec_version, MAX_DESCRIPTOR_STRING_BYTES).to_string(),
        }
    }

    pub fn to_discovery_response(&self, currently_streaming: bool) -> DiscoveryResponse {
        DiscoveryResponse {
            protocol_version: self.protocol_version,
            mac_address: self.mac_address.to_u64(),
            device_name: self.device_name.clone(),
            currently_streaming,
            opus_version: self.codec_version.clone(),
        }
    }
}

/// Capabilities announced once at the start of every audio session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeCapabilities {
    pub descriptor: DeviceDescriptor,
    pub max_encoded_frame_size: u32,
    pub max_decoded_frame_size: u32,
}

impl HandshakeCapabilities {
    pub fn to_message(&self, currently_streaming: bool) -> ToTransmitter {
        ToTransmitter {
            message: Some(to_transmitter::Message::ReceiverInformation(ReceiverInformation {
                discovery_data: Some(self.descriptor.to_discovery_response(currently_streaming)),
                max_encoded_frame_size: self.max_encoded_frame_size,
                max_decoded_frame_size: self.max_decoded_frame_size,
            })),
        }
    }

    /// Largest length prefix a session accepts before draining the message
    pub fn max_message_len(&self) -> usize {
        self.max_encoded_frame_size as usize + AUDIO_ENVELOPE_OVERHEAD
    }
}

fn truncate_utf8(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Outcome of reading one length-delimited message
#[derive(Debug)]
pub enum Delimited<M> {
    Message(M),
    /// the declared length exceeded the bound; the body was drained
    Oversized(usize),
    /// framing was intact but the body did not decode
    Malformed(prost::DecodeError),
}

/// Writes `message` preceded by its varint length and flushes.
pub fn write_delimited<M: Message, W: Write>(writer: &mut W, message: &M) -> Result<(), ProtocolError> {
    let buf = message.encode_length_delimited_to_vec();
    writer.write_all(&buf)?;
    writer.flush()?;
    Ok(())
}

/// Reads a varint length prefix of at most 32 bits.
///
/// End of stream anywhere inside the prefix is reported as
/// [`ProtocolError::Disconnected`].
pub fn read_length_prefix<R: Read>(reader: &mut R) -> Result<u32, ProtocolError> {
    let mut value: u64 = 0;
    for index in 0..MAX_VARINT_BYTES {
        let mut byte = [0u8; 1];
        read_exact_or_disconnect(reader, &mut byte)?;
        value |= u64::from(byte[0] & 0x7F) << (index * 7);
        if byte[0] & 0x80 == 0 {
            return u32::try_from(value).map_err(|_| ProtocolError::MalformedLength);
        }
    }
    Err(ProtocolError::MalformedLength)
}

/// Reads one length-delimited message.
///
/// Bodies longer than `max_len` are consumed from the stream without being
/// buffered, so the caller can reject the message and keep reading.
pub fn read_delimited<M, R>(reader: &mut R, max_len: usize) -> Result<Delimited<M>, ProtocolError>
where
    M: Message + Default,
    R: Read,
{
    let len = read_length_prefix(reader)? as usize;

    if len > max_len {
        let drained = io::copy(&mut reader.by_ref().take(len as u64), &mut io::sink())?;
        if drained < len as u64 {
            return Err(ProtocolError::Disconnected);
        }
        return Ok(Delimited::Oversized(len));
    }

    let mut body = BytesMut::zeroed(len);
    read_exact_or_disconnect(reader, &mut body)?;

    match M::decode(body.freeze()) {
        Ok(message) => Ok(Delimited::Message(message)),
        Err(e) => Ok(Delimited::Malformed(e)),
    }
}

fn read_exact_or_disconnect<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<(), ProtocolError> {
    reader.read_exact(buf).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe => ProtocolError::Disconnected,
        _ => ProtocolError::Io(e),
    })
}
