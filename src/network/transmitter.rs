//! Client side of the protocol
//!
//! Used by the `transmitter` binary and by the integration tests: locate
//! receivers with a discovery broadcast, connect, read the handshake and
//! stream frames within the advertised limit.

use bytes::Bytes;
use prost::Message;
use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr, TcpStream};
use std::time::{Duration, Instant};

use crate::constants::DISCOVERY_BUFFER_SIZE;
use crate::error::{NetworkError, ProtocolError};
use crate::network::udp::create_socket;
use crate::protocol::{
    broadcast_message, read_delimited, to_transmitter, write_delimited, BroadcastMessage, Delimited,
    DiscoveryResponse, ReceiverInformation, ToReceiver, ToTransmitter, MAGIC_WORD,
};

/// Bound for the handshake message
const MAX_HANDSHAKE_LEN: usize = 1024;

/// A receiver that answered a discovery request
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredReceiver {
    /// Where the reply came from
    pub address: SocketAddr,
    pub info: DiscoveryResponse,
}

/// Broadcasts a discovery request on `port` and collects replies until
/// `timeout` elapses.
pub fn discover_receivers(port: u16, timeout: Duration) -> Result<Vec<DiscoveredReceiver>, NetworkError> {
    discover_receivers_at(SocketAddr::from((Ipv4Addr::BROADCAST, port)), timeout)
}

/// Like [`discover_receivers`], sending the request to `target`
pub fn discover_receivers_at(
    target: SocketAddr,
    timeout: Duration,
) -> Result<Vec<DiscoveredReceiver>, NetworkError> {
    let local = if target.ip().is_loopback() {
        SocketAddr::from((Ipv4Addr::LOCALHOST, 0))
    } else {
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
    };
    let socket = create_socket(local, Some(Duration::from_millis(50)))?;

    let request = BroadcastMessage::discovery_request().encode_to_vec();
    socket
        .send_to(&request, target)
        .map_err(|e| NetworkError::SendFailed(e.to_string()))?;

    let deadline = Instant::now() + timeout;
    let mut seen = HashSet::new();
    let mut receivers = Vec::new();
    let mut buf = [0u8; DISCOVERY_BUFFER_SIZE];

    while Instant::now() < deadline {
        let (len, from) = match socket.recv_from(&mut buf) {
            Ok(received) => received,
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                continue;
            }
            Err(e) => return Err(NetworkError::ReceiveFailed(e.to_string())),
        };

        let Ok(message) = BroadcastMessage::decode(&buf[..len]) else {
            tracing::debug!("Ignoring undecodable reply from {}", from);
            continue;
        };
        if message.magic_word != MAGIC_WORD {
            continue;
        }
        if let Some(broadcast_message::Message::DiscoveryResponse(info)) = message.message {
            if seen.insert(info.mac_address) {
                tracing::debug!("Found receiver {:?} at {}", info.device_name, from);
                receivers.push(DiscoveredReceiver { address: from, info });
            }
        }
    }

    Ok(receivers)
}

/// An open audio session, seen from the transmitter
pub struct RemoteReceiver {
    stream: TcpStream,
    info: ReceiverInformation,
    frames_sent: u64,
}

impl RemoteReceiver {
    /// Connects and reads the handshake
    pub fn connect(addr: SocketAddr) -> Result<Self, ProtocolError> {
        let mut stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;

        let info = match read_delimited::<ToTransmitter, _>(&mut stream, MAX_HANDSHAKE_LEN)? {
            Delimited::Message(ToTransmitter {
                message: Some(to_transmitter::Message::ReceiverInformation(info)),
            }) => info,
            Delimited::Message(ToTransmitter {
                message: Some(to_transmitter::Message::Error(_)),
            }) => return Err(ProtocolError::UnexpectedMessage("receiver error")),
            Delimited::Message(_) => return Err(ProtocolError::UnexpectedMessage("empty handshake")),
            Delimited::Oversized(_) => return Err(ProtocolError::UnexpectedMessage("oversized handshake")),
            Delimited::Malformed(e) => return Err(ProtocolError::Decode(e)),
        };

        tracing::info!(
            "Connected to {} (max frame {} bytes)",
            info.discovery_data
                .as_ref()
                .map(|d| d.device_name.as_str())
                .unwrap_or("receiver"),
            info.max_encoded_frame_size
        );

        Ok(Self {
            stream,
            info,
            frames_sent: 0,
        })
    }

    pub fn information(&self) -> &ReceiverInformation {
        &self.info
    }

    pub fn max_encoded_frame_size(&self) -> usize {
        self.info.max_encoded_frame_size as usize
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent
    }

    /// Sends one encoded frame. Frames above the advertised maximum are
    /// refused locally.
    pub fn send_frame(&mut self, frame: Bytes) -> Result<(), ProtocolError> {
        let max = self.max_encoded_frame_size();
        if frame.len() > max {
            return Err(ProtocolError::FrameTooLarge {
                size: frame.len(),
                max,
            });
        }
        write_delimited(&mut self.stream, &ToReceiver::audio_data(frame))?;
        self.frames_sent += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{DeviceDescriptor, HandshakeCapabilities, MacAddress};
    use std::net::TcpListener;
    use std::thread;

    fn capabilities(max: u32) -> HandshakeCapabilities {
        HandshakeCapabilities {
            descriptor: DeviceDescriptor::new(MacAddress([9; 6]), "Desk", "test"),
            max_encoded_frame_size: max,
            max_decoded_frame_size: 23040,
        }
    }

    #[test]
    fn test_connect_reads_handshake_and_enforces_limit() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            write_delimited(&mut stream, &capabilities(8).to_message(false)).unwrap();
            read_delimited::<ToReceiver, _>(&mut stream, 64).unwrap()
        });

        let mut receiver = RemoteReceiver::connect(addr).unwrap();
        assert_eq!(receiver.max_encoded_frame_size(), 8);
        assert!(matches!(
            receiver.send_frame(Bytes::from_static(b"far too long")),
            Err(ProtocolError::FrameTooLarge { size: 12, max: 8 })
        ));
        receiver.send_frame(Bytes::from_static(b"short")).unwrap();
        assert_eq!(receiver.frames_sent(), 1);

        assert!(matches!(server.join().unwrap(), Delimited::Message(_)));
    }

    #[test]
    fn test_connect_rejects_error_handshake() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let error = ToTransmitter {
                message: Some(to_transmitter::Message::Error(crate::protocol::ReceiverError {
                    audio_underflow: true,
                    audio_decode_error: false,
                })),
            };
            write_delimited(&mut stream, &error).unwrap();
        });

        assert!(matches!(
            RemoteReceiver::connect(addr),
            Err(ProtocolError::UnexpectedMessage(_))
        ));
    }
}
