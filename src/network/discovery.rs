//! Discovery responder
//!
//! Answers "who is there" broadcasts on the discovery port with this
//! receiver's descriptor. Datagrams that carry the wrong magic word or any
//! message other than a discovery request are dropped without a reply.

use prost::Message;
use serde::Serialize;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::constants::DISCOVERY_BUFFER_SIZE;
use crate::error::NetworkError;
use crate::fault::SharedFaultHandler;
use crate::network::connectivity::ConnectivityReader;
use crate::network::session::StreamingFlag;
use crate::network::udp::create_socket;
use crate::protocol::{broadcast_message, BroadcastMessage, DeviceDescriptor, MAGIC_WORD, MAX_DISCOVERY_MESSAGE_SIZE};

/// How often a blocked receive re-checks connectivity
const CONNECTIVITY_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Default)]
pub struct DiscoveryStats {
    requests_answered: AtomicU64,
    datagrams_dropped: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoverySnapshot {
    pub requests_answered: u64,
    pub datagrams_dropped: u64,
}

impl DiscoveryStats {
    pub fn snapshot(&self) -> DiscoverySnapshot {
        DiscoverySnapshot {
            requests_answered: self.requests_answered.load(Ordering::Relaxed),
            datagrams_dropped: self.datagrams_dropped.load(Ordering::Relaxed),
        }
    }
}

/// Decodes one datagram and builds the reply, if it deserves one.
///
/// Returns `Ok(None)` for well-formed datagrams that are not discovery
/// requests for this protocol.
pub fn handle_datagram(
    datagram: &[u8],
    descriptor: &DeviceDescriptor,
    currently_streaming: bool,
) -> Result<Option<Vec<u8>>, prost::DecodeError> {
    let request = BroadcastMessage::decode(datagram)?;

    if request.magic_word != MAGIC_WORD {
        return Ok(None);
    }
    if !matches!(
        request.message,
        Some(broadcast_message::Message::DiscoveryRequest(_))
    ) {
        return Ok(None);
    }

    let response = BroadcastMessage::discovery_response(descriptor.to_discovery_response(currently_streaming));
    Ok(Some(response.encode_to_vec()))
}

/// UDP service bound to the discovery port
pub struct DiscoveryResponder {
    bind_addr: SocketAddr,
    descriptor: DeviceDescriptor,
    streaming: StreamingFlag,
    connectivity: ConnectivityReader,
    stats: Arc<DiscoveryStats>,
    fault: SharedFaultHandler,
}

impl DiscoveryResponder {
    pub fn new(
        bind_addr: SocketAddr,
        descriptor: DeviceDescriptor,
        streaming: StreamingFlag,
        connectivity: ConnectivityReader,
        fault: SharedFaultHandler,
    ) -> Self {
        Self {
            bind_addr,
            descriptor,
            streaming,
            connectivity,
            stats: Arc::new(DiscoveryStats::default()),
            fault,
        }
    }

    pub fn stats(&self) -> Arc<DiscoveryStats> {
        self.stats.clone()
    }

    /// Binds once connected, then answers requests for as long as the
    /// process lives. Receives pause while the link is down.
    pub fn run(&self) -> Result<(), NetworkError> {
        self.connectivity.wait_connected();
        let socket = create_socket(self.bind_addr, Some(CONNECTIVITY_POLL_INTERVAL))?;
        tracing::info!("Discovery responder listening on {}", self.bind_addr);

        let mut buf = [0u8; DISCOVERY_BUFFER_SIZE];
        loop {
            if !self.connectivity.is_connected() {
                self.connectivity.wait_connected();
            }
            self.serve_one(&socket, &mut buf);
        }
    }

    pub fn spawn(self) -> std::io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("discovery".to_string())
            .spawn(move || {
                if let Err(e) = self.run() {
                    tracing::error!("Discovery responder stopped: {}", e);
                }
            })
    }

    fn serve_one(&self, socket: &UdpSocket, buf: &mut [u8]) {
        let (len, peer) = match socket.recv_from(buf) {
            Ok(received) => received,
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                return;
            }
            Err(e) => {
                tracing::warn!("Discovery receive failed: {}", e);
                return;
            }
        };

        let reply = match handle_datagram(&buf[..len], &self.descriptor, self.streaming.is_streaming()) {
            Ok(Some(reply)) => reply,
            Ok(None) => {
                self.stats.datagrams_dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
            Err(e) => {
                tracing::warn!("Undecodable discovery datagram from {}: {}", peer, e);
                self.stats.datagrams_dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        if reply.len() > MAX_DISCOVERY_MESSAGE_SIZE {
            self.fault.fatal(
                "discovery",
                &NetworkError::PacketTooLarge(reply.len()),
            );
        }

        match socket.send_to(&reply, peer) {
            Ok(_) => {
                self.stats.requests_answered.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("Answered discovery request from {}", peer);
            }
            Err(e) => tracing::warn!("Discovery reply to {} failed: {}", peer, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault::testing::panic_on_fault;
    use crate::network::connectivity::{connectivity_cell, ConnectionState};
    use crate::protocol::{DiscoveryResponse, MacAddress};
    use proptest::prelude::*;

    fn descriptor() -> DeviceDescriptor {
        DeviceDescriptor::new(MacAddress([1, 2, 3, 4, 5, 6]), "Test Receiver", "test 1.0")
    }

    fn decode_reply(reply: &[u8]) -> DiscoveryResponse {
        match BroadcastMessage::decode(reply).unwrap().message {
            Some(broadcast_message::Message::DiscoveryResponse(response)) => response,
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_request_gets_descriptor() {
        let request = BroadcastMessage::discovery_request().encode_to_vec();
        let reply = handle_datagram(&request, &descriptor(), true).unwrap().unwrap();
        assert!(reply.len() <= MAX_DISCOVERY_MESSAGE_SIZE);

        let response = decode_reply(&reply);
        assert_eq!(response.device_name, "Test Receiver");
        assert_eq!(response.mac_address, 0x0605_0403_0201);
        assert!(response.currently_streaming);
        assert_eq!(response.protocol_version, 1);
    }

    #[test]
    fn test_wrong_magic_is_ignored() {
        let mut request = BroadcastMessage::discovery_request();
        request.magic_word = 0xDEAD_BEEF;
        assert_eq!(handle_datagram(&request.encode_to_vec(), &descriptor(), false).unwrap(), None);
    }

    #[test]
    fn test_response_and_empty_messages_are_ignored() {
        let response = BroadcastMessage::discovery_response(descriptor().to_discovery_response(false));
        assert_eq!(handle_datagram(&response.encode_to_vec(), &descriptor(), false).unwrap(), None);

        let empty = BroadcastMessage {
            magic_word: MAGIC_WORD,
            message: None,
        };
        assert_eq!(handle_datagram(&empty.encode_to_vec(), &descriptor(), false).unwrap(), None);
    }

    #[test]
    fn test_garbage_is_a_decode_error() {
        assert!(handle_datagram(&[0x0A, 0xFF], &descriptor(), false).is_err());
    }

    #[test]
    fn test_responder_answers_over_udp() {
        let (writer, reader) = connectivity_cell();
        writer.set(ConnectionState::Connected);

        let client = create_socket("127.0.0.1:0".parse().unwrap(), Some(Duration::from_secs(2))).unwrap();
        let responder_socket = create_socket("127.0.0.1:0".parse().unwrap(), Some(Duration::from_secs(2))).unwrap();
        let responder_addr = responder_socket.local_addr().unwrap();

        let responder = DiscoveryResponder::new(
            responder_addr,
            descriptor(),
            StreamingFlag::default(),
            reader,
            panic_on_fault(),
        );

        client.send_to(&[0x0A, 0xFF], responder_addr).unwrap();
        client
            .send_to(&BroadcastMessage::discovery_request().encode_to_vec(), responder_addr)
            .unwrap();

        let mut buf = [0u8; DISCOVERY_BUFFER_SIZE];
        responder.serve_one(&responder_socket, &mut buf);
        responder.serve_one(&responder_socket, &mut buf);

        let mut reply = [0u8; DISCOVERY_BUFFER_SIZE];
        let (len, from) = client.recv_from(&mut reply).unwrap();
        assert_eq!(from, responder_addr);
        assert_eq!(decode_reply(&reply[..len]).device_name, "Test Receiver");

        let stats = responder.stats().snapshot();
        assert_eq!(stats.requests_answered, 1);
        assert_eq!(stats.datagrams_dropped, 1);
    }

    proptest! {
        #[test]
        fn prop_only_exact_requests_are_answered(
            magic in prop_oneof![Just(MAGIC_WORD), any::<u32>()],
            kind in 0u8..3,
            flag in any::<bool>(),
        ) {
            let message = match kind {
                0 => Some(broadcast_message::Message::DiscoveryRequest(flag)),
                1 => Some(broadcast_message::Message::DiscoveryResponse(
                    descriptor().to_discovery_response(flag),
                )),
                _ => None,
            };
            let datagram = BroadcastMessage { magic_word: magic, message }.encode_to_vec();
            let reply = handle_datagram(&datagram, &descriptor(), false).unwrap();
            prop_assert_eq!(reply.is_some(), magic == MAGIC_WORD && kind == 0);
        }

        #[test]
        fn prop_random_bytes_never_answered_unless_exact(bytes in proptest::collection::vec(any::<u8>(), 0..64)) {
            if let Ok(Some(_)) = handle_datagram(&bytes, &descriptor(), false) {
                let request = BroadcastMessage::decode(bytes.as_slice()).unwrap();
                prop_assert_eq!(request.magic_word, MAGIC_WORD);
                let is_request = matches!(request.message, Some(broadcast_message::Message::DiscoveryRequest(_)));
                prop_assert!(is_request);
            }
        }
    }
}
