//! Network subsystem: link state, discovery and the audio session

pub mod connectivity;
pub mod discovery;
pub mod link;
pub mod session;
pub mod transmitter;
pub mod udp;

pub use connectivity::{
    connectivity_cell, ConnectionState, ConnectivityManager, ConnectivityReader, ConnectivityWriter,
};
pub use discovery::{handle_datagram, DiscoveryResponder, DiscoveryStats};
pub use link::{AccessPoint, Credentials, HostLink, LinkEvent, LinkLayer};
pub use session::{AudioSessionServer, SessionEnd, SessionStats, StreamingFlag};
pub use transmitter::{discover_receivers, DiscoveredReceiver, RemoteReceiver};
pub use udp::create_socket;
