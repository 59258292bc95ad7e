//! Link-layer capability
//!
//! The connectivity manager drives association through [`LinkLayer`] and
//! learns about its outcome through [`LinkEvent`]s delivered on a channel.
//! [`HostLink`] is the adapter for hosts whose network the operating system
//! already manages.

use crossbeam_channel::{unbounded, Receiver, Sender};
use std::fs;
use std::net::{IpAddr, Ipv4Addr, UdpSocket};

use crate::error::ConnectivityError;
use crate::protocol::MacAddress;

/// Network name and passphrase
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub ssid: String,
    pub psk: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("ssid", &self.ssid)
            .field("psk", &"<redacted>")
            .finish()
    }
}

/// One scan result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessPoint {
    pub bssid: MacAddress,
    pub ssid: String,
    /// Signal strength in dBm
    pub rssi: i8,
}

/// Asynchronous notifications from the link layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// Radio is up and credentials are applied
    Started,
    GotAddress(IpAddr),
    Disassociated,
}

/// Narrow view of the network interface
pub trait LinkLayer: Send {
    /// Applies credentials and brings the link up; `Started` follows.
    fn configure(&mut self, credentials: &Credentials) -> Result<(), ConnectivityError>;

    fn scan(&mut self, ssid: &str) -> Result<Vec<AccessPoint>, ConnectivityError>;

    /// Begins association with one specific access point. The outcome is
    /// reported as `GotAddress` or `Disassociated`.
    fn associate(&mut self, bssid: MacAddress) -> Result<(), ConnectivityError>;

    fn mac_address(&self) -> MacAddress;
}

/// Link adapter for an OS-managed network interface.
///
/// Scanning yields a single synthetic access point and association completes
/// immediately with the host's outbound address.
pub struct HostLink {
    events: Sender<LinkEvent>,
    mac_address: MacAddress,
    ssid: Option<String>,
}

impl HostLink {
    /// Creates the adapter and the channel its events arrive on
    pub fn new(mac_address: Option<MacAddress>) -> (Self, Receiver<LinkEvent>) {
        let (tx, rx) = unbounded();
        let mac_address = mac_address.unwrap_or_else(|| {
            host_mac_address().unwrap_or_else(|| {
                tracing::warn!("No hardware address found, announcing {}", MacAddress::default());
                MacAddress::default()
            })
        });
        (
            Self {
                events: tx,
                mac_address,
                ssid: None,
            },
            rx,
        )
    }

    fn emit(&self, event: LinkEvent) -> Result<(), ConnectivityError> {
        self.events
            .send(event)
            .map_err(|_| ConnectivityError::Link("event channel closed".to_string()))
    }
}

impl LinkLayer for HostLink {
    fn configure(&mut self, credentials: &Credentials) -> Result<(), ConnectivityError> {
        self.ssid = Some(credentials.ssid.clone());
        self.emit(LinkEvent::Started)
    }

    fn scan(&mut self, ssid: &str) -> Result<Vec<AccessPoint>, ConnectivityError> {
        Ok(vec![AccessPoint {
            bssid: self.mac_address,
            ssid: self.ssid.clone().unwrap_or_else(|| ssid.to_string()),
            rssi: 0,
        }])
    }

    fn associate(&mut self, _bssid: MacAddress) -> Result<(), ConnectivityError> {
        let address = outbound_address().unwrap_or_else(|| {
            tracing::warn!("No routable address, using loopback");
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        });
        self.emit(LinkEvent::GotAddress(address))
    }

    fn mac_address(&self) -> MacAddress {
        self.mac_address
    }
}

/// Address the host would use for outbound traffic. Connecting a UDP
/// socket sends nothing.
fn outbound_address() -> Option<IpAddr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    socket.connect((Ipv4Addr::new(192, 0, 2, 1), 9)).ok()?;
    let ip = socket.local_addr().ok()?.ip();
    (!ip.is_unspecified() && !ip.is_loopback()).then_some(ip)
}

/// First non-loopback interface address under `/sys/class/net`
fn host_mac_address() -> Option<MacAddress> {
    let mut interfaces: Vec<_> = fs::read_dir("/sys/class/net")
        .ok()?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name() != "lo")
        .collect();
    interfaces.sort_by_key(|entry| entry.file_name());

    interfaces.iter().find_map(|entry| {
        let text = fs::read_to_string(entry.path().join("address")).ok()?;
        let mac: MacAddress = text.trim().parse().ok()?;
        (mac != MacAddress::default()).then_some(mac)
    })
}
