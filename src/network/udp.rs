//! UDP socket setup

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

use crate::error::NetworkError;

/// Binds a UDP socket on `addr` with address reuse and broadcast enabled.
///
/// `read_timeout` bounds each receive so the caller can periodically
/// re-check its run condition.
pub fn create_socket(
    addr: SocketAddr,
    read_timeout: Option<Duration>,
) -> Result<UdpSocket, NetworkError> {
    let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| NetworkError::BindFailed(e.to_string()))?;

    socket
        .set_reuse_address(true)
        .map_err(|e| NetworkError::BindFailed(e.to_string()))?;
    socket
        .set_broadcast(true)
        .map_err(|e| NetworkError::BindFailed(e.to_string()))?;
    socket
        .set_read_timeout(read_timeout)
        .map_err(|e| NetworkError::BindFailed(e.to_string()))?;
    socket
        .bind(&SockAddr::from(addr))
        .map_err(|e| NetworkError::BindFailed(format!("{}: {}", addr, e)))?;

    Ok(socket.into())
}
