//! Network helpers.

use std::net::{IpAddr, Ipv4Addr, UdpSocket};

/// Best-effort discovery of the IP this host uses for outbound traffic.
///
/// Connects a UDP socket to a public address (no packets are sent) and reads
/// the local address the kernel picked. Falls back to loopback.
pub fn exposed_ip() -> IpAddr {
    UdpSocket::bind("0.0.0.0:0")
        .and_then(|s| {
            s.connect("8.8.8.8:80")?;
            s.local_addr()
        })
        .map(|addr| addr.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}
