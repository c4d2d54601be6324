//! Address helpers used for display purposes only.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};

/// Picks the IPv4 address this host would use to reach other machines,
/// falling back to loopback when there is none.
///
/// Connecting a UDP socket sends no packets; it only asks the OS for a route,
/// which is enough to learn the outbound interface address.
pub fn local_ipv4() -> Ipv4Addr {
    probe_outbound_ipv4().unwrap_or(Ipv4Addr::LOCALHOST)
}

fn probe_outbound_ipv4() -> Option<Ipv4Addr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    socket.connect((Ipv4Addr::new(192, 0, 2, 1), 9)).ok()?;
    match socket.local_addr().ok()?.ip() {
        IpAddr::V4(ip) if !ip.is_loopback() && !ip.is_unspecified() => Some(ip),
        _ => None,
    }
}

/// The address a peer at `addr` is best shown as: loopback and wildcard
/// addresses are replaced by this host's outbound IPv4 address.
pub fn display_addr(addr: SocketAddr) -> SocketAddr {
    let ip = addr.ip();
    if ip.is_loopback() || ip.is_unspecified() {
        SocketAddr::new(IpAddr::V4(local_ipv4()), addr.port())
    } else {
        addr
    }
}

/// Formats the `name@ip:port` identity shown to other participants.
pub fn display_name(name: &str, addr: SocketAddr) -> String {
    format!("{name}@{addr}")
}
