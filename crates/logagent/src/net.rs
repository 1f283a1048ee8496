use std::io;
use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use tracing::warn;

/// Any routable address works; connecting a UDP socket sends nothing.
const OUTBOUND_ADDR: &str = "8.8.8.8:80";

/// Local address the OS would use to reach the outside world.
pub fn outbound_ip() -> io::Result<IpAddr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    socket.connect(OUTBOUND_ADDR)?;
    Ok(socket.local_addr()?.ip())
}

/// Configured address if any, else the outbound address, else loopback.
pub fn resolve_node_ip(configured: Option<IpAddr>) -> IpAddr {
    if let Some(ip) = configured {
        return ip;
    }
    match outbound_ip() {
        Ok(ip) if !ip.is_unspecified() => ip,
        Ok(ip) => {
            warn!(%ip, "Outbound address is unspecified, using loopback");
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        }
        Err(e) => {
            warn!(error = %e, "Outbound address discovery failed, using loopback");
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        }
    }
}
