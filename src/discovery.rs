//! UDP discovery responder
//!
//! Answers `DISCOVER_SERVER` probes with `SERVER_IP:<ip>;TCP_PORT:<port>`.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio::net::{ToSocketAddrs, UdpSocket};

use crate::{DISCOVERY_PROBE, Result};

/// Local address the OS would use to reach `peer`.
///
/// Connecting a UDP socket sends nothing; it only selects a route, and the
/// socket's local address then names the right interface. Falls back to
/// loopback when no route exists.
pub fn outbound_ip_for(peer: IpAddr) -> IpAddr {
    let bind: SocketAddr = match peer {
        IpAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        IpAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };

    std::net::UdpSocket::bind(bind)
        .and_then(|socket| {
            socket.connect((peer, 1))?;
            socket.local_addr()
        })
        .map(|addr| addr.ip())
        .ok()
        .filter(|ip| !ip.is_unspecified())
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

pub fn format_reply(ip: IpAddr, tcp_port: u16) -> String {
    format!("SERVER_IP:{ip};TCP_PORT:{tcp_port}\n")
}

/// Parse a discovery reply into the advertised address
pub fn parse_discovery_reply(reply: &str) -> Option<SocketAddr> {
    let mut ip = None;
    let mut port = None;
    for field in reply.trim().split(';') {
        match field.split_once(':') {
            Some(("SERVER_IP", value)) => ip = value.parse::<IpAddr>().ok(),
            Some(("TCP_PORT", value)) => port = value.parse::<u16>().ok(),
            _ => {}
        }
    }
    Some(SocketAddr::new(ip?, port?))
}

pub struct DiscoveryResponder {
    socket: UdpSocket,
    tcp_port: u16,
}

impl DiscoveryResponder {
    pub async fn bind(addr: impl ToSocketAddrs, tcp_port: u16) -> Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        socket.set_broadcast(true)?;
        Ok(Self { socket, tcp_port })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Serve probes forever. Per-datagram errors are logged and skipped.
    pub async fn run(self) {
        let mut buf = [0u8; 1024];
        if let Ok(addr) = self.socket.local_addr() {
            tracing::info!(addr = %addr, "UDP discovery listening");
        }

        loop {
            let (len, peer) = match self.socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    tracing::error!(error = %e, "Discovery receive failed");
                    continue;
                }
            };

            let probe = String::from_utf8_lossy(&buf[..len]);
            tracing::debug!(peer = %peer, probe = %probe.trim(), "Discovery datagram");
            if probe.trim() != DISCOVERY_PROBE {
                continue;
            }

            let reply = format_reply(outbound_ip_for(peer.ip()), self.tcp_port);
            match self.socket.send_to(reply.as_bytes(), peer).await {
                Ok(_) => tracing::info!(peer = %peer, reply = %reply.trim(), "Answered discovery probe"),
                Err(e) => tracing::warn!(peer = %peer, error = %e, "Failed to answer discovery probe"),
            }
        }
    }
}
