//! Decoded packet representation
//!
//! One packet as handed to userspace by the netfilter queue, with the
//! IP and transport layers parsed into the typed structs from
//! `layers.rs`. Accessor methods cover the common fields so handlers
//! rarely match on the layer enums directly.

use std::net::IpAddr;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use super::layers::{Layer3, Layer4, TcpInfo, UdpInfo};
use super::tuple::Tuple;

/// IP protocol numbers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IpProtocol {
    Icmp,
    Tcp,
    Udp,
    Icmpv6,
    Other(u8),
}

impl From<u8> for IpProtocol {
    fn from(val: u8) -> Self {
        match val {
            1 => IpProtocol::Icmp,
            6 => IpProtocol::Tcp,
            17 => IpProtocol::Udp,
            58 => IpProtocol::Icmpv6,
            other => IpProtocol::Other(other),
        }
    }
}

impl From<IpProtocol> for u8 {
    fn from(val: IpProtocol) -> Self {
        match val {
            IpProtocol::Icmp => 1,
            IpProtocol::Tcp => 6,
            IpProtocol::Udp => 17,
            IpProtocol::Icmpv6 => 58,
            IpProtocol::Other(v) => v,
        }
    }
}

impl std::fmt::Display for IpProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IpProtocol::Icmp => write!(f, "ICMP"),
            IpProtocol::Tcp => write!(f, "TCP"),
            IpProtocol::Udp => write!(f, "UDP"),
            IpProtocol::Icmpv6 => write!(f, "ICMPv6"),
            IpProtocol::Other(n) => write!(f, "Proto({})", n),
        }
    }
}

/// TCP flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TcpFlags {
    pub fin: bool,
    pub syn: bool,
    pub rst: bool,
    pub psh: bool,
    pub ack: bool,
    pub urg: bool,
}

impl TcpFlags {
    pub fn is_syn(&self) -> bool {
        self.syn && !self.ack
    }

    pub fn is_syn_ack(&self) -> bool {
        self.syn && self.ack
    }
}

impl std::fmt::Display for TcpFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut s = String::new();
        if self.syn { s.push('S'); }
        if self.ack { s.push('A'); }
        if self.fin { s.push('F'); }
        if self.rst { s.push('R'); }
        if self.psh { s.push('P'); }
        if self.urg { s.push('U'); }
        if s.is_empty() { s.push('.'); }
        write!(f, "{}", s)
    }
}

/// One decoded packet
#[derive(Debug, Clone)]
pub struct Packet {
    /// Arrival timestamp
    pub timestamp: Instant,
    /// IP layer (IPv4 or IPv6)
    pub layer3: Layer3,
    /// Transport layer (TCP, UDP, ICMP, other)
    pub layer4: Layer4,
    /// Raw packet length in bytes (including headers)
    pub raw_len: u32,
    /// Raw packet bytes as received from the queue
    pub raw: Vec<u8>,
}

impl Packet {
    /// Create a packet from decoded layers plus the raw bytes
    pub fn from_layers(layer3: Layer3, layer4: Layer4, raw: Vec<u8>) -> Self {
        let raw_len = raw.len() as u32;
        Self {
            timestamp: Instant::now(),
            layer3,
            layer4,
            raw_len,
            raw,
        }
    }

    /// Get source IP address
    pub fn src_ip(&self) -> IpAddr {
        self.layer3.src_ip()
    }

    /// Get destination IP address
    pub fn dst_ip(&self) -> IpAddr {
        self.layer3.dst_ip()
    }

    /// Get IP protocol
    pub fn protocol(&self) -> IpProtocol {
        IpProtocol::from(self.layer3.protocol())
    }

    /// Get source port (0 for portless protocols)
    pub fn src_port(&self) -> u16 {
        self.layer4.src_port().unwrap_or(0)
    }

    /// Get destination port (0 for portless protocols)
    pub fn dst_port(&self) -> u16 {
        self.layer4.dst_port().unwrap_or(0)
    }

    /// Get TCP info if this is a TCP packet
    pub fn tcp(&self) -> Option<&TcpInfo> {
        self.layer4.as_tcp()
    }

    /// Get UDP info if this is a UDP packet
    pub fn udp(&self) -> Option<&UdpInfo> {
        self.layer4.as_udp()
    }

    /// Get application-layer payload
    pub fn payload(&self) -> &[u8] {
        self.layer4.payload()
    }

    /// Check if this is a TCP packet
    pub fn is_tcp(&self) -> bool {
        self.layer4.is_tcp()
    }

    /// Check if this is a UDP packet
    pub fn is_udp(&self) -> bool {
        self.layer4.is_udp()
    }

    /// Check if this is an IPv4 packet
    pub fn is_ipv4(&self) -> bool {
        self.layer3.is_ipv4()
    }

    /// Check if this is an IPv6 packet
    pub fn is_ipv6(&self) -> bool {
        self.layer3.is_ipv6()
    }

    /// Build the client-side tuple as observed on ingress
    ///
    /// Source fields map to the client side and destination fields to
    /// the server side; NAT correction comes later from conntrack.
    pub fn tuple(&self) -> Tuple {
        Tuple {
            protocol: self.layer3.protocol(),
            client_addr: self.src_ip(),
            client_port: self.src_port(),
            server_addr: self.dst_ip(),
            server_port: self.dst_port(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::layers::Ipv4Info;
    use std::net::Ipv4Addr;

    fn sample_packet() -> Packet {
        let layer3 = Layer3::Ipv4(Ipv4Info {
            src_addr: Ipv4Addr::new(10, 0, 0, 1),
            dst_addr: Ipv4Addr::new(1, 2, 3, 4),
            protocol: 6,
            ..Default::default()
        });
        let layer4 = Layer4::Tcp(TcpInfo {
            src_port: 5000,
            dst_port: 443,
            payload: vec![1, 2, 3],
            ..Default::default()
        });
        Packet::from_layers(layer3, layer4, vec![0u8; 40])
    }

    #[test]
    fn test_accessors() {
        let pkt = sample_packet();
        assert!(pkt.is_tcp());
        assert!(pkt.is_ipv4());
        assert_eq!(pkt.protocol(), IpProtocol::Tcp);
        assert_eq!(pkt.src_port(), 5000);
        assert_eq!(pkt.dst_port(), 443);
        assert_eq!(pkt.payload(), &[1, 2, 3]);
        assert_eq!(pkt.raw_len, 40);
    }

    #[test]
    fn test_client_side_tuple() {
        let tuple = sample_packet().tuple();
        assert_eq!(tuple.protocol, 6);
        assert_eq!(tuple.client_addr.to_string(), "10.0.0.1");
        assert_eq!(tuple.client_port, 5000);
        assert_eq!(tuple.server_addr.to_string(), "1.2.3.4");
        assert_eq!(tuple.server_port, 443);
    }

    #[test]
    fn test_tcp_flags_display() {
        let flags = TcpFlags { syn: true, ack: true, ..Default::default() };
        assert!(flags.is_syn_ack());
        assert!(!flags.is_syn());
        assert_eq!(flags.to_string(), "SA");
    }
}
