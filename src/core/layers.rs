//! Network layer types for packet decoding
//!
//! Strongly-typed structs for each decoded layer:
//! - Layer 3: IPv4, IPv6 (Layer3)
//! - Layer 4: TCP, UDP, ICMP (Layer4)
//!
//! Nfqueue delivers packets at the IP layer, so there is no link-layer
//! representation here.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use serde::{Deserialize, Serialize};

use super::packet::TcpFlags;

// ============================================================================
// Layer 3 - Network
// ============================================================================

/// Layer 3 protocol variants
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Layer3 {
    Ipv4(Ipv4Info),
    Ipv6(Ipv6Info),
}

impl Layer3 {
    /// Get source IP address (works for both IPv4 and IPv6)
    pub fn src_ip(&self) -> IpAddr {
        match self {
            Layer3::Ipv4(info) => IpAddr::V4(info.src_addr),
            Layer3::Ipv6(info) => IpAddr::V6(info.src_addr),
        }
    }

    /// Get destination IP address (works for both IPv4 and IPv6)
    pub fn dst_ip(&self) -> IpAddr {
        match self {
            Layer3::Ipv4(info) => IpAddr::V4(info.dst_addr),
            Layer3::Ipv6(info) => IpAddr::V6(info.dst_addr),
        }
    }

    /// Get next protocol number
    pub fn protocol(&self) -> u8 {
        match self {
            Layer3::Ipv4(info) => info.protocol,
            Layer3::Ipv6(info) => info.next_header,
        }
    }

    /// Get TTL/hop limit
    pub fn ttl(&self) -> u8 {
        match self {
            Layer3::Ipv4(info) => info.ttl,
            Layer3::Ipv6(info) => info.hop_limit,
        }
    }

    /// Check if IPv4
    pub fn is_ipv4(&self) -> bool {
        matches!(self, Layer3::Ipv4(_))
    }

    /// Check if IPv6
    pub fn is_ipv6(&self) -> bool {
        matches!(self, Layer3::Ipv6(_))
    }

    /// Get IPv4 info if present
    pub fn as_ipv4(&self) -> Option<&Ipv4Info> {
        match self {
            Layer3::Ipv4(info) => Some(info),
            _ => None,
        }
    }

    /// Get IPv6 info if present
    pub fn as_ipv6(&self) -> Option<&Ipv6Info> {
        match self {
            Layer3::Ipv6(info) => Some(info),
            _ => None,
        }
    }
}

/// IPv4 header information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ipv4Info {
    pub src_addr: Ipv4Addr,
    pub dst_addr: Ipv4Addr,
    pub protocol: u8,
    pub ttl: u8,
    pub identification: u16,
    pub total_length: u16,
}

impl Default for Ipv4Info {
    fn default() -> Self {
        Self {
            src_addr: Ipv4Addr::UNSPECIFIED,
            dst_addr: Ipv4Addr::UNSPECIFIED,
            protocol: 0,
            ttl: 64,
            identification: 0,
            total_length: 0,
        }
    }
}

/// IPv6 header information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ipv6Info {
    pub src_addr: Ipv6Addr,
    pub dst_addr: Ipv6Addr,
    pub next_header: u8,
    pub hop_limit: u8,
    pub payload_length: u16,
}

impl Default for Ipv6Info {
    fn default() -> Self {
        Self {
            src_addr: Ipv6Addr::UNSPECIFIED,
            dst_addr: Ipv6Addr::UNSPECIFIED,
            next_header: 0,
            hop_limit: 64,
            payload_length: 0,
        }
    }
}

// ============================================================================
// Layer 4 - Transport
// ============================================================================

/// Layer 4 protocol variants
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Layer4 {
    Tcp(TcpInfo),
    Udp(UdpInfo),
    Icmp(IcmpInfo),
    /// Unknown or unsupported protocol
    Unknown { protocol: u8 },
}

impl Layer4 {
    /// Get source port (TCP/UDP only)
    pub fn src_port(&self) -> Option<u16> {
        match self {
            Layer4::Tcp(info) => Some(info.src_port),
            Layer4::Udp(info) => Some(info.src_port),
            _ => None,
        }
    }

    /// Get destination port (TCP/UDP only)
    pub fn dst_port(&self) -> Option<u16> {
        match self {
            Layer4::Tcp(info) => Some(info.dst_port),
            Layer4::Udp(info) => Some(info.dst_port),
            _ => None,
        }
    }

    /// Get TCP info if present
    pub fn as_tcp(&self) -> Option<&TcpInfo> {
        match self {
            Layer4::Tcp(info) => Some(info),
            _ => None,
        }
    }

    /// Get UDP info if present
    pub fn as_udp(&self) -> Option<&UdpInfo> {
        match self {
            Layer4::Udp(info) => Some(info),
            _ => None,
        }
    }

    /// Check if TCP
    pub fn is_tcp(&self) -> bool {
        matches!(self, Layer4::Tcp(_))
    }

    /// Check if UDP
    pub fn is_udp(&self) -> bool {
        matches!(self, Layer4::Udp(_))
    }

    /// Check if the transport layer carries ports
    pub fn has_ports(&self) -> bool {
        matches!(self, Layer4::Tcp(_) | Layer4::Udp(_))
    }

    /// Get payload reference
    pub fn payload(&self) -> &[u8] {
        match self {
            Layer4::Tcp(info) => &info.payload,
            Layer4::Udp(info) => &info.payload,
            Layer4::Icmp(info) => &info.payload,
            Layer4::Unknown { .. } => &[],
        }
    }
}

impl Default for Layer4 {
    fn default() -> Self {
        Layer4::Unknown { protocol: 0 }
    }
}

/// TCP segment information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpInfo {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub window: u16,
    pub payload: Vec<u8>,
}

impl Default for TcpInfo {
    fn default() -> Self {
        Self {
            src_port: 0,
            dst_port: 0,
            seq: 0,
            ack: 0,
            flags: TcpFlags::default(),
            window: 0,
            payload: Vec::new(),
        }
    }
}

/// UDP datagram information
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UdpInfo {
    pub src_port: u16,
    pub dst_port: u16,
    pub length: u16,
    pub payload: Vec<u8>,
}

/// ICMP (v4 or v6) message information
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IcmpInfo {
    pub icmp_type: u8,
    pub code: u8,
    pub payload: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layer3_accessors() {
        let ipv4 = Layer3::Ipv4(Ipv4Info {
            src_addr: Ipv4Addr::new(192, 168, 1, 1),
            dst_addr: Ipv4Addr::new(10, 0, 0, 1),
            protocol: 6,
            ttl: 64,
            ..Default::default()
        });

        assert!(ipv4.is_ipv4());
        assert!(!ipv4.is_ipv6());
        assert_eq!(ipv4.src_ip().to_string(), "192.168.1.1");
        assert_eq!(ipv4.dst_ip().to_string(), "10.0.0.1");
        assert_eq!(ipv4.protocol(), 6);
    }

    #[test]
    fn test_layer4_tcp() {
        let tcp = Layer4::Tcp(TcpInfo {
            src_port: 12345,
            dst_port: 443,
            ..Default::default()
        });

        assert!(tcp.is_tcp());
        assert!(!tcp.is_udp());
        assert!(tcp.has_ports());
        assert_eq!(tcp.src_port(), Some(12345));
        assert_eq!(tcp.dst_port(), Some(443));
    }

    #[test]
    fn test_layer4_unknown_has_no_ports() {
        let other = Layer4::Unknown { protocol: 47 };
        assert!(!other.has_ports());
        assert_eq!(other.src_port(), None);
        assert!(other.payload().is_empty());
    }
}
