//! Packet parsing
//!
//! Decodes raw IP packets (no link layer, as delivered by the
//! netfilter queue) into the typed `Packet` representation using
//! etherparse. Decode failures are skippable by design: callers treat
//! any error as "not inspectable" and create no session state.

use etherparse::SlicedPacket;
use thiserror::Error;

use super::layers::{IcmpInfo, Ipv4Info, Ipv6Info, Layer3, Layer4, TcpInfo, UdpInfo};
use super::packet::{Packet, TcpFlags};

/// Why a raw buffer could not be decoded
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("empty packet")]
    Empty,

    #[error("unsupported IP version: {0}")]
    UnsupportedVersion(u8),

    #[error("no IP layer found in packet")]
    NoIpLayer,

    #[error("malformed packet: {0}")]
    Malformed(String),
}

/// Build Layer3 from an etherparse slice
fn build_layer3(sliced: &SlicedPacket<'_>) -> Option<Layer3> {
    match &sliced.net {
        Some(etherparse::NetSlice::Ipv4(ipv4)) => {
            let header = ipv4.header();
            Some(Layer3::Ipv4(Ipv4Info {
                src_addr: header.source_addr(),
                dst_addr: header.destination_addr(),
                protocol: header.protocol().0,
                ttl: header.ttl(),
                identification: header.identification(),
                total_length: header.total_len(),
            }))
        }
        Some(etherparse::NetSlice::Ipv6(ipv6)) => {
            let header = ipv6.header();
            Some(Layer3::Ipv6(Ipv6Info {
                src_addr: header.source_addr(),
                dst_addr: header.destination_addr(),
                next_header: header.next_header().0,
                hop_limit: header.hop_limit(),
                payload_length: header.payload_length(),
            }))
        }
        _ => None,
    }
}

/// Build Layer4 from an etherparse slice
fn build_layer4(sliced: &SlicedPacket<'_>, protocol: u8) -> Layer4 {
    match &sliced.transport {
        Some(etherparse::TransportSlice::Tcp(tcp)) => Layer4::Tcp(TcpInfo {
            src_port: tcp.source_port(),
            dst_port: tcp.destination_port(),
            seq: tcp.sequence_number(),
            ack: tcp.acknowledgment_number(),
            flags: TcpFlags {
                fin: tcp.fin(),
                syn: tcp.syn(),
                rst: tcp.rst(),
                psh: tcp.psh(),
                ack: tcp.ack(),
                urg: tcp.urg(),
            },
            window: tcp.window_size(),
            payload: tcp.payload().to_vec(),
        }),
        Some(etherparse::TransportSlice::Udp(udp)) => Layer4::Udp(UdpInfo {
            src_port: udp.source_port(),
            dst_port: udp.destination_port(),
            length: udp.length(),
            payload: udp.payload().to_vec(),
        }),
        Some(etherparse::TransportSlice::Icmpv4(icmp)) => {
            let bytes = icmp.slice();
            let (icmp_type, code) = if bytes.len() >= 2 { (bytes[0], bytes[1]) } else { (0, 0) };
            Layer4::Icmp(IcmpInfo {
                icmp_type,
                code,
                payload: icmp.payload().to_vec(),
            })
        }
        Some(etherparse::TransportSlice::Icmpv6(icmp)) => {
            let bytes = icmp.slice();
            let (icmp_type, code) = if bytes.len() >= 2 { (bytes[0], bytes[1]) } else { (0, 0) };
            Layer4::Icmp(IcmpInfo {
                icmp_type,
                code,
                payload: icmp.payload().to_vec(),
            })
        }
        _ => Layer4::Unknown { protocol },
    }
}

/// Parse a raw IP packet into a Packet
///
/// Payload bytes are copied out of the input buffer, so the caller may
/// reuse it as soon as this returns.
pub fn parse_ip_packet(data: &[u8]) -> Result<Packet, ParseError> {
    if data.is_empty() {
        return Err(ParseError::Empty);
    }

    let version = (data[0] >> 4) & 0x0f;
    if version != 4 && version != 6 {
        return Err(ParseError::UnsupportedVersion(version));
    }

    let sliced =
        SlicedPacket::from_ip(data).map_err(|err| ParseError::Malformed(err.to_string()))?;

    let layer3 = build_layer3(&sliced).ok_or(ParseError::NoIpLayer)?;
    let layer4 = build_layer4(&sliced, layer3.protocol());

    Ok(Packet::from_layers(layer3, layer4, data.to_vec()))
}
