//! Connection tuple identity
//!
//! The canonical five-field identity of a flow: protocol plus the
//! client and server address/port pairs. The client side is the tuple
//! as observed on ingress; the server side (post-NAT) is learned from
//! the first conntrack NEW event.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};

use serde::{Deserialize, Serialize};

/// Five-field connection identity
///
/// Addresses are held by value, never borrowed from a capture buffer,
/// so entries stay valid after the kernel callback returns.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tuple {
    pub protocol: u8,
    pub client_addr: IpAddr,
    pub client_port: u16,
    pub server_addr: IpAddr,
    pub server_port: u16,
}

impl Default for Tuple {
    fn default() -> Self {
        Self {
            protocol: 0,
            client_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            client_port: 0,
            server_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            server_port: 0,
        }
    }
}

impl Tuple {
    /// Build a tuple from its parts
    pub fn new(
        protocol: u8,
        client_addr: IpAddr,
        client_port: u16,
        server_addr: IpAddr,
        server_port: u16,
    ) -> Self {
        Self {
            protocol,
            client_addr,
            client_port,
            server_addr,
            server_port,
        }
    }

    /// True once any field differs from the zero value
    pub fn is_set(&self) -> bool {
        *self != Tuple::default()
    }
}

impl fmt::Display for Tuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}:{}->{}:{}",
            self.protocol, self.client_addr, self.client_port, self.server_addr, self.server_port
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Tuple {
        Tuple::new(
            6,
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            5000,
            IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4)),
            443,
        )
    }

    #[test]
    fn test_equality_is_fieldwise() {
        let a = sample();
        let mut b = sample();
        assert_eq!(a, b);

        b.server_port = 8443;
        assert_ne!(a, b);
    }

    #[test]
    fn test_display() {
        assert_eq!(sample().to_string(), "6|10.0.0.1:5000->1.2.3.4:443");
    }

    #[test]
    fn test_zero_tuple_is_unset() {
        assert!(!Tuple::default().is_set());
        assert!(sample().is_set());
    }
}
