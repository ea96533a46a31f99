//! Core data types shared by every layer: session identifiers and buffered
//! upstream messages (§3).

use std::time::Instant;

/// Opaque session identifier: 24 lowercase-alphanumeric characters, unique
/// within the process (§3, §4.4). Generation lives in `mudproxy-session`
/// (it needs an RNG and registry-collision awareness); this type is just
/// the shared `String` newtype both sides agree on.
pub type SessionId = String;

/// One chunk of upstream bytes captured while no client was attached.
#[derive(Debug, Clone)]
pub struct BufferedMessage {
    pub data: Vec<u8>,
    pub timestamp: Instant,
}

impl BufferedMessage {
    #[must_use]
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            timestamp: Instant::now(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// The real remote address of a client transport attachment (§3, §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientAddr {
    pub ip: std::net::IpAddr,
    pub port: u16,
}

impl ClientAddr {
    #[must_use]
    pub fn new(ip: std::net::IpAddr, port: u16) -> Self {
        Self { ip, port }
    }

    /// Strips an IPv4-mapped IPv6 prefix (`::ffff:a.b.c.d`) so comparisons
    /// and PROXY-protocol family selection see the real IPv4 address
    /// (§4.6 point 2, §9 supplements).
    #[must_use]
    pub fn normalized_ip(&self) -> std::net::IpAddr {
        match self.ip {
            std::net::IpAddr::V6(v6) => v6
                .to_ipv4_mapped()
                .map_or(self.ip, std::net::IpAddr::V4),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn strips_ipv4_mapped_prefix() {
        let mapped = Ipv6Addr::new(0, 0, 0, 0, 0, 0xffff, 0xc000, 0x0207); // ::ffff:192.0.2.7
        let addr = ClientAddr::new(mapped.into(), 4000);
        assert_eq!(addr.normalized_ip(), Ipv4Addr::new(192, 0, 2, 7));
    }

    #[test]
    fn leaves_plain_v4_and_v6_untouched() {
        let v4 = ClientAddr::new(Ipv4Addr::new(203, 0, 113, 7).into(), 1);
        assert_eq!(v4.normalized_ip(), v4.ip);

        let v6 = ClientAddr::new(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1).into(), 1);
        assert_eq!(v6.normalized_ip(), v6.ip);
    }
}
