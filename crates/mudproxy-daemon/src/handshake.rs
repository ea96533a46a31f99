//! Handshake query parsing and client address extraction (`spec.md` §4.6).

use std::net::{IpAddr, SocketAddr};

use axum::http::HeaderMap;
use serde::Deserialize;

use mudproxy_core::ClientAddr;

/// Query parameters accepted on the `/ws` handshake URL. Unknown parameters
/// are ignored by the extractor itself.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HandshakeQuery {
    /// An existing session to reattach to, if present.
    #[serde(rename = "sessionId")]
    pub session_id: Option<String>,
    /// Per-session override for `persistence_timeout_ms`.
    #[serde(rename = "persistenceTimeout")]
    pub persistence_timeout: Option<u64>,
    /// Per-session override for `max_buffer_lines`.
    #[serde(rename = "maxBufferLines")]
    pub max_buffer_lines: Option<usize>,
}

/// Determines the real client address: `X-Forwarded-For`'s first entry (or
/// the transport peer IP if absent), with any `::ffff:`-mapped IPv4 prefix
/// stripped, and likewise for the port from `X-Forwarded-Port` (§4.6 point 2).
#[must_use]
pub fn extract_client_addr(headers: &HeaderMap, peer: SocketAddr) -> (IpAddr, u16) {
    let ip = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .and_then(|s| s.parse::<IpAddr>().ok())
        .unwrap_or_else(|| peer.ip());
    let ip = ClientAddr::new(ip, 0).normalized_ip();

    let port = headers
        .get("x-forwarded-port")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u16>().ok())
        .unwrap_or_else(|| peer.port());

    (ip, port)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn peer(ip: &str, port: u16) -> SocketAddr {
        SocketAddr::new(ip.parse().unwrap(), port)
    }

    #[test]
    fn falls_back_to_peer_address_when_headers_absent() {
        let headers = HeaderMap::new();
        let (ip, port) = extract_client_addr(&headers, peer("198.51.100.9", 4000));
        assert_eq!(ip, IpAddr::V4(Ipv4Addr::new(198, 51, 100, 9)));
        assert_eq!(port, 4000);
    }

    #[test]
    fn prefers_x_forwarded_for_first_entry() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "203.0.113.7, 10.0.0.1".parse().unwrap());
        headers.insert("x-forwarded-port", "54321".parse().unwrap());
        let (ip, port) = extract_client_addr(&headers, peer("10.0.0.1", 4000));
        assert_eq!(ip, IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7)));
        assert_eq!(port, 54321);
    }

    #[test]
    fn malformed_forwarded_for_falls_back_to_peer() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "not-an-ip".parse().unwrap());
        let (ip, _) = extract_client_addr(&headers, peer("198.51.100.9", 1));
        assert_eq!(ip, IpAddr::V4(Ipv4Addr::new(198, 51, 100, 9)));
    }
}
