#![deny(unsafe_code)]
#![deny(missing_docs)]

//! # Overview
//!
//! `mudproxy-net` dials the long-lived upstream connection that a session's
//! client traffic is bridged to: a scheme-tagged URL selects either a TLS
//! connection (certificate verification deliberately disabled, since the
//! upstream MUD server almost always presents a self-signed or expired
//! certificate) or a plain TCP connection, and an optional PROXY protocol
//! v1 header can be written ahead of the application bytes so the upstream
//! learns the real client address instead of the proxy's.
//!
//! # Design
//!
//! [`Upstream`] is a sum type over the two transports rather than a trait
//! object: `Tls(TlsStream<TcpStream>) | Plain(TcpStream)`. Both variants are
//! `Unpin`, so [`tokio::io::AsyncRead`]/[`tokio::io::AsyncWrite`] are
//! implemented by matching and delegating in `poll_read`/`poll_write`
//! rather than by boxing. Upstream "events" (data, close, error) are not a
//! separate callback surface: a `read()` returning `Ok(0)` is close, `Err`
//! is error, and anything else is data, which is the ordinary meaning of
//! `AsyncRead` and needs no extra plumbing.
//!
//! # Invariants
//!
//! - Certificate verification is unconditionally disabled for TLS
//!   upstreams; this crate must never be used to reach a server whose
//!   identity needs to be trusted.
//! - The PROXY protocol header, when requested, is written before any
//!   other byte crosses the wire (and before the TLS handshake, since the
//!   header operates at the TCP layer underneath TLS).
//! - `configure_keepalive` is applied to every connected socket regardless
//!   of scheme.

use std::io;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::{Arc, Once};
use std::task::{Context, Poll};
use std::time::Duration;

use rustls_pki_types::ServerName;
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

const DEFAULT_TLS_PORT: u16 = 7443;
const DEFAULT_PLAIN_PORT: u16 = 7777;
const KEEPALIVE_IDLE: Duration = Duration::from_secs(30);

/// Errors that can occur while parsing an upstream URL or dialing it.
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    /// The upstream URL used a scheme this proxy does not recognize.
    #[error("unknown upstream scheme {0:?}")]
    UnknownScheme(String),
    /// The upstream URL's host/port authority could not be parsed.
    #[error("malformed upstream url")]
    MalformedUrl,
    /// The host in the upstream URL is not a valid DNS name or IP address.
    #[error("invalid upstream host: {0}")]
    InvalidHost(#[from] rustls_pki_types::InvalidDnsNameError),
    /// Connecting the underlying TCP socket failed.
    #[error("connecting to upstream: {0}")]
    Connect(#[source] io::Error),
    /// Configuring TCP keep-alive on the upstream socket failed.
    #[error("configuring keepalive: {0}")]
    Keepalive(#[source] io::Error),
    /// Writing the PROXY protocol header failed.
    #[error("writing proxy protocol header: {0}")]
    ProxyProtocol(#[source] io::Error),
    /// The TLS handshake with the upstream failed.
    #[error("tls handshake: {0}")]
    Tls(#[source] io::Error),
}

/// Which transport an [`UpstreamAddr`] resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    /// Connect over TLS with certificate verification disabled.
    Tls,
    /// Connect over plain, unencrypted TCP.
    Plain,
}

/// A parsed upstream target: transport, host, and port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamAddr {
    /// Transport to use when dialing.
    pub scheme: Scheme,
    /// Hostname or IP literal to connect to.
    pub host: String,
    /// TCP port to connect to.
    pub port: u16,
}

impl UpstreamAddr {
    /// Parses an upstream URL of the form `scheme://host:port`.
    ///
    /// `tls`, `wss`, and `ssl` select [`Scheme::Tls`] with a default port of
    /// 7443; `tcp`, `ws`, and `telnet` select [`Scheme::Plain`] with a
    /// default port of 7777. A URL with no `scheme://` prefix is treated as
    /// TLS, matching the expectation that production MUD upstreams speak
    /// TLS by default.
    pub fn parse(raw: &str) -> Result<Self, NetError> {
        let (scheme_str, rest) = match raw.split_once("://") {
            Some((s, r)) => (Some(s), r),
            None => (None, raw),
        };
        let scheme = match scheme_str.map(str::to_ascii_lowercase).as_deref() {
            Some("tls" | "wss" | "ssl") | None => Scheme::Tls,
            Some("tcp" | "ws" | "telnet") => Scheme::Plain,
            Some(other) => return Err(NetError::UnknownScheme(other.to_string())),
        };
        let default_port = match scheme {
            Scheme::Tls => DEFAULT_TLS_PORT,
            Scheme::Plain => DEFAULT_PLAIN_PORT,
        };
        let (host, port) = split_host_port(rest, default_port)?;
        Ok(Self { scheme, host, port })
    }
}

fn split_host_port(s: &str, default_port: u16) -> Result<(String, u16), NetError> {
    if let Some(rest) = s.strip_prefix('[') {
        let end = rest.find(']').ok_or(NetError::MalformedUrl)?;
        let host = rest[..end].to_string();
        let port = match rest[end + 1..].strip_prefix(':') {
            Some(p) => p.parse().map_err(|_| NetError::MalformedUrl)?,
            None => default_port,
        };
        return Ok((host, port));
    }
    match s.rsplit_once(':') {
        Some((host, port_str))
            if !port_str.is_empty() && port_str.bytes().all(|b| b.is_ascii_digit()) =>
        {
            let port = port_str.parse().map_err(|_| NetError::MalformedUrl)?;
            Ok((host.to_string(), port))
        }
        _ => Ok((s.to_string(), default_port)),
    }
}

/// The client address a PROXY protocol v1 header should attribute the
/// connection to.
#[derive(Debug, Clone, Copy)]
pub struct ProxySource {
    /// Real client IP, already stripped of any `::ffff:` IPv4-mapped prefix.
    pub ip: IpAddr,
    /// Real client port.
    pub port: u16,
}

/// An established upstream connection, either TLS or plain TCP.
#[derive(Debug)]
pub enum Upstream {
    /// TLS connection with certificate verification disabled.
    Tls(Box<TlsStream<TcpStream>>),
    /// Plain, unencrypted TCP connection.
    Plain(TcpStream),
}

impl AsyncRead for Upstream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Upstream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
            Upstream::Plain(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Upstream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Upstream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
            Upstream::Plain(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Upstream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
            Upstream::Plain(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Upstream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
            Upstream::Plain(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Dials `addr`, optionally announcing `proxy_source` via a PROXY protocol
/// v1 header before the TLS handshake (or before any bytes, for plain TCP).
pub async fn connect(
    addr: &UpstreamAddr,
    proxy_source: Option<ProxySource>,
) -> Result<Upstream, NetError> {
    debug!(host = %addr.host, port = addr.port, scheme = ?addr.scheme, "dialing upstream");
    let mut tcp = TcpStream::connect((addr.host.as_str(), addr.port))
        .await
        .map_err(|e| {
            warn!(host = %addr.host, port = addr.port, error = %e, "upstream connect failed");
            NetError::Connect(e)
        })?;
    configure_keepalive(&tcp)?;

    if let Some(source) = proxy_source {
        let local = tcp.local_addr().map_err(NetError::Connect)?;
        let header = build_proxy_protocol_header(source.ip, source.port, local.ip(), local.port());
        debug!(client_ip = %source.ip, client_port = source.port, "writing proxy protocol header");
        tcp.write_all(header.as_bytes())
            .await
            .map_err(NetError::ProxyProtocol)?;
    }

    match addr.scheme {
        Scheme::Tls => {
            let stream = connect_tls(tcp, &addr.host).await.map_err(|e| {
                warn!(host = %addr.host, error = %e, "upstream tls handshake failed");
                e
            })?;
            debug!(host = %addr.host, "upstream tls handshake complete");
            Ok(Upstream::Tls(Box::new(stream)))
        }
        Scheme::Plain => Ok(Upstream::Plain(tcp)),
    }
}

fn configure_keepalive(stream: &TcpStream) -> Result<(), NetError> {
    let keepalive = TcpKeepalive::new().with_time(KEEPALIVE_IDLE);
    SockRef::from(stream)
        .set_tcp_keepalive(&keepalive)
        .map_err(NetError::Keepalive)
}

/// Builds a PROXY protocol v1 header line. The family is `TCP6` iff the
/// textual form of `src_ip` contains a colon, matching the wire convention
/// rather than branching on `IpAddr`'s variant (callers are expected to
/// have already stripped any `::ffff:`-mapped IPv4 prefix).
fn build_proxy_protocol_header(src_ip: IpAddr, src_port: u16, dst_ip: IpAddr, dst_port: u16) -> String {
    let src_ip_str = src_ip.to_string();
    let family = if src_ip_str.contains(':') { "TCP6" } else { "TCP4" };
    format!(
        "PROXY {family} {src_ip_str} {dst_ip} {src_port} {dst_port}\r\n",
        dst_ip = dst_ip
    )
}

fn ensure_crypto_provider_installed() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

async fn connect_tls(tcp: TcpStream, host: &str) -> Result<TlsStream<TcpStream>, NetError> {
    ensure_crypto_provider_installed();
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| NetError::Tls(io::Error::new(io::ErrorKind::Other, e)))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoCertVerification))
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(config));
    let server_name = ServerName::try_from(host.to_string())?;
    connector
        .connect(server_name, tcp)
        .await
        .map_err(NetError::Tls)
}

/// A certificate verifier that accepts every presented chain.
///
/// Production MUD upstreams routinely present self-signed or expired
/// certificates; this proxy's trust boundary is the operator-configured
/// upstream URL, not the certificate chain, so verification is disabled
/// rather than worked around with a bespoke trust store.
#[derive(Debug)]
struct NoCertVerification;

impl rustls::client::danger::ServerCertVerifier for NoCertVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls_pki_types::CertificateDer<'_>,
        _intermediates: &[rustls_pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls_pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls_pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls_pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        use rustls::SignatureScheme::*;
        vec![
            RSA_PKCS1_SHA1,
            ECDSA_SHA1_Legacy,
            RSA_PKCS1_SHA256,
            ECDSA_NISTP256_SHA256,
            RSA_PKCS1_SHA384,
            ECDSA_NISTP384_SHA384,
            RSA_PKCS1_SHA512,
            ECDSA_NISTP521_SHA512,
            RSA_PSS_SHA256,
            RSA_PSS_SHA384,
            RSA_PSS_SHA512,
            ED25519,
            ED448,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tls_scheme_with_explicit_port() {
        let addr = UpstreamAddr::parse("tls://mud.example.org:7443").unwrap();
        assert_eq!(addr.scheme, Scheme::Tls);
        assert_eq!(addr.host, "mud.example.org");
        assert_eq!(addr.port, 7443);
    }

    #[test]
    fn parses_plain_scheme_aliases() {
        for scheme in ["tcp", "ws", "telnet"] {
            let addr = UpstreamAddr::parse(&format!("{scheme}://mud.example.org")).unwrap();
            assert_eq!(addr.scheme, Scheme::Plain);
            assert_eq!(addr.port, DEFAULT_PLAIN_PORT);
        }
    }

    #[test]
    fn parses_tls_scheme_aliases_with_default_port() {
        for scheme in ["tls", "wss", "ssl"] {
            let addr = UpstreamAddr::parse(&format!("{scheme}://mud.example.org")).unwrap();
            assert_eq!(addr.scheme, Scheme::Tls);
            assert_eq!(addr.port, DEFAULT_TLS_PORT);
        }
    }

    #[test]
    fn no_scheme_defaults_to_tls() {
        let addr = UpstreamAddr::parse("mud.example.org:7443").unwrap();
        assert_eq!(addr.scheme, Scheme::Tls);
        assert_eq!(addr.host, "mud.example.org");
        assert_eq!(addr.port, 7443);
    }

    #[test]
    fn no_scheme_no_port_uses_tls_default_port() {
        let addr = UpstreamAddr::parse("mud.example.org").unwrap();
        assert_eq!(addr.scheme, Scheme::Tls);
        assert_eq!(addr.port, DEFAULT_TLS_PORT);
    }

    #[test]
    fn unknown_scheme_is_rejected() {
        let err = UpstreamAddr::parse("ftp://mud.example.org").unwrap_err();
        assert!(matches!(err, NetError::UnknownScheme(s) if s == "ftp"));
    }

    #[test]
    fn bracketed_ipv6_host_with_port() {
        let addr = UpstreamAddr::parse("tcp://[2001:db8::1]:7777").unwrap();
        assert_eq!(addr.host, "2001:db8::1");
        assert_eq!(addr.port, 7777);
    }

    #[test]
    fn bracketed_ipv6_host_without_port_uses_default() {
        let addr = UpstreamAddr::parse("tls://[2001:db8::1]").unwrap();
        assert_eq!(addr.host, "2001:db8::1");
        assert_eq!(addr.port, DEFAULT_TLS_PORT);
    }

    #[test]
    fn proxy_protocol_header_uses_tcp4_for_dotted_addresses() {
        let header = build_proxy_protocol_header(
            "203.0.113.7".parse().unwrap(),
            54321,
            "198.51.100.9".parse().unwrap(),
            7443,
        );
        assert_eq!(header, "PROXY TCP4 203.0.113.7 198.51.100.9 54321 7443\r\n");
    }

    #[test]
    fn proxy_protocol_header_uses_tcp6_for_colon_addresses() {
        let header = build_proxy_protocol_header(
            "2001:db8::7".parse().unwrap(),
            54321,
            "2001:db8::9".parse().unwrap(),
            7443,
        );
        assert_eq!(header, "PROXY TCP6 2001:db8::7 2001:db8::9 54321 7443\r\n");
    }
}
