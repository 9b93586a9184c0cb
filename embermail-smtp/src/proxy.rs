//! PROXY protocol version 1 (text) header decoding.
//!
//! Listeners sitting behind a load balancer receive the real client address
//! prefixed as a single text line before the SMTP greeting is sent. Only the
//! v1 textual format is supported; the decoder is removed from the pipeline
//! once the header has been consumed.

use std::net::{IpAddr, SocketAddr};

use thiserror::Error;

/// Maximum length of a PROXY v1 header, per spec: 107 bytes including the
/// trailing CRLF.
pub const MAX_HEADER_LEN: usize = 107;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProxyError {
    #[error("line does not start with the PROXY signature")]
    NotProxyLine,
    #[error("unsupported source family {0:?}")]
    UnsupportedFamily(String),
    #[error("malformed address field")]
    MalformedAddress,
    #[error("malformed port field")]
    MalformedPort,
    #[error("source port out of range")]
    PortOutOfRange,
    #[error("header exceeds {MAX_HEADER_LEN} bytes")]
    TooLong,
}

/// The peer address and port recovered from a PROXY protocol header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxiedPeer {
    pub source: SocketAddr,
    pub destination: SocketAddr,
}

/// Parses a single `PROXY TCP4|TCP6 <src> <dst> <srcport> <dstport>\r\n`
/// line. `line` must not include the trailing CRLF.
pub fn parse(line: &str) -> Result<ProxiedPeer, ProxyError> {
    if line.len() + 2 > MAX_HEADER_LEN {
        return Err(ProxyError::TooLong);
    }

    let mut tokens = line.split(' ');
    if tokens.next() != Some("PROXY") {
        return Err(ProxyError::NotProxyLine);
    }

    let family = tokens.next().ok_or(ProxyError::NotProxyLine)?;
    if family != "TCP4" && family != "TCP6" {
        return Err(ProxyError::UnsupportedFamily(family.to_string()));
    }

    let src_ip: IpAddr = tokens
        .next()
        .ok_or(ProxyError::MalformedAddress)?
        .parse()
        .map_err(|_| ProxyError::MalformedAddress)?;
    let dst_ip: IpAddr = tokens
        .next()
        .ok_or(ProxyError::MalformedAddress)?
        .parse()
        .map_err(|_| ProxyError::MalformedAddress)?;

    let src_port = parse_port(tokens.next().ok_or(ProxyError::MalformedPort)?)?;
    let dst_port = parse_port(tokens.next().ok_or(ProxyError::MalformedPort)?)?;

    if tokens.next().is_some() {
        return Err(ProxyError::NotProxyLine);
    }

    Ok(ProxiedPeer {
        source: SocketAddr::new(src_ip, src_port),
        destination: SocketAddr::new(dst_ip, dst_port),
    })
}

fn parse_port(raw: &str) -> Result<u16, ProxyError> {
    let port: u32 = raw.parse().map_err(|_| ProxyError::MalformedPort)?;
    if port == 0 || port > u32::from(u16::MAX) {
        return Err(ProxyError::PortOutOfRange);
    }
    Ok(port as u16)
}

/// Whether `addr` falls within one of the configured trusted CIDR blocks.
/// Connections whose raw TCP peer is not trusted must not have their PROXY
/// header honoured.
#[must_use]
pub fn is_trusted(addr: IpAddr, trusted: &[ipnet::IpNet]) -> bool {
    trusted.iter().any(|net| net.contains(&addr))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tcp4_header() {
        let peer = parse("PROXY TCP4 192.0.2.1 198.51.100.1 56324 25").unwrap();
        assert_eq!(peer.source, "192.0.2.1:56324".parse().unwrap());
        assert_eq!(peer.destination, "198.51.100.1:25".parse().unwrap());
    }

    #[test]
    fn parses_tcp6_header() {
        let peer = parse("PROXY TCP6 ::1 ::1 443 25").unwrap();
        assert_eq!(peer.source.port(), 443);
    }

    #[test]
    fn rejects_bad_signature() {
        assert_eq!(parse("HELLO TCP4 1.2.3.4 1.2.3.4 1 2"), Err(ProxyError::NotProxyLine));
    }

    #[test]
    fn rejects_zero_port() {
        assert_eq!(
            parse("PROXY TCP4 1.2.3.4 1.2.3.4 0 25"),
            Err(ProxyError::PortOutOfRange)
        );
    }

    #[test]
    fn rejects_unsupported_family() {
        assert!(matches!(
            parse("PROXY UNKNOWN 1.2.3.4 1.2.3.4 1 2"),
            Err(ProxyError::UnsupportedFamily(_))
        ));
    }

    #[test]
    fn trust_check_matches_cidr() {
        let trusted: Vec<ipnet::IpNet> = vec!["10.0.0.0/8".parse().unwrap()];
        assert!(is_trusted("10.1.2.3".parse().unwrap(), &trusted));
        assert!(!is_trusted("11.1.2.3".parse().unwrap(), &trusted));
    }
}
