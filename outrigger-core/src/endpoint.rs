//! Endpoint abstraction for transport-agnostic socket addressing.
//!
//! Provides unified addressing for IP (v4 and v6) and local (Unix domain)
//! transports with parsing support.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;

/// Transport endpoint address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// IPv4 or IPv6 host and port: `tcp://host:port`, `udp://host:port`
    Ip(SocketAddr),
    /// Local transport (Unix domain socket): `ipc:///path/to/socket`
    Local(PathBuf),
}

impl Endpoint {
    /// Parse an endpoint from a string.
    ///
    /// Supported formats:
    /// - `tcp://127.0.0.1:5555`
    /// - `udp://[::1]:5555` (IPv6)
    /// - `ipc:///tmp/socket.sock`
    ///
    /// The `tcp://` and `udp://` schemes are interchangeable; an endpoint
    /// carries no transport mode of its own.
    pub fn parse(s: &str) -> Result<Self, EndpointError> {
        s.parse()
    }

    /// An IPv4 loopback endpoint with the given port.
    #[must_use]
    pub const fn loopback_v4(port: u16) -> Self {
        Self::Ip(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port))
    }

    /// An IPv6 loopback endpoint with the given port.
    #[must_use]
    pub const fn loopback_v6(port: u16) -> Self {
        Self::Ip(SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), port))
    }

    /// An IPv4 any-address endpoint with the given port.
    #[must_use]
    pub const fn any_v4(port: u16) -> Self {
        Self::Ip(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port))
    }

    /// Returns true if this is an IP endpoint.
    #[must_use]
    pub const fn is_ip(&self) -> bool {
        matches!(self, Endpoint::Ip(_))
    }

    /// Returns true if this is a local endpoint.
    #[must_use]
    pub const fn is_local(&self) -> bool {
        matches!(self, Endpoint::Local(_))
    }

    /// Returns true if the host is the unspecified any-address.
    ///
    /// Local endpoints are never the any-address.
    #[must_use]
    pub fn is_any(&self) -> bool {
        match self {
            Endpoint::Ip(addr) => addr.ip().is_unspecified(),
            Endpoint::Local(_) => false,
        }
    }

    /// The port of an IP endpoint, or `None` for a local endpoint.
    #[must_use]
    pub fn port(&self) -> Option<u16> {
        match self {
            Endpoint::Ip(addr) => Some(addr.port()),
            Endpoint::Local(_) => None,
        }
    }

    /// A copy of this endpoint with the port replaced.
    ///
    /// Returns the endpoint unchanged when it has no port.
    #[must_use]
    pub fn with_port(&self, port: u16) -> Self {
        match self {
            Endpoint::Ip(addr) => Endpoint::Ip(SocketAddr::new(addr.ip(), port)),
            Endpoint::Local(path) => Endpoint::Local(path.clone()),
        }
    }

    /// The IP address of an IP endpoint.
    #[must_use]
    pub fn ip(&self) -> Option<IpAddr> {
        match self {
            Endpoint::Ip(addr) => Some(addr.ip()),
            Endpoint::Local(_) => None,
        }
    }
}

impl FromStr for Endpoint {
    type Err = EndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(addr) = s.strip_prefix("tcp://").or_else(|| s.strip_prefix("udp://")) {
            let socket_addr = addr
                .parse::<SocketAddr>()
                .map_err(|_| EndpointError::InvalidIpAddress(addr.to_string()))?;
            Ok(Endpoint::Ip(socket_addr))
        } else if let Some(path) = s.strip_prefix("ipc://") {
            if path.is_empty() {
                Err(EndpointError::InvalidLocalPath(
                    "ipc path cannot be empty".to_string(),
                ))
            } else {
                Ok(Endpoint::Local(PathBuf::from(path)))
            }
        } else {
            Err(EndpointError::InvalidScheme(s.to_string()))
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Ip(addr) => write!(f, "tcp://{}", addr),
            Endpoint::Local(path) => write!(f, "ipc://{}", path.display()),
        }
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Endpoint::Ip(addr)
    }
}

/// Errors that can occur when parsing or using endpoints.
#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    #[error("Invalid scheme in endpoint: {0} (expected tcp://, udp://, or ipc://)")]
    InvalidScheme(String),

    #[error("Invalid IP address: {0}")]
    InvalidIpAddress(String),

    #[error("Invalid local path: {0}")]
    InvalidLocalPath(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tcp_ipv4() {
        let endpoint = Endpoint::parse("tcp://127.0.0.1:5555").unwrap();
        assert!(matches!(endpoint, Endpoint::Ip(_)));
        assert_eq!(endpoint.to_string(), "tcp://127.0.0.1:5555");
    }

    #[test]
    fn test_parse_udp_ipv6() {
        let endpoint = Endpoint::parse("udp://[::1]:5555").unwrap();
        assert!(matches!(endpoint, Endpoint::Ip(_)));
        assert_eq!(endpoint.port(), Some(5555));
    }

    #[test]
    fn test_parse_ipc() {
        let endpoint = Endpoint::parse("ipc:///tmp/test.sock").unwrap();
        assert!(matches!(endpoint, Endpoint::Local(_)));
        assert_eq!(endpoint.to_string(), "ipc:///tmp/test.sock");
    }

    #[test]
    fn test_invalid_scheme() {
        let result = Endpoint::parse("http://127.0.0.1:5555");
        assert!(matches!(result, Err(EndpointError::InvalidScheme(_))));
    }

    #[test]
    fn test_invalid_ip_address() {
        let result = Endpoint::parse("tcp://invalid:port");
        assert!(matches!(result, Err(EndpointError::InvalidIpAddress(_))));
    }

    #[test]
    fn test_any_address() {
        assert!(Endpoint::any_v4(0).is_any());
        assert!(!Endpoint::loopback_v4(0).is_any());
        assert!(!Endpoint::Local(PathBuf::from("/tmp/x.sock")).is_any());
    }

    #[test]
    fn test_with_port() {
        let endpoint = Endpoint::loopback_v4(0);
        assert_eq!(endpoint.with_port(49152).port(), Some(49152));
    }
}
