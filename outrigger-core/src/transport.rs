//! Transport identification and socket handles.

use std::fmt;

use crate::endpoint::Endpoint;

/// The mode of a transport: message-oriented or byte-oriented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportMode {
    /// Connectionless, message-oriented delivery.
    Datagram,
    /// Connection-oriented, byte-stream delivery.
    Stream,
}

/// The addressing domain of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportDomain {
    Ipv4,
    Ipv6,
    Local,
}

/// Supported transports: the cross product of domain and mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    /// UDP over IPv4.
    Udp4,
    /// UDP over IPv6.
    Udp6,
    /// TCP over IPv4.
    Tcp4,
    /// TCP over IPv6.
    Tcp6,
    /// Datagram over a local (Unix domain) socket.
    LocalDatagram,
    /// Stream over a local (Unix domain) socket.
    LocalStream,
}

impl Transport {
    /// The delivery mode of this transport.
    #[must_use]
    pub const fn mode(&self) -> TransportMode {
        match self {
            Self::Udp4 | Self::Udp6 | Self::LocalDatagram => TransportMode::Datagram,
            Self::Tcp4 | Self::Tcp6 | Self::LocalStream => TransportMode::Stream,
        }
    }

    /// The addressing domain of this transport.
    #[must_use]
    pub const fn domain(&self) -> TransportDomain {
        match self {
            Self::Udp4 | Self::Tcp4 => TransportDomain::Ipv4,
            Self::Udp6 | Self::Tcp6 => TransportDomain::Ipv6,
            Self::LocalDatagram | Self::LocalStream => TransportDomain::Local,
        }
    }

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Udp4 => "udp4",
            Self::Udp6 => "udp6",
            Self::Tcp4 => "tcp4",
            Self::Tcp6 => "tcp6",
            Self::LocalDatagram => "local-datagram",
            Self::LocalStream => "local-stream",
        }
    }

    /// Check whether `endpoint` is addressable by this transport.
    #[must_use]
    pub fn accepts(&self, endpoint: &Endpoint) -> bool {
        match self.domain() {
            TransportDomain::Ipv4 => {
                matches!(endpoint, Endpoint::Ip(addr) if addr.is_ipv4())
            }
            TransportDomain::Ipv6 => {
                matches!(endpoint, Endpoint::Ip(addr) if addr.is_ipv6())
            }
            TransportDomain::Local => endpoint.is_local(),
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An opaque socket identifier drawn from a per-machine pool.
///
/// Handles are reusable immediately on close; the pool assigns the
/// numerically smallest free value at or above [`Handle::BASE`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(u32);

impl Handle {
    /// The first value the pool hands out.
    pub const BASE: u32 = 3;

    /// Wrap a raw handle value.
    #[must_use]
    pub const fn from_raw(value: u32) -> Self {
        Self(value)
    }

    /// The raw handle value.
    #[must_use]
    pub const fn as_raw(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A caller-supplied identifier for cancelling a pending operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token(pub u64);

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The direction of a shutdown or flow-control operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Send,
    Receive,
    Both,
}

impl Direction {
    #[must_use]
    pub const fn includes_send(&self) -> bool {
        matches!(self, Self::Send | Self::Both)
    }

    #[must_use]
    pub const fn includes_receive(&self) -> bool {
        matches!(self, Self::Receive | Self::Both)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_mode() {
        assert_eq!(Transport::Udp4.mode(), TransportMode::Datagram);
        assert_eq!(Transport::Tcp6.mode(), TransportMode::Stream);
        assert_eq!(Transport::LocalStream.mode(), TransportMode::Stream);
    }

    #[test]
    fn test_transport_accepts() {
        let v4 = Endpoint::loopback_v4(0);
        let v6 = Endpoint::loopback_v6(0);
        assert!(Transport::Udp4.accepts(&v4));
        assert!(!Transport::Udp4.accepts(&v6));
        assert!(Transport::Tcp6.accepts(&v6));
    }

    #[test]
    fn test_handle_base() {
        assert_eq!(Handle::from_raw(Handle::BASE).as_raw(), 3);
    }

    #[test]
    fn test_direction() {
        assert!(Direction::Both.includes_send());
        assert!(Direction::Both.includes_receive());
        assert!(!Direction::Send.includes_receive());
    }
}
