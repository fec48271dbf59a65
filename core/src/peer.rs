//! Peer addresses as exchanged over the rendezvous channel and cached on disk

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PeerAddressError {
    #[error("Missing ':' separator in {0:?}")]
    MissingSeparator(String),
    #[error("Empty host in {0:?}")]
    EmptyHost(String),
    #[error("Invalid port in {0:?}")]
    InvalidPort(String),
}

/// A `host:port` pair identifying an overlay peer.
///
/// Equality is by value. Lists of addresses may carry duplicates; nothing
/// here deduplicates them.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerAddress {
    pub host: String,
    pub port: u16,
}

/// Ordered sequence of peer addresses, always written and read wholesale
pub type PeerList = Vec<PeerAddress>;

impl PeerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// The host as an IP address, if it is one
    pub fn ip(&self) -> Option<IpAddr> {
        self.host.parse().ok()
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for PeerAddress {
    type Err = PeerAddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| PeerAddressError::MissingSeparator(s.to_string()))?;

        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        if host.is_empty() {
            return Err(PeerAddressError::EmptyHost(s.to_string()));
        }

        let port = port
            .parse::<u16>()
            .map_err(|_| PeerAddressError::InvalidPort(s.to_string()))?;

        Ok(Self::new(host, port))
    }
}

impl From<std::net::SocketAddr> for PeerAddress {
    fn from(addr: std::net::SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

/// Parse whitespace-separated `host:port` entries, skipping anything malformed
pub fn parse_peer_entries<'a>(entries: impl IntoIterator<Item = &'a str>) -> PeerList {
    entries
        .into_iter()
        .filter_map(|entry| entry.parse().ok())
        .collect()
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ipv4() {
        let addr: PeerAddress = "203.0.113.9:51010".parse().unwrap();
        assert_eq!(addr.host, "203.0.113.9");
        assert_eq!(addr.port, 51010);
        assert!(addr.ip().is_some());
    }

    #[test]
    fn test_parse_hostname() {
        let addr: PeerAddress = "seed.example.net:50000".parse().unwrap();
        assert_eq!(addr.host, "seed.example.net");
        assert!(addr.ip().is_none());
    }

    #[test]
    fn test_ipv6_is_bracketed() {
        let addr = PeerAddress::new("2001:db8::1", 5000);
        assert_eq!(addr.to_string(), "[2001:db8::1]:5000");

        let parsed: PeerAddress = "[2001:db8::1]:5000".parse().unwrap();
        assert_eq!(parsed, addr);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(matches!(
            "no-separator".parse::<PeerAddress>(),
            Err(PeerAddressError::MissingSeparator(_))
        ));
        assert!(matches!(
            ":5000".parse::<PeerAddress>(),
            Err(PeerAddressError::EmptyHost(_))
        ));
        assert!(matches!(
            "10.0.0.1:port".parse::<PeerAddress>(),
            Err(PeerAddressError::InvalidPort(_))
        ));
        assert!(matches!(
            "10.0.0.1:70000".parse::<PeerAddress>(),
            Err(PeerAddressError::InvalidPort(_))
        ));
    }

    #[test]
    fn test_parse_peer_entries_keeps_order() {
        let peers = parse_peer_entries("a:1 junk b:2 c:x d:4".split_whitespace());
        assert_eq!(
            peers,
            vec![
                PeerAddress::new("a", 1),
                PeerAddress::new("b", 2),
                PeerAddress::new("d", 4),
            ]
        );
    }
}
