//! Bind and connect targets: a host (name or literal IP address) paired with
//! a port, plus the multicast-group queries the datagram endpoints need.

use std::fmt::{self, Display};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::lookup_host;

/// The target of a bind or connect: `host:port`, where the host may be a DNS
/// name or a literal IPv4/IPv6 address (IPv6 in the usual bracketed form,
/// `[::1]:8080`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    /// Build an endpoint from a host string and port.
    pub fn new(host: impl Into<String>, port: u16) -> Endpoint {
        Endpoint {
            host: host.into(),
            port,
        }
    }

    /// The host half: a DNS name or literal address, without brackets.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The port half.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// The host parsed as a literal IP address, if it is one.
    pub fn ip(&self) -> Option<IpAddr> {
        self.host.parse().ok()
    }

    /// True if the host is a literal multicast group address.
    pub fn is_multicast(&self) -> bool {
        self.ip().map(|ip| ip.is_multicast()).unwrap_or(false)
    }

    /// Resolve to socket addresses, trying the host as a literal address
    /// first and falling back to DNS.
    pub async fn resolve(&self) -> Result<impl Iterator<Item = SocketAddr> + use<'_>, io::Error> {
        lookup_host((self.host.as_str(), self.port)).await
    }

    /// Resolve to the first socket address, the one a listener binds to.
    pub async fn resolve_one(&self) -> Result<SocketAddr, io::Error> {
        self.resolve().await?.next().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("unknown host: {}", self.host),
            )
        })
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Endpoint {
        Endpoint {
            host: addr.ip().to_string(),
            port: addr.port(),
        }
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum InvalidEndpoint {
    #[error("missing `:port` in endpoint address")]
    MissingPort,
    #[error("missing host in endpoint address")]
    MissingHost,
    #[error("invalid port in endpoint address: {0}")]
    InvalidPort(String),
    #[error("unbalanced brackets in IPv6 endpoint address")]
    UnbalancedBrackets,
}

impl FromStr for Endpoint {
    type Err = InvalidEndpoint;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = if let Some(rest) = s.strip_prefix('[') {
            // Bracketed IPv6 literal: [host]:port
            let close = rest.find(']').ok_or(InvalidEndpoint::UnbalancedBrackets)?;
            let host = &rest[..close];
            let tail = &rest[close + 1..];
            let port = tail.strip_prefix(':').ok_or(InvalidEndpoint::MissingPort)?;
            (host, port)
        } else {
            let colon = s.rfind(':').ok_or(InvalidEndpoint::MissingPort)?;
            (&s[..colon], &s[colon + 1..])
        };

        if host.is_empty() {
            return Err(InvalidEndpoint::MissingHost);
        }
        let port = port
            .parse()
            .map_err(|_| InvalidEndpoint::InvalidPort(port.to_string()))?;

        Ok(Endpoint {
            host: host.to_string(),
            port,
        })
    }
}

impl Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

// Serialize as the display form, deserialize through FromStr, so endpoints
// embed in config files as plain `"host:port"` strings.
impl Serialize for Endpoint {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Endpoint {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_host_and_port() {
        let endpoint: Endpoint = "example.com:2611".parse().unwrap();
        assert_eq!(endpoint.host(), "example.com");
        assert_eq!(endpoint.port(), 2611);
        assert_eq!(endpoint.to_string(), "example.com:2611");
    }

    #[test]
    fn parses_bracketed_ipv6() {
        let endpoint: Endpoint = "[::1]:3333".parse().unwrap();
        assert_eq!(endpoint.host(), "::1");
        assert_eq!(endpoint.port(), 3333);
        assert_eq!(endpoint.to_string(), "[::1]:3333");
        assert_eq!(endpoint.ip(), Some("::1".parse().unwrap()));
    }

    #[test]
    fn rejects_missing_port() {
        assert!(matches!(
            "example.com".parse::<Endpoint>(),
            Err(InvalidEndpoint::MissingPort)
        ));
        assert!(matches!(
            "[::1]".parse::<Endpoint>(),
            Err(InvalidEndpoint::MissingPort)
        ));
    }

    #[test]
    fn rejects_bad_port() {
        assert!(matches!(
            "host:notaport".parse::<Endpoint>(),
            Err(InvalidEndpoint::InvalidPort(_))
        ));
        assert!(matches!(
            "host:70000".parse::<Endpoint>(),
            Err(InvalidEndpoint::InvalidPort(_))
        ));
    }

    #[test]
    fn multicast_groups_are_recognized() {
        let group: Endpoint = "239.255.0.1:3334".parse().unwrap();
        assert!(group.is_multicast());
        let host: Endpoint = "127.0.0.1:3334".parse().unwrap();
        assert!(!host.is_multicast());
    }
}
