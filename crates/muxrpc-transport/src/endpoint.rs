use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::TransportError;

/// Where an RPC server listens or a client dials, written `<protocol>@<address>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// Plain TCP, e.g. `tcp@127.0.0.1:9000`.
    Tcp(String),
    /// Unix domain socket path, e.g. `unix@/tmp/muxrpc.sock`.
    Unix(PathBuf),
    /// TCP upgraded through `CONNECT`, e.g. `http@127.0.0.1:9000`.
    Http(String),
}

impl Endpoint {
    /// Parse a `<protocol>@<address>` string.
    pub fn parse(input: &str) -> Result<Self, TransportError> {
        let (protocol, address) = input
            .split_once('@')
            .ok_or_else(|| TransportError::InvalidEndpoint(input.to_string()))?;

        if address.is_empty() {
            return Err(TransportError::InvalidEndpoint(input.to_string()));
        }

        match protocol {
            "tcp" => Ok(Self::Tcp(address.to_string())),
            "unix" => Ok(Self::Unix(PathBuf::from(address))),
            "http" => Ok(Self::Http(address.to_string())),
            _ => Err(TransportError::InvalidEndpoint(input.to_string())),
        }
    }

    /// Protocol prefix used in the textual form.
    pub fn protocol(&self) -> &'static str {
        match self {
            Self::Tcp(_) => "tcp",
            Self::Unix(_) => "unix",
            Self::Http(_) => "http",
        }
    }

    /// Whether connections on this endpoint start with an HTTP CONNECT exchange.
    pub fn is_tunneled(&self) -> bool {
        matches!(self, Self::Http(_))
    }
}

impl FromStr for Endpoint {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(addr) | Self::Http(addr) => write!(f, "{}@{}", self.protocol(), addr),
            Self::Unix(path) => write!(f, "unix@{}", path.display()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_protocols() {
        assert_eq!(
            Endpoint::parse("tcp@127.0.0.1:9000").unwrap(),
            Endpoint::Tcp("127.0.0.1:9000".to_string())
        );
        assert_eq!(
            Endpoint::parse("unix@/tmp/x.sock").unwrap(),
            Endpoint::Unix(PathBuf::from("/tmp/x.sock"))
        );
        assert_eq!(
            Endpoint::parse("http@localhost:80").unwrap(),
            Endpoint::Http("localhost:80".to_string())
        );
    }

    #[test]
    fn rejects_missing_protocol_or_address() {
        assert!(matches!(
            Endpoint::parse("127.0.0.1:9000"),
            Err(TransportError::InvalidEndpoint(_))
        ));
        assert!(matches!(
            Endpoint::parse("tcp@"),
            Err(TransportError::InvalidEndpoint(_))
        ));
        assert!(matches!(
            Endpoint::parse("quic@host:1"),
            Err(TransportError::InvalidEndpoint(_))
        ));
    }

    #[test]
    fn display_roundtrips() {
        for input in ["tcp@h:1", "unix@/a/b.sock", "http@h:2"] {
            let endpoint: Endpoint = input.parse().unwrap();
            assert_eq!(endpoint.to_string(), input);
        }
        assert!(Endpoint::parse("http@h:2").unwrap().is_tunneled());
        assert!(!Endpoint::parse("tcp@h:2").unwrap().is_tunneled());
    }
}
