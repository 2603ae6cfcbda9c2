//! Address type and host:port helpers

use std::net::{IpAddr, SocketAddr};

/// Network address representation
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    /// IP socket address (IP + port)
    Socket(SocketAddr),
    /// Domain name with port
    Domain(String, u16),
}

impl Address {
    /// Get the port
    pub fn port(&self) -> u16 {
        match self {
            Address::Socket(addr) => addr.port(),
            Address::Domain(_, port) => *port,
        }
    }

    /// Get the host part as string
    pub fn host(&self) -> String {
        match self {
            Address::Socket(addr) => addr.ip().to_string(),
            Address::Domain(domain, _) => domain.clone(),
        }
    }

    /// Check if this is a domain address
    pub fn is_domain(&self) -> bool {
        matches!(self, Address::Domain(_, _))
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Address::Socket(addr) => write!(f, "{}", addr),
            Address::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Address::Socket(addr)
    }
}

impl From<(IpAddr, u16)> for Address {
    fn from((ip, port): (IpAddr, u16)) -> Self {
        Address::Socket(SocketAddr::new(ip, port))
    }
}

/// Drop the port from a `host:port` string, if one is present.
///
/// The host may be a bracketed IPv6 address, which contains colons but
/// not necessarily a port.
pub fn strip_port(address: &str) -> &str {
    let port_idx = address.rfind(':');
    let ipv6_idx = address.rfind(']');
    match (port_idx, ipv6_idx) {
        (Some(p), Some(b)) if p > b => &address[..p],
        (Some(p), None) => &address[..p],
        _ => address,
    }
}

/// Append `:port` to an address that carries no port of its own.
pub fn ensure_port(address: &str, port: u16) -> String {
    if strip_port(address) == address {
        format!("{}:{}", address, port)
    } else {
        address.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_port_variants() {
        assert_eq!(strip_port("example.com:443"), "example.com");
        assert_eq!(strip_port("example.com"), "example.com");
        assert_eq!(strip_port("127.0.0.1:80"), "127.0.0.1");
        assert_eq!(strip_port("[::1]:80"), "[::1]");
        assert_eq!(strip_port("[::1]"), "[::1]");
    }

    #[test]
    fn ensure_port_defaults() {
        assert_eq!(ensure_port("example.com", 80), "example.com:80");
        assert_eq!(ensure_port("example.com:8080", 80), "example.com:8080");
        assert_eq!(ensure_port("[::1]", 80), "[::1]:80");
    }

    #[test]
    fn display() {
        let a = Address::Domain("example.com".into(), 443);
        assert_eq!(a.to_string(), "example.com:443");
        let a = Address::Socket("127.0.0.1:9000".parse().unwrap());
        assert_eq!(a.to_string(), "127.0.0.1:9000");
    }
}
