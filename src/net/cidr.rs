//! CIDR parsing and membership tests.
//!
//! Wraps the `ipnetwork` crate (already used elsewhere in this codebase for
//! service-discovery address filtering) to get correct IPv4/IPv6 parsing,
//! then flattens the result into a small fixed-size struct so `contains` is
//! a branch-free byte/bit compare with no further parsing on the hot path.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    V4,
    V6,
}

/// A normalized `address/prefix` network. `network_bytes` is always ANDed
/// with the prefix mask at construction time, so two `IpNetwork`s built from
/// equivalent CIDR strings (e.g. `10.0.0.1/24` and `10.0.0.0/24`) compare
/// equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpNetwork {
    family: Family,
    network_bytes: [u8; 16],
    prefix: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CidrParseError(pub String);

impl fmt::Display for CidrParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid CIDR: {}", self.0)
    }
}

impl std::error::Error for CidrParseError {}

impl IpNetwork {
    /// Parses `a.b.c.d`, `a.b.c.d/n`, `…::`, or `…::/n`. A missing prefix is
    /// a host route (`/32` for IPv4, `/128` for IPv6).
    pub fn parse(cidr: &str) -> Result<Self, CidrParseError> {
        let cidr = cidr.trim();

        if let Ok(net) = ipnetwork::IpNetwork::from_str(cidr) {
            return Ok(Self::from_ipnetwork(net));
        }

        if let Ok(ip) = cidr.parse::<IpAddr>() {
            return Ok(Self::host(ip));
        }

        Err(CidrParseError(cidr.to_string()))
    }

    pub fn host(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(v4) => Self::new_masked(Family::V4, to_v4_bytes(v4.octets()), 32),
            IpAddr::V6(v6) => Self::new_masked(Family::V6, v6.octets(), 128),
        }
    }

    fn from_ipnetwork(net: ipnetwork::IpNetwork) -> Self {
        match net {
            ipnetwork::IpNetwork::V4(v4) => {
                Self::new_masked(Family::V4, to_v4_bytes(v4.ip().octets()), v4.prefix())
            }
            ipnetwork::IpNetwork::V6(v6) => {
                Self::new_masked(Family::V6, v6.ip().octets(), v6.prefix())
            }
        }
    }

    fn new_masked(family: Family, bytes: [u8; 16], prefix: u8) -> Self {
        let max_prefix = match family {
            Family::V4 => 32,
            Family::V6 => 128,
        };
        let prefix = prefix.min(max_prefix);
        let masked = mask_bytes(bytes, prefix);
        Self {
            family,
            network_bytes: masked,
            prefix,
        }
    }

    pub fn family(&self) -> Family {
        self.family
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    /// `false` for cross-family comparisons (an IPv4 CIDR never contains an
    /// IPv6 address, even ::ffff:-mapped ones — no implicit mapping here).
    pub fn contains(&self, ip: IpAddr) -> bool {
        let (family, bytes) = match ip {
            IpAddr::V4(v4) => (Family::V4, to_v4_bytes(v4.octets())),
            IpAddr::V6(v6) => (Family::V6, v6.octets()),
        };
        if family != self.family {
            return false;
        }
        mask_bytes(bytes, self.prefix) == self.network_bytes
    }
}

impl fmt::Display for IpNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.family {
            Family::V4 => {
                let b = &self.network_bytes[0..4];
                write!(f, "{}.{}.{}.{}/{}", b[0], b[1], b[2], b[3], self.prefix)
            }
            Family::V6 => {
                let addr = std::net::Ipv6Addr::from(self.network_bytes);
                write!(f, "{}/{}", addr, self.prefix)
            }
        }
    }
}

/// Store IPv4 addresses left-aligned in the 16-byte buffer so prefix
/// arithmetic is family-agnostic.
fn to_v4_bytes(octets: [u8; 4]) -> [u8; 16] {
    let mut buf = [0u8; 16];
    buf[0..4].copy_from_slice(&octets);
    buf
}

fn mask_bytes(mut bytes: [u8; 16], prefix: u8) -> [u8; 16] {
    let full_bytes = (prefix / 8) as usize;
    let rem_bits = prefix % 8;
    for b in bytes.iter_mut().skip(full_bytes.min(16)) {
        *b = 0;
    }
    if full_bytes < 16 && rem_bits > 0 {
        let mask = 0xFFu8 << (8 - rem_bits);
        bytes[full_bytes] &= mask;
    }
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_v4_with_prefix() {
        let net = IpNetwork::parse("10.0.0.0/24").unwrap();
        assert_eq!(net.family(), Family::V4);
        assert_eq!(net.prefix(), 24);
    }

    #[test]
    fn missing_prefix_is_host_route_v4() {
        let net = IpNetwork::parse("1.2.3.4").unwrap();
        assert_eq!(net.prefix(), 32);
        assert!(net.contains("1.2.3.4".parse().unwrap()));
        assert!(!net.contains("1.2.3.5".parse().unwrap()));
    }

    #[test]
    fn missing_prefix_is_host_route_v6() {
        let net = IpNetwork::parse("::1").unwrap();
        assert_eq!(net.prefix(), 128);
        assert!(net.contains("::1".parse().unwrap()));
    }

    #[test]
    fn contains_normalizes_network_address() {
        let a = IpNetwork::parse("10.0.0.77/24").unwrap();
        let b = IpNetwork::parse("10.0.0.0/24").unwrap();
        assert_eq!(a, b);
        assert!(a.contains("10.0.0.250".parse().unwrap()));
        assert!(!a.contains("10.0.1.1".parse().unwrap()));
    }

    #[test]
    fn cross_family_never_matches() {
        let v4 = IpNetwork::parse("0.0.0.0/0").unwrap();
        assert!(!v4.contains("::1".parse().unwrap()));
    }

    #[test]
    fn v6_prefix_boundary() {
        let net = IpNetwork::parse("2001:db8::/32").unwrap();
        assert!(net.contains("2001:db8::1".parse().unwrap()));
        assert!(!net.contains("2001:db9::1".parse().unwrap()));
    }

    #[test]
    fn invalid_cidr_errors() {
        assert!(IpNetwork::parse("not-an-ip").is_err());
        assert!(IpNetwork::parse("1.2.3.4/99").is_err());
    }
}
