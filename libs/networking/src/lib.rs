//! Networking helpers shared by the routing engine.
//!
//! This library provides:
//! - CIDR blocks for IPv4 and IPv6 (`IpCidr`)
//! - inclusive port ranges (`PortRange`)
//! - hostname normalisation and suffix matching
//! - private / loopback / link-local address classification

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Networking errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NetworkError {
    /// Invalid IP address.
    #[error("invalid IP address: {0}")]
    InvalidAddress(String),

    /// Invalid CIDR prefix.
    #[error("invalid CIDR prefix: {0}")]
    InvalidPrefix(String),

    /// Invalid port or port range.
    #[error("invalid port range: {0}")]
    InvalidPortRange(String),

    /// Empty or otherwise unusable hostname.
    #[error("invalid hostname: {0:?}")]
    InvalidHostname(String),
}

// ============================================================================
// CIDR blocks
// ============================================================================

/// An IPv4 or IPv6 network block.
///
/// The stored address is always masked to the prefix, so `10.1.2.3/8` and
/// `10.0.0.0/8` compare equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IpCidr {
    address: IpAddr,
    prefix_len: u8,
}

impl IpCidr {
    /// Create a new block, masking `address` to `prefix_len`.
    pub fn new(address: IpAddr, prefix_len: u8) -> Result<Self, NetworkError> {
        let max = max_prefix(&address);
        if prefix_len > max {
            return Err(NetworkError::InvalidPrefix(format!(
                "prefix length {} exceeds {}",
                prefix_len, max
            )));
        }

        Ok(Self {
            address: mask(address, prefix_len),
            prefix_len,
        })
    }

    /// A block holding exactly one address.
    pub fn host(address: IpAddr) -> Self {
        Self {
            address,
            prefix_len: max_prefix(&address),
        }
    }

    /// Parse from CIDR notation (`10.0.0.0/8`, `2001:db8::/32`).
    ///
    /// A bare address is accepted as a host block.
    pub fn from_cidr(s: &str) -> Result<Self, NetworkError> {
        let s = s.trim();
        let Some((addr_str, prefix_str)) = s.split_once('/') else {
            let address = IpAddr::from_str(s)
                .map_err(|_| NetworkError::InvalidAddress(s.to_string()))?;
            return Ok(Self::host(address));
        };

        let address = IpAddr::from_str(addr_str)
            .map_err(|_| NetworkError::InvalidAddress(addr_str.to_string()))?;

        let prefix_len = prefix_str
            .parse::<u8>()
            .map_err(|_| NetworkError::InvalidPrefix(prefix_str.to_string()))?;

        Self::new(address, prefix_len)
    }

    /// Network address of the block.
    pub fn address(&self) -> IpAddr {
        self.address
    }

    /// Prefix length in bits.
    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    /// Check if an address is within this block.
    ///
    /// Addresses of the other family never match, except IPv4-mapped IPv6
    /// addresses, which are compared as IPv4.
    pub fn contains(&self, addr: IpAddr) -> bool {
        let addr = match (self.address, addr) {
            (IpAddr::V4(_), IpAddr::V6(v6)) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(addr),
            _ => addr,
        };
        if addr.is_ipv4() != self.address.is_ipv4() {
            return false;
        }
        mask(addr, self.prefix_len) == self.address
    }
}

impl fmt::Display for IpCidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}

impl FromStr for IpCidr {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_cidr(s)
    }
}

impl Serialize for IpCidr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for IpCidr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

fn max_prefix(addr: &IpAddr) -> u8 {
    match addr {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}

/// Mask an address to a prefix length.
fn mask(addr: IpAddr, prefix_len: u8) -> IpAddr {
    match addr {
        IpAddr::V4(v4) => {
            let bits = u32::from(v4);
            let mask = if prefix_len == 0 {
                0
            } else {
                u32::MAX << (32 - u32::from(prefix_len.min(32)))
            };
            IpAddr::V4(Ipv4Addr::from(bits & mask))
        }
        IpAddr::V6(v6) => {
            let bits = u128::from_be_bytes(v6.octets());
            let mask = if prefix_len == 0 {
                0
            } else {
                u128::MAX << (128 - u32::from(prefix_len.min(128)))
            };
            IpAddr::V6(Ipv6Addr::from((bits & mask).to_be_bytes()))
        }
    }
}

// ============================================================================
// Address classification
// ============================================================================

/// Whether an address belongs to a private, loopback, link-local or
/// otherwise non-routable local range.
pub fn is_private(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => {
            v4.is_private()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
                // 100.64.0.0/10 carrier-grade NAT
                || (v4.octets()[0] == 100 && (v4.octets()[1] & 0xc0) == 64)
        }
        IpAddr::V6(v6) => {
            if let Some(v4) = v6.to_ipv4_mapped() {
                return is_private(IpAddr::V4(v4));
            }
            let first = v6.segments()[0];
            v6.is_loopback()
                || v6.is_unspecified()
                // fc00::/7 unique local
                || (first & 0xfe00) == 0xfc00
                // fe80::/10 link-local
                || (first & 0xffc0) == 0xfe80
        }
    }
}

// ============================================================================
// Ports
// ============================================================================

/// Inclusive port range. A single port is a range of length one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortRange {
    start: u16,
    end: u16,
}

impl PortRange {
    /// Create a range; `start` must not exceed `end`.
    pub fn new(start: u16, end: u16) -> Result<Self, NetworkError> {
        if start > end {
            return Err(NetworkError::InvalidPortRange(format!("{}-{}", start, end)));
        }
        Ok(Self { start, end })
    }

    /// A range matching exactly one port.
    pub fn single(port: u16) -> Self {
        Self {
            start: port,
            end: port,
        }
    }

    pub fn start(&self) -> u16 {
        self.start
    }

    pub fn end(&self) -> u16 {
        self.end
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

impl FromStr for PortRange {
    type Err = NetworkError;

    /// Accepts `443` or `8000-8080`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let parse = |p: &str| {
            p.trim()
                .parse::<u16>()
                .map_err(|_| NetworkError::InvalidPortRange(s.to_string()))
        };

        match s.split_once('-') {
            Some((start, end)) => Self::new(parse(start)?, parse(end)?),
            None => Ok(Self::single(parse(s)?)),
        }
    }
}

// ============================================================================
// Hostnames
// ============================================================================

/// Lowercase a hostname and strip a single trailing dot.
pub fn normalize_hostname(host: &str) -> String {
    let host = host.trim();
    let host = host.strip_suffix('.').unwrap_or(host);
    host.to_ascii_lowercase()
}

/// Normalise a domain-suffix pattern: leading dots are dropped so that
/// `.example.com` and `example.com` describe the same suffix.
pub fn normalize_suffix(suffix: &str) -> Result<String, NetworkError> {
    let normalized = normalize_hostname(suffix.trim().trim_start_matches('.'));
    if normalized.is_empty() {
        return Err(NetworkError::InvalidHostname(suffix.to_string()));
    }
    Ok(normalized)
}

/// Whether `host` equals `suffix` or is a subdomain of it.
///
/// Both arguments must already be normalised.
pub fn host_matches_suffix(host: &str, suffix: &str) -> bool {
    match host.strip_suffix(suffix) {
        Some("") => true,
        Some(rest) => rest.ends_with('.'),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    #[test]
    fn test_ipv4_cidr() {
        let cidr = IpCidr::from_cidr("10.1.2.3/8").unwrap();
        assert_eq!(cidr.prefix_len(), 8);
        assert_eq!(cidr.to_string(), "10.0.0.0/8");

        assert!(cidr.contains("10.200.0.1".parse().unwrap()));
        assert!(!cidr.contains("11.0.0.1".parse().unwrap()));
    }

    #[test]
    fn test_ipv6_cidr() {
        let cidr = IpCidr::from_cidr("2001:db8::/32").unwrap();
        assert!(cidr.contains("2001:db8::1".parse().unwrap()));
        assert!(!cidr.contains("2001:db9::1".parse().unwrap()));
        assert!(!cidr.contains("10.0.0.1".parse().unwrap()));
    }

    #[test]
    fn test_mapped_ipv4_matches_v4_block() {
        let cidr = IpCidr::from_cidr("192.168.0.0/16").unwrap();
        assert!(cidr.contains("::ffff:192.168.1.1".parse().unwrap()));
    }

    #[test]
    fn test_bare_address_is_host_block() {
        let cidr = IpCidr::from_cidr("1.2.3.4").unwrap();
        assert_eq!(cidr.prefix_len(), 32);
        assert!(cidr.contains("1.2.3.4".parse().unwrap()));
        assert!(!cidr.contains("1.2.3.5".parse().unwrap()));
    }

    #[test]
    fn test_zero_prefix_matches_family() {
        let cidr = IpCidr::from_cidr("0.0.0.0/0").unwrap();
        assert!(cidr.contains("8.8.8.8".parse().unwrap()));
        assert!(!cidr.contains("::1".parse().unwrap()));
    }

    #[rstest]
    #[case("10.0.0.0/33")]
    #[case("::/129")]
    #[case("10.0.0/8")]
    #[case("10.0.0.0/x")]
    #[case("")]
    fn test_invalid_cidr(#[case] input: &str) {
        assert!(IpCidr::from_cidr(input).is_err());
    }

    #[rstest]
    #[case("10.1.1.1", true)]
    #[case("172.16.5.4", true)]
    #[case("192.168.1.1", true)]
    #[case("127.0.0.1", true)]
    #[case("169.254.1.1", true)]
    #[case("100.64.0.1", true)]
    #[case("8.8.8.8", false)]
    #[case("::1", true)]
    #[case("fd00::1", true)]
    #[case("fe80::1", true)]
    #[case("2001:4860::8888", false)]
    fn test_is_private(#[case] addr: &str, #[case] expected: bool) {
        assert_eq!(is_private(addr.parse().unwrap()), expected);
    }

    #[test]
    fn test_port_range() {
        let range: PortRange = "8000-8080".parse().unwrap();
        assert!(range.contains(8000));
        assert!(range.contains(8080));
        assert!(!range.contains(8081));

        let single: PortRange = "443".parse().unwrap();
        assert!(single.contains(443));
        assert!(!single.contains(444));
        assert_eq!(single.to_string(), "443");

        assert!("9000-8000".parse::<PortRange>().is_err());
        assert!("70000".parse::<PortRange>().is_err());
    }

    #[rstest]
    #[case("a.example.com", "example.com", true)]
    #[case("example.com", "example.com", true)]
    #[case("badexample.com", "example.com", false)]
    #[case("example.com.evil", "example.com", false)]
    fn test_host_matches_suffix(#[case] host: &str, #[case] suffix: &str, #[case] expected: bool) {
        assert_eq!(host_matches_suffix(host, suffix), expected);
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize_hostname("WWW.Example.COM."), "www.example.com");
        assert_eq!(normalize_suffix(".Example.com").unwrap(), "example.com");
        assert!(normalize_suffix(".").is_err());
    }

    proptest! {
        #[test]
        fn prop_v4_block_contains_its_members(addr in any::<u32>(), len in 0u8..=32) {
            let ip = IpAddr::V4(Ipv4Addr::from(addr));
            let cidr = IpCidr::new(ip, len).unwrap();
            prop_assert!(cidr.contains(ip));
            prop_assert!(cidr.contains(cidr.address()));
        }

        #[test]
        fn prop_v6_block_contains_its_members(addr in any::<u128>(), len in 0u8..=128) {
            let ip = IpAddr::V6(Ipv6Addr::from(addr.to_be_bytes()));
            let cidr = IpCidr::new(ip, len).unwrap();
            prop_assert!(cidr.contains(ip));
        }
    }
}
