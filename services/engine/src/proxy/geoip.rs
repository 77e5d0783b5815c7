//! GEOIP lookup.

use std::fmt;
use std::net::IpAddr;

use switchyard_networking::{is_private, IpCidr};

use crate::config::GeoIpEntry;

/// Country code matched by private, loopback and link-local addresses
/// without asking the resolver.
pub const LAN: &str = "LAN";

/// Maps an address to an upper-case country code.
pub trait GeoIpResolver: Send + Sync + fmt::Debug {
    fn lookup(&self, ip: IpAddr) -> Option<String>;
}

/// Resolver backed by an ordered CIDR table. The first containing block
/// wins.
#[derive(Debug, Clone, Default)]
pub struct StaticGeoIp {
    entries: Vec<(IpCidr, String)>,
}

impl StaticGeoIp {
    pub fn new(entries: &[GeoIpEntry]) -> Self {
        Self {
            entries: entries
                .iter()
                .map(|e| (e.cidr, e.country.to_ascii_uppercase()))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl GeoIpResolver for StaticGeoIp {
    fn lookup(&self, ip: IpAddr) -> Option<String> {
        self.entries
            .iter()
            .find(|(cidr, _)| cidr.contains(ip))
            .map(|(_, country)| country.clone())
    }
}

/// Whether `ip` belongs to `country` (already upper-case).
pub fn matches_country(resolver: &dyn GeoIpResolver, ip: IpAddr, country: &str) -> bool {
    if country == LAN {
        return is_private(ip);
    }
    resolver.lookup(ip).is_some_and(|code| code == country)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> StaticGeoIp {
        StaticGeoIp::new(&[
            GeoIpEntry {
                cidr: "1.0.1.0/24".parse().unwrap(),
                country: "cn".to_string(),
            },
            GeoIpEntry {
                cidr: "1.0.0.0/8".parse().unwrap(),
                country: "AU".to_string(),
            },
        ])
    }

    #[test]
    fn test_lookup_first_block_wins() {
        let geo = table();
        assert_eq!(geo.lookup("1.0.1.7".parse().unwrap()).as_deref(), Some("CN"));
        assert_eq!(geo.lookup("1.2.3.4".parse().unwrap()).as_deref(), Some("AU"));
        assert_eq!(geo.lookup("8.8.8.8".parse().unwrap()), None);
    }

    #[test]
    fn test_lan_skips_resolver() {
        let geo = StaticGeoIp::default();
        assert!(matches_country(&geo, "192.168.1.1".parse().unwrap(), LAN));
        assert!(matches_country(&geo, "::1".parse().unwrap(), LAN));
        assert!(!matches_country(&geo, "8.8.8.8".parse().unwrap(), LAN));
        assert!(!matches_country(&geo, "8.8.8.8".parse().unwrap(), "US"));
    }
}
