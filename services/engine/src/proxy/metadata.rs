//! Connection metadata.

use std::net::{IpAddr, SocketAddr};

use switchyard_events::Network;
use switchyard_networking::normalize_hostname;

use crate::adapter::{Address, Destination};

/// What the router knows about one inbound connection. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnMetadata {
    pub network: Network,
    pub source: SocketAddr,
    /// Normalised destination hostname, when the client sent a name.
    pub host: Option<String>,
    /// Destination IP, when the client sent a literal address.
    pub dst_ip: Option<IpAddr>,
    pub dst_port: u16,
    pub process_name: Option<String>,
    pub inbound_tag: String,
}

impl ConnMetadata {
    pub fn new(
        source: SocketAddr,
        destination: &Destination,
        inbound_tag: impl Into<String>,
    ) -> Self {
        let (host, dst_ip) = match &destination.host {
            Address::Ip(ip) => (None, Some(*ip)),
            Address::Domain(domain) => (Some(normalize_hostname(domain)), None),
        };
        Self {
            network: Network::Tcp,
            source,
            host,
            dst_ip,
            dst_port: destination.port,
            process_name: None,
            inbound_tag: inbound_tag.into(),
        }
    }

    pub fn with_process_name(mut self, name: impl Into<String>) -> Self {
        self.process_name = Some(name.into());
        self
    }

    pub fn with_network(mut self, network: Network) -> Self {
        self.network = network;
        self
    }

    /// The destination to dial.
    pub fn destination(&self) -> Destination {
        let host = match (&self.host, self.dst_ip) {
            (Some(host), _) => Address::Domain(host.clone()),
            (None, Some(ip)) => Address::Ip(ip),
            (None, None) => Address::Domain(String::new()),
        };
        Destination::new(host, self.dst_port)
    }
}
