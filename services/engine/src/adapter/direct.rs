//! Direct outbound: connect to the destination itself.

use std::time::Duration;

use async_trait::async_trait;

use super::{dial_tcp, Address, AdapterError, BoxedStream, Destination, ProtocolAdapter};

pub(super) const KIND: &str = "direct";

#[derive(Debug, Clone)]
pub struct DirectAdapter {
    connect_timeout: Duration,
}

impl DirectAdapter {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl ProtocolAdapter for DirectAdapter {
    fn kind(&self) -> &'static str {
        KIND
    }

    async fn connect(&self, destination: &Destination) -> Result<BoxedStream, AdapterError> {
        let host = match &destination.host {
            Address::Ip(ip) => ip.to_string(),
            Address::Domain(domain) => domain.clone(),
        };
        let stream = dial_tcp(&host, destination.port, self.connect_timeout).await?;
        Ok(Box::new(stream))
    }
}
