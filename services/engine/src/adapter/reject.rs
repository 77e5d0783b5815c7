//! Reject outbound: refuses every connection.

use async_trait::async_trait;

use super::{AdapterError, BoxedStream, Destination, ProtocolAdapter};

pub(super) const KIND: &str = "reject";

#[derive(Debug, Clone, Copy, Default)]
pub struct RejectAdapter;

#[async_trait]
impl ProtocolAdapter for RejectAdapter {
    fn kind(&self) -> &'static str {
        KIND
    }

    async fn connect(&self, _destination: &Destination) -> Result<BoxedStream, AdapterError> {
        Err(AdapterError::Rejected)
    }
}
