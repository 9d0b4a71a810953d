use async_trait::async_trait;

use crate::envelope::MessageEnvelope;
use crate::errors::{SessionError, TransportError};
use crate::ids::PartyId;

/// Network call layer used by the router to reach a peer party.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver `envelope` to `recipient`, hosted at `address`. Returns once the peer acked.
    async fn call_party(
        &self,
        address: &str,
        recipient: &PartyId,
        envelope: &MessageEnvelope,
    ) -> Result<(), TransportError>;
}

/// Receiving side: places a delivered envelope on the recipient's inbound queue.
pub trait InboundSink: Send + Sync {
    fn deposit(&self, recipient: &PartyId, envelope: MessageEnvelope) -> Result<(), SessionError>;
}
