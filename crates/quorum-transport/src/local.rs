use std::sync::Arc;

use async_trait::async_trait;

use quorum_core::{InboundSink, MessageEnvelope, PartyId, SessionError, Transport, TransportError};

/// In-process transport: every party lives in this process, so a call is a
/// direct deposit into the receiving side's inbound queue.
pub struct LocalTransport {
    sink: Arc<dyn InboundSink>,
}

impl LocalTransport {
    pub fn new(sink: Arc<dyn InboundSink>) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn call_party(
        &self,
        _address: &str,
        recipient: &PartyId,
        envelope: &MessageEnvelope,
    ) -> Result<(), TransportError> {
        self.sink
            .deposit(recipient, envelope.clone())
            .map_err(rejection)
    }
}

/// Map a receiving-side error to the status a remote worker would answer with.
pub(crate) fn rejection(err: SessionError) -> TransportError {
    let status = match &err {
        SessionError::UnknownSession(_) | SessionError::UnknownParty { .. } => 404,
        e if e.is_client_error() => 400,
        _ => 500,
    };
    TransportError::Rejected {
        status,
        body: err.to_string(),
    }
}
