pub mod http;
pub mod local;

pub mod mock;

pub use http::{HttpTransport, HttpTransportConfig};
pub use local::LocalTransport;
pub use mock::MockTransport;

/// Path on a worker that accepts envelopes for one of its parties.
pub fn message_path(session_id: &quorum_core::SessionId, party_id: &quorum_core::PartyId) -> String {
    format!("/v1/sessions/{session_id}/parties/{party_id}/messages")
}
