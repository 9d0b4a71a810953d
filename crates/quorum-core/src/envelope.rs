use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::errors::SessionError;
use crate::ids::{PartyId, SessionId};

/// A routed unit of protocol traffic. Immutable once constructed.
///
/// A broadcast envelope ignores `to` and fans out to every other party of the
/// session. A point-to-point envelope must name exactly one recipient.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "WireEnvelope", try_from = "WireEnvelope")]
pub struct MessageEnvelope {
    session_id: SessionId,
    from: PartyId,
    to: Vec<PartyId>,
    is_broadcast: bool,
    payload: Bytes,
}

impl MessageEnvelope {
    pub fn broadcast(session_id: SessionId, from: PartyId, payload: Bytes) -> Self {
        Self {
            session_id,
            from,
            to: Vec::new(),
            is_broadcast: true,
            payload,
        }
    }

    pub fn direct(session_id: SessionId, from: PartyId, to: PartyId, payload: Bytes) -> Self {
        Self {
            session_id,
            from,
            to: vec![to],
            is_broadcast: false,
            payload,
        }
    }

    /// Build from raw wire fields without checking them. Call [`validate`](Self::validate)
    /// before routing.
    pub fn from_parts(
        session_id: SessionId,
        from: PartyId,
        to: Vec<PartyId>,
        is_broadcast: bool,
        payload: Bytes,
    ) -> Self {
        Self {
            session_id,
            from,
            to,
            is_broadcast,
            payload,
        }
    }

    pub fn validate(&self) -> Result<(), SessionError> {
        if self.is_broadcast {
            return Ok(());
        }
        match self.to.as_slice() {
            [] => Err(SessionError::InvalidEnvelope(format!(
                "point-to-point message from {} has no recipient",
                self.from
            ))),
            [only] if only == &self.from => Err(SessionError::InvalidEnvelope(format!(
                "party {} addressed a message to itself",
                self.from
            ))),
            [_] => Ok(()),
            many => Err(SessionError::InvalidEnvelope(format!(
                "point-to-point message from {} names {} recipients",
                self.from,
                many.len()
            ))),
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn from(&self) -> &PartyId {
        &self.from
    }

    /// Recipient list as carried on the wire. Ignored for broadcasts.
    pub fn to(&self) -> &[PartyId] {
        &self.to
    }

    /// The single recipient of a valid point-to-point envelope.
    pub fn recipient(&self) -> Option<&PartyId> {
        if self.is_broadcast {
            None
        } else {
            self.to.first()
        }
    }

    pub fn is_broadcast(&self) -> bool {
        self.is_broadcast
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }
}

/// JSON wire form. The payload travels base64-encoded.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireEnvelope {
    session_id: SessionId,
    from: PartyId,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    to: Vec<PartyId>,
    is_broadcast: bool,
    payload: String,
}

impl From<MessageEnvelope> for WireEnvelope {
    fn from(env: MessageEnvelope) -> Self {
        Self {
            session_id: env.session_id,
            from: env.from,
            to: env.to,
            is_broadcast: env.is_broadcast,
            payload: STANDARD.encode(&env.payload),
        }
    }
}

impl TryFrom<WireEnvelope> for MessageEnvelope {
    type Error = String;

    fn try_from(wire: WireEnvelope) -> Result<Self, Self::Error> {
        let payload = STANDARD
            .decode(wire.payload.as_bytes())
            .map_err(|e| format!("payload is not valid base64: {e}"))?;
        Ok(Self {
            session_id: wire.session_id,
            from: wire.from,
            to: wire.to,
            is_broadcast: wire.is_broadcast,
            payload: Bytes::from(payload),
        })
    }
}
