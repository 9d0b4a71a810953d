use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use tokio::sync::oneshot;

use crate::errors::EngineFailure;
use crate::ids::{PartyId, SessionId};
use crate::party::{Party, PartySet};

/// Which protocol a session runs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProtocolKind {
    Keygen,
    Sign { key_share: Bytes, message: Bytes },
}

impl ProtocolKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Keygen => "keygen",
            Self::Sign { .. } => "sign",
        }
    }
}

/// Everything an engine needs to start one party's side of a protocol run.
#[derive(Clone, Debug)]
pub struct ProtocolParams {
    pub session_id: SessionId,
    pub kind: ProtocolKind,
    pub threshold: u16,
    pub parties: PartySet,
    pub local: Party,
}

/// Message produced by an engine, not yet wrapped in an envelope.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub to: Vec<PartyId>,
    pub is_broadcast: bool,
    pub payload: Bytes,
}

impl OutgoingMessage {
    pub fn broadcast(payload: impl Into<Bytes>) -> Self {
        Self {
            to: Vec::new(),
            is_broadcast: true,
            payload: payload.into(),
        }
    }

    pub fn direct(to: PartyId, payload: impl Into<Bytes>) -> Self {
        Self {
            to: vec![to],
            is_broadcast: false,
            payload: payload.into(),
        }
    }
}

/// Message handed to an engine after delivery.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundMessage {
    pub from: PartyId,
    pub is_broadcast: bool,
    pub payload: Bytes,
}

/// Final output of a successful protocol run. Every party must produce the same value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProtocolOutput {
    PublicKey(Bytes),
    Signature { r: Bytes, s: Bytes },
}

pub type OutgoingStream = Pin<Box<dyn Stream<Item = OutgoingMessage> + Send>>;

/// Channels returned by [`ProtocolEngine::start`].
pub struct EngineChannels {
    /// Ends when the engine has nothing more to send.
    pub outgoing: OutgoingStream,
    /// Resolves exactly once with the result. Dropping the sender counts as failure.
    pub completion: oneshot::Receiver<Result<ProtocolOutput, EngineFailure>>,
}

/// One party's instance of the external cryptographic protocol.
#[async_trait]
pub trait ProtocolEngine: Send + Sync {
    async fn start(&self, params: ProtocolParams) -> Result<EngineChannels, EngineFailure>;

    /// Feed one delivered message. An error is terminal for this party.
    async fn feed(&self, message: InboundMessage) -> Result<(), EngineFailure>;

    /// Release engine resources. Called once on every exit path.
    async fn shutdown(&self);
}

/// Creates a fresh engine per party per session.
pub trait EngineFactory: Send + Sync {
    fn create(&self, party: &Party) -> Arc<dyn ProtocolEngine>;
}
