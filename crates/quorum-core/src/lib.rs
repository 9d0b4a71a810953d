pub mod engine;
pub mod envelope;
pub mod errors;
pub mod ids;
pub mod party;
pub mod provision;
pub mod transport;
pub mod worker;

pub use engine::{
    EngineChannels, EngineFactory, InboundMessage, OutgoingMessage, OutgoingStream, ProtocolEngine,
    ProtocolKind, ProtocolOutput, ProtocolParams,
};
pub use envelope::MessageEnvelope;
pub use errors::{EngineFailure, SessionError, TransportError};
pub use ids::{PartyId, SessionId};
pub use party::{Party, PartySeed, PartySet};
pub use provision::Provisioner;
pub use transport::{InboundSink, Transport};
pub use worker::{WorkerState, WorkerUnit};
