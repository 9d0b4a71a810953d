use std::time::Duration;

use crate::ids::{PartyId, SessionId};

/// Failure of a single transport call to a peer party.
/// Classified so the router knows which failures are worth another attempt.
#[derive(Clone, Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("peer rejected message with status {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("call timed out after {0:?}")]
    Timeout(Duration),
    #[error("encoding error: {0}")]
    Encoding(String),
}

impl TransportError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connect(_) | Self::Timeout(_) => true,
            Self::Rejected { status, .. } => *status == 429 || (500..=599).contains(status),
            Self::Encoding(_) => false,
        }
    }

    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Connect(_) => "connect",
            Self::Rejected { .. } => "rejected",
            Self::Timeout(_) => "timeout",
            Self::Encoding(_) => "encoding",
        }
    }
}

/// Unrecoverable protocol failure reported by a cryptographic engine.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct EngineFailure {
    pub message: String,
    /// Parties the engine blames for the failure, if it could tell.
    pub culprits: Vec<PartyId>,
}

impl EngineFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            culprits: Vec::new(),
        }
    }

    pub fn with_culprits(mut self, culprits: Vec<PartyId>) -> Self {
        self.culprits = culprits;
        self
    }
}

/// Terminal error of a keygen or signing session, and of the components it drives.
#[derive(Clone, Debug, thiserror::Error)]
pub enum SessionError {
    // Caller input
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),
    #[error("invalid envelope: {0}")]
    InvalidEnvelope(String),

    // Capacity
    #[error("insufficient capacity: requested {requested} workers, {available} idle after waiting {waited:?}")]
    InsufficientCapacity {
        requested: usize,
        available: usize,
        waited: Duration,
    },
    #[error("provisioning failed: {0}")]
    Provisioning(String),
    #[error("unknown worker {0}")]
    UnknownWorker(String),

    // Registry misuse
    #[error("duplicate party {party_id} in session {session_id}")]
    DuplicateParty {
        session_id: SessionId,
        party_id: PartyId,
    },
    #[error("unknown party {party_id} in session {session_id}")]
    UnknownParty {
        session_id: SessionId,
        party_id: PartyId,
    },
    #[error("unknown session {0}")]
    UnknownSession(SessionId),

    // Protocol run
    #[error("delivery from {from} to {to} failed after {attempts} attempts: {source}")]
    DeliveryFailed {
        from: PartyId,
        to: PartyId,
        attempts: u32,
        source: TransportError,
    },
    #[error("engine failure at party {party_id}: {failure}")]
    Engine {
        party_id: PartyId,
        failure: EngineFailure,
    },
    #[error("session cancelled")]
    Cancelled,
    #[error("session timed out after {0:?}")]
    Timeout(Duration),
    #[error("parties disagree on session result: {0}")]
    ResultMismatch(String),

    #[error("{0}")]
    Internal(String),
}

impl SessionError {
    /// Errors caused by the request itself rather than by the system.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::InvalidParameters(_) | Self::InvalidEnvelope(_))
    }

    /// Cancellation observed as a consequence of some other failure or abort.
    /// Never preferred over a concrete cause when reporting a session result.
    pub fn is_derivative(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::InvalidParameters(_) => "invalid_parameters",
            Self::InvalidEnvelope(_) => "invalid_envelope",
            Self::InsufficientCapacity { .. } => "insufficient_capacity",
            Self::Provisioning(_) => "provisioning",
            Self::UnknownWorker(_) => "unknown_worker",
            Self::DuplicateParty { .. } => "duplicate_party",
            Self::UnknownParty { .. } => "unknown_party",
            Self::UnknownSession(_) => "unknown_session",
            Self::DeliveryFailed { .. } => "delivery_failed",
            Self::Engine { .. } => "engine",
            Self::Cancelled => "cancelled",
            Self::Timeout(_) => "timeout",
            Self::ResultMismatch(_) => "result_mismatch",
            Self::Internal(_) => "internal",
        }
    }
}
