use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use quorum_core::{SessionError, SessionId};

/// `POST /v1/keygen` body.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeygenBody {
    pub threshold: u16,
    pub total_parties: u16,
}

/// `POST /v1/sign` body. `keyShare` is base64, `message` is UTF-8 text.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignBody {
    pub parties: u16,
    pub key_share: String,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeygenResponse {
    pub session_id: SessionId,
    /// Lower-case hex.
    pub public_key: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignResponse {
    pub session_id: SessionId,
    pub r: String,
    pub s: String,
}

/// Error body: `{ success: false, error: { code, message } }`.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub success: bool,
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub code: &'static str,
    pub message: String,
}

pub const INVALID_REQUEST: &str = "INVALID_REQUEST";
pub const INVALID_PARAMETERS: &str = "INVALID_PARAMETERS";
pub const UNKNOWN_SESSION: &str = "UNKNOWN_SESSION";
pub const UNKNOWN_PARTY: &str = "UNKNOWN_PARTY";
pub const UNKNOWN_WORKER: &str = "UNKNOWN_WORKER";
pub const INSUFFICIENT_CAPACITY: &str = "INSUFFICIENT_CAPACITY";
pub const DELIVERY_FAILED: &str = "DELIVERY_FAILED";
pub const PROTOCOL_FAILED: &str = "PROTOCOL_FAILED";
pub const CANCELLED: &str = "CANCELLED";
pub const TIMEOUT: &str = "TIMEOUT";
pub const RESULT_MISMATCH: &str = "RESULT_MISMATCH";
pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";

/// Map a session error to its wire code.
pub fn error_code(err: &SessionError) -> &'static str {
    match err {
        SessionError::InvalidParameters(_) => INVALID_PARAMETERS,
        SessionError::InvalidEnvelope(_) => INVALID_REQUEST,
        SessionError::UnknownSession(_) => UNKNOWN_SESSION,
        SessionError::UnknownParty { .. } => UNKNOWN_PARTY,
        SessionError::UnknownWorker(_) => UNKNOWN_WORKER,
        SessionError::InsufficientCapacity { .. } | SessionError::Provisioning(_) => INSUFFICIENT_CAPACITY,
        SessionError::DeliveryFailed { .. } => DELIVERY_FAILED,
        SessionError::Engine { .. } => PROTOCOL_FAILED,
        SessionError::Cancelled => CANCELLED,
        SessionError::Timeout(_) => TIMEOUT,
        SessionError::ResultMismatch(_) => RESULT_MISMATCH,
        SessionError::DuplicateParty { .. } | SessionError::Internal(_) => INTERNAL_ERROR,
    }
}

fn status_for(code: &str) -> StatusCode {
    match code {
        INVALID_REQUEST | INVALID_PARAMETERS => StatusCode::BAD_REQUEST,
        UNKNOWN_SESSION | UNKNOWN_PARTY | UNKNOWN_WORKER => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Handler error; renders as [`ErrorBody`] with the status its code maps to.
#[derive(Debug)]
pub struct ApiError {
    pub code: &'static str,
    pub message: String,
}

impl ApiError {
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self {
            code: INVALID_REQUEST,
            message: message.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        status_for(self.code)
    }
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        Self {
            code: error_code(&err),
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorBody {
            success: false,
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (status, Json(body)).into_response()
    }
}
