use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use base64::prelude::{Engine as _, BASE64_STANDARD};
use bytes::Bytes;
use serde_json::{json, Value};
use tracing::debug;

use quorum_coordinator::{SessionInfo, SignRequest};
use quorum_core::{InboundSink, MessageEnvelope, PartyId, SessionId};
use quorum_telemetry::MetricsSnapshot;

use crate::api::{ApiError, KeygenBody, KeygenResponse, SignBody, SignResponse};
use crate::server::AppState;

fn body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    payload
        .map(|Json(value)| value)
        .map_err(|e| ApiError::invalid_request(e.body_text()))
}

/// `POST /v1/keygen`
pub async fn keygen(
    State(state): State<AppState>,
    payload: Result<Json<KeygenBody>, JsonRejection>,
) -> Result<Json<KeygenResponse>, ApiError> {
    let req = body(payload)?;
    let result = state
        .orchestrator
        .keygen(req.threshold, req.total_parties)
        .await?;
    Ok(Json(KeygenResponse {
        session_id: result.session_id,
        public_key: hex::encode(&result.public_key),
    }))
}

/// `POST /v1/sign`
pub async fn sign(
    State(state): State<AppState>,
    payload: Result<Json<SignBody>, JsonRejection>,
) -> Result<Json<SignResponse>, ApiError> {
    let req = body(payload)?;
    let key_share = BASE64_STANDARD
        .decode(req.key_share.as_bytes())
        .map_err(|e| ApiError::invalid_request(format!("keyShare is not valid base64: {e}")))?;

    let result = state
        .orchestrator
        .sign(SignRequest {
            parties: req.parties,
            key_share: Bytes::from(key_share),
            message: Bytes::from(req.message),
        })
        .await?;
    Ok(Json(SignResponse {
        session_id: result.session_id,
        r: hex::encode(&result.r),
        s: hex::encode(&result.s),
    }))
}

/// `POST /v1/sessions/{session}/parties/{party}/messages`: inbound envelope
/// from a peer's transport.
pub async fn deliver_message(
    State(state): State<AppState>,
    Path((session, party)): Path<(String, String)>,
    payload: Result<Json<MessageEnvelope>, JsonRejection>,
) -> Result<StatusCode, ApiError> {
    let envelope = body(payload)?;
    if envelope.session_id().as_str() != session {
        return Err(ApiError::invalid_request(format!(
            "envelope session {} does not match path session {session}",
            envelope.session_id()
        )));
    }
    let recipient = PartyId::from_raw(party);
    if !envelope.is_broadcast() && envelope.recipient() != Some(&recipient) {
        return Err(ApiError::invalid_request(format!(
            "point-to-point envelope is not addressed to party {recipient}"
        )));
    }
    debug!(session_id = %session, party_id = %recipient, from = %envelope.from(), "inbound message");
    state.registry.deposit(&recipient, envelope)?;
    Ok(StatusCode::ACCEPTED)
}

/// `GET /v1/sessions`
pub async fn list_sessions(State(state): State<AppState>) -> Json<Vec<SessionInfo>> {
    Json(state.orchestrator.active_sessions())
}

/// `DELETE /v1/sessions/{id}`
pub async fn abort_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let session_id = SessionId::from_raw(id);
    state.orchestrator.abort(&session_id)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "sessionId": session_id, "aborted": true })),
    ))
}

/// `GET /v1/pool`
pub async fn pool_status(State(state): State<AppState>) -> Json<Value> {
    let pool = state.orchestrator.pool();
    Json(json!({
        "idle": pool.idle_count(),
        "inUse": pool.in_use_count(),
        "workers": pool.snapshot(),
    }))
}

/// `DELETE /v1/pool/{name}`: take a worker out of service and terminate it.
pub async fn retire_worker(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let unit = state.orchestrator.retire_worker(&name).await?;
    Ok(Json(json!({ "name": unit.name, "address": unit.address, "retired": true })))
}

/// `GET /metrics`
pub async fn metrics(State(state): State<AppState>) -> Json<MetricsSnapshot> {
    Json(
        state
            .metrics
            .as_ref()
            .map(|m| m.snapshot())
            .unwrap_or_default(),
    )
}

/// `GET /health`
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let pool = state.orchestrator.pool();
    let healthy = !pool.is_empty();
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(json!({
            "status": if healthy { "healthy" } else { "degraded" },
            "workers": pool.len(),
            "idleWorkers": pool.idle_count(),
            "activeSessions": state.orchestrator.active_sessions().len(),
            "uptimeSecs": state.started_at.elapsed().as_secs(),
        })),
    )
}
