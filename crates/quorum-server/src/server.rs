use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::Router;
use tokio::sync::oneshot;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use quorum_coordinator::{PartyRegistry, SessionOrchestrator};
use quorum_telemetry::MetricsRecorder;

use crate::handlers;

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Covers a whole keygen or sign run, so keep it above the session timeout.
    pub request_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            request_timeout: Duration::from_secs(120),
        }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<SessionOrchestrator>,
    pub registry: Arc<PartyRegistry>,
    pub metrics: Option<Arc<MetricsRecorder>>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(orchestrator: Arc<SessionOrchestrator>, metrics: Option<Arc<MetricsRecorder>>) -> Self {
        let registry = Arc::clone(orchestrator.registry());
        Self {
            orchestrator,
            registry,
            metrics,
            started_at: Instant::now(),
        }
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState, request_timeout: Duration) -> Router {
    Router::new()
        .route("/v1/keygen", post(handlers::keygen))
        .route("/v1/sign", post(handlers::sign))
        .route("/v1/sessions", get(handlers::list_sessions))
        .route("/v1/sessions/{id}", delete(handlers::abort_session))
        .route(
            "/v1/sessions/{session}/parties/{party}/messages",
            post(handlers::deliver_message),
        )
        .route("/v1/pool", get(handlers::pool_status))
        .route("/v1/pool/{name}", delete(handlers::retire_worker))
        .route("/metrics", get(handlers::metrics))
        .route("/health", get(handlers::health))
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            request_timeout,
        ))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Bind and serve in the background. Returns a handle to shut it down.
pub async fn start(config: ServerConfig, state: AppState) -> Result<ServerHandle, std::io::Error> {
    let router = build_router(state, config.request_timeout);
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(addr = %local_addr, "quorum server started");

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await;
        if let Err(e) = result {
            tracing::error!(error = %e, "server exited with error");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        shutdown: Some(shutdown_tx),
        server,
    })
}

/// Handle returned by `start()`; keeps the server task alive.
pub struct ServerHandle {
    pub port: u16,
    shutdown: Option<oneshot::Sender<()>>,
    server: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    /// Stop accepting connections and wait for in-flight requests.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let _ = (&mut self.server).await;
        tracing::info!("quorum server stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quorum_coordinator::{MessageRouter, OrchestratorConfig, PoolConfig, RouterConfig, WorkerPool};
    use quorum_core::{Transport, WorkerUnit};
    use quorum_protocol::mock::MOCK_PUBLIC_KEY;
    use quorum_protocol::{MockBehavior, MockEngineFactory, SimulatedEngineFactory};
    use quorum_transport::{HttpTransport, HttpTransportConfig, LocalTransport};
    use serde_json::{json, Value};

    struct TestServer {
        handle: ServerHandle,
        pool: Arc<WorkerPool>,
        metrics: Arc<MetricsRecorder>,
    }

    impl TestServer {
        fn url(&self, path: &str) -> String {
            format!("http://127.0.0.1:{}{path}", self.handle.port)
        }
    }

    async fn serve(
        workers: usize,
        engines: Arc<dyn quorum_core::EngineFactory>,
        http_transport: bool,
    ) -> TestServer {
        let metrics = Arc::new(MetricsRecorder::new());
        let pool = Arc::new(WorkerPool::new(PoolConfig {
            allocate_timeout: Duration::from_millis(200),
        }));
        for i in 1..=workers {
            pool.add_existing(WorkerUnit::new(format!("party-{i}"), format!("127.0.0.1:{}", 9100 + i)));
        }
        let registry = Arc::new(PartyRegistry::new());
        let transport: Arc<dyn Transport> = if http_transport {
            Arc::new(HttpTransport::new(HttpTransportConfig::default()).unwrap())
        } else {
            Arc::new(LocalTransport::new(registry.clone()))
        };
        let router = Arc::new(MessageRouter::new(Arc::clone(&registry), transport, RouterConfig::default()));
        let orchestrator = Arc::new(
            SessionOrchestrator::new(
                Arc::clone(&pool),
                registry,
                router,
                engines,
                OrchestratorConfig {
                    session_timeout: Duration::from_secs(5),
                    ..Default::default()
                },
            )
            .with_metrics(Arc::clone(&metrics)),
        );

        let config = ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            ..Default::default()
        };
        let handle = start(config, AppState::new(orchestrator, Some(Arc::clone(&metrics))))
            .await
            .unwrap();
        TestServer { handle, pool, metrics }
    }

    #[tokio::test]
    async fn health_reports_pool() {
        let server = serve(3, Arc::new(MockEngineFactory::new()), false).await;
        let resp = reqwest::get(server.url("/health")).await.unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["idleWorkers"], 3);
    }

    #[tokio::test]
    async fn health_degraded_without_workers() {
        let server = serve(0, Arc::new(MockEngineFactory::new()), false).await;
        let resp = reqwest::get(server.url("/health")).await.unwrap();
        assert_eq!(resp.status(), 503);
    }

    #[tokio::test]
    async fn keygen_returns_hex_public_key() {
        let server = serve(3, Arc::new(MockEngineFactory::new()), false).await;
        let resp = reqwest::Client::new()
            .post(server.url("/v1/keygen"))
            .json(&json!({ "threshold": 2, "totalParties": 3 }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["publicKey"], hex::encode(MOCK_PUBLIC_KEY));
        assert!(body["sessionId"].as_str().unwrap().starts_with("sess"));
        assert_eq!(server.pool.idle_count(), 3);

        let metrics: Value = reqwest::get(server.url("/metrics")).await.unwrap().json().await.unwrap();
        let counters = metrics["counters"].as_array().unwrap();
        assert!(counters.iter().any(|c| c["name"] == "sessions.total"));
        assert_eq!(
            server
                .metrics
                .counter_get("sessions.total", &[("kind", "keygen"), ("outcome", "ok")]),
            1
        );
    }

    #[tokio::test]
    async fn bad_threshold_is_400() {
        let server = serve(3, Arc::new(MockEngineFactory::new()), false).await;
        let resp = reqwest::Client::new()
            .post(server.url("/v1/keygen"))
            .json(&json!({ "threshold": 3, "totalParties": 3 }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["success"], false);
        assert_eq!(body["error"]["code"], "INVALID_PARAMETERS");
    }

    #[tokio::test]
    async fn malformed_body_is_invalid_request() {
        let server = serve(3, Arc::new(MockEngineFactory::new()), false).await;
        let resp = reqwest::Client::new()
            .post(server.url("/v1/keygen"))
            .header("content-type", "application/json")
            .body("{\"threshold\": \"two\"}")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["error"]["code"], "INVALID_REQUEST");
    }

    #[tokio::test]
    async fn capacity_shortfall_is_500() {
        let server = serve(2, Arc::new(MockEngineFactory::new()), false).await;
        let resp = reqwest::Client::new()
            .post(server.url("/v1/keygen"))
            .json(&json!({ "threshold": 2, "totalParties": 3 }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 500);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["error"]["code"], "INSUFFICIENT_CAPACITY");
        assert_eq!(server.pool.idle_count(), 2);
    }

    #[tokio::test]
    async fn protocol_failure_is_500() {
        let engines = Arc::new(MockEngineFactory::new().with_party(1, MockBehavior::FailAfterRound));
        let server = serve(2, engines, false).await;
        let resp = reqwest::Client::new()
            .post(server.url("/v1/keygen"))
            .json(&json!({ "threshold": 1, "totalParties": 2 }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 500);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["error"]["code"], "PROTOCOL_FAILED");
    }

    #[tokio::test]
    async fn sign_decodes_key_share_and_hex_encodes_output() {
        let server = serve(3, Arc::new(SimulatedEngineFactory), false).await;
        let client = reqwest::Client::new();

        let bad = client
            .post(server.url("/v1/sign"))
            .json(&json!({ "parties": 3, "keyShare": "%%%", "message": "hi" }))
            .send()
            .await
            .unwrap();
        assert_eq!(bad.status(), 400);

        let resp = client
            .post(server.url("/v1/sign"))
            .json(&json!({ "parties": 3, "keyShare": "c2hhcmU=", "message": "hello" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["r"].as_str().unwrap().len(), 64);
        assert_eq!(body["s"].as_str().unwrap().len(), 64);
    }

    #[tokio::test]
    async fn unknown_session_lookups_are_404() {
        let server = serve(2, Arc::new(MockEngineFactory::new()), false).await;
        let client = reqwest::Client::new();

        let resp = client.delete(server.url("/v1/sessions/sess_missing")).send().await.unwrap();
        assert_eq!(resp.status(), 404);

        let envelope = json!({
            "sessionId": "sess_missing",
            "from": "party-1",
            "isBroadcast": true,
            "payload": "",
        });
        let resp = client
            .post(server.url("/v1/sessions/sess_missing/parties/party-2/messages"))
            .json(&envelope)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["error"]["code"], "UNKNOWN_SESSION");
    }

    #[tokio::test]
    async fn envelope_session_must_match_path() {
        let server = serve(2, Arc::new(MockEngineFactory::new()), false).await;
        let resp = reqwest::Client::new()
            .post(server.url("/v1/sessions/sess_a/parties/party-2/messages"))
            .json(&json!({ "sessionId": "sess_b", "from": "party-1", "isBroadcast": true, "payload": "" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
    }

    #[tokio::test]
    async fn direct_envelope_must_match_path_party() {
        let server = serve(2, Arc::new(MockEngineFactory::new()), false).await;
        let client = reqwest::Client::new();
        for to in [json!(["party-1"]), json!([])] {
            let resp = client
                .post(server.url("/v1/sessions/sess_a/parties/party-2/messages"))
                .json(&json!({ "sessionId": "sess_a", "from": "party-1", "to": to, "isBroadcast": false, "payload": "" }))
                .send()
                .await
                .unwrap();
            assert_eq!(resp.status(), 400);
            let body: Value = resp.json().await.unwrap();
            assert_eq!(body["error"]["code"], "INVALID_REQUEST");
        }
    }

    #[tokio::test]
    async fn retire_worker_over_http() {
        let server = serve(2, Arc::new(MockEngineFactory::new()), false).await;
        let client = reqwest::Client::new();

        let resp = client.delete(server.url("/v1/pool/party-1")).send().await.unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["retired"], true);
        assert_eq!(server.pool.len(), 1);

        let resp = client.delete(server.url("/v1/pool/party-1")).send().await.unwrap();
        assert_eq!(resp.status(), 404);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["error"]["code"], "UNKNOWN_WORKER");
    }

    #[tokio::test]
    async fn abort_over_http() {
        let server = serve(2, Arc::new(MockEngineFactory::all(MockBehavior::Hang)), false).await;
        let client = reqwest::Client::new();
        let keygen = {
            let client = client.clone();
            let url = server.url("/v1/keygen");
            tokio::spawn(async move {
                client
                    .post(url)
                    .json(&json!({ "threshold": 1, "totalParties": 2 }))
                    .send()
                    .await
                    .unwrap()
            })
        };

        let session_id = loop {
            let sessions: Value = client.get(server.url("/v1/sessions")).send().await.unwrap().json().await.unwrap();
            if let Some(id) = sessions.as_array().and_then(|s| s.first()).and_then(|s| s["sessionId"].as_str()) {
                break id.to_string();
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        };
        let resp = client
            .delete(server.url(&format!("/v1/sessions/{session_id}")))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 202);

        let resp = keygen.await.unwrap();
        assert_eq!(resp.status(), 500);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["error"]["code"], "CANCELLED");
    }

    #[tokio::test]
    async fn pool_endpoint_lists_workers() {
        let server = serve(2, Arc::new(MockEngineFactory::new()), false).await;
        let body: Value = reqwest::get(server.url("/v1/pool")).await.unwrap().json().await.unwrap();
        assert_eq!(body["idle"], 2);
        assert_eq!(body["inUse"], 0);
        assert_eq!(body["workers"][0]["state"], "idle");
    }

    #[tokio::test]
    async fn keygen_over_http_transport_loopback() {
        // Every worker address points back at this server's message endpoint.
        let server = serve(0, Arc::new(SimulatedEngineFactory), true).await;
        for i in 1..=3 {
            server.pool.add_existing(WorkerUnit::new(
                format!("party-{i}"),
                format!("127.0.0.1:{}", server.handle.port),
            ));
        }

        let resp = reqwest::Client::new()
            .post(server.url("/v1/keygen"))
            .json(&json!({ "threshold": 2, "totalParties": 3 }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["publicKey"].as_str().unwrap().len(), 66);
        assert_eq!(server.pool.idle_count(), 3);
    }

    #[tokio::test]
    async fn shutdown_stops_serving() {
        let server = serve(1, Arc::new(MockEngineFactory::new()), false).await;
        let url = server.url("/health");
        server.handle.shutdown().await;
        assert!(reqwest::get(url).await.is_err());
    }
}
