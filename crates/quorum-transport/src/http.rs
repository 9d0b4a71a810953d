use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, instrument};

use quorum_core::{MessageEnvelope, PartyId, Transport, TransportError};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Clone, Debug)]
pub struct HttpTransportConfig {
    /// `http` or `https`.
    pub scheme: String,
    /// Whole-call timeout, including the peer's ack.
    pub call_timeout: Duration,
}

impl Default for HttpTransportConfig {
    fn default() -> Self {
        Self {
            scheme: "http".to_string(),
            call_timeout: Duration::from_secs(5),
        }
    }
}

/// Posts JSON envelopes to the message endpoint of remote workers.
pub struct HttpTransport {
    client: Client,
    config: HttpTransportConfig,
}

impl HttpTransport {
    pub fn new(config: HttpTransportConfig) -> Result<Self, TransportError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(config.call_timeout)
            .build()
            .map_err(|e| TransportError::Connect(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, config })
    }

    fn url(&self, address: &str, recipient: &PartyId, envelope: &MessageEnvelope) -> String {
        format!(
            "{}://{}{}",
            self.config.scheme,
            address,
            crate::message_path(envelope.session_id(), recipient)
        )
    }
}

#[async_trait]
impl Transport for HttpTransport {
    #[instrument(skip(self, envelope), fields(session_id = %envelope.session_id(), from = %envelope.from()))]
    async fn call_party(
        &self,
        address: &str,
        recipient: &PartyId,
        envelope: &MessageEnvelope,
    ) -> Result<(), TransportError> {
        let body = serde_json::to_vec(envelope).map_err(|e| TransportError::Encoding(e.to_string()))?;
        let url = self.url(address, recipient, envelope);

        let resp = self
            .client
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TransportError::Timeout(self.config.call_timeout)
                } else {
                    TransportError::Connect(e.to_string())
                }
            })?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(TransportError::Rejected { status, body });
        }

        debug!(%url, "envelope delivered");
        Ok(())
    }
}
