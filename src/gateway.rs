//! Outbound relay to the operator-configured webhook (n8n, WhatsApp bridge, ...).

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::error::ConsoleError;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryPayload {
    pub conversation_id: String,
    pub customer_address: String,
    pub body: String,
    pub sender_id: String,
    pub message_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeResult {
    pub ok: bool,
    pub status_code: Option<u16>,
    pub detail: String,
}

#[async_trait]
pub trait DeliveryGateway: Send + Sync {
    /// Any 2xx is accepted; other statuses and transport failures are `ConsoleError::Relay`.
    /// The response body is never interpreted.
    async fn deliver(&self, endpoint: &str, payload: &DeliveryPayload)
        -> Result<(), ConsoleError>;

    /// Sends a connection-test payload and reports the outcome.
    async fn probe(&self, endpoint: &str) -> ProbeResult;
}

pub struct WebhookGateway {
    client: reqwest::Client,
}

impl WebhookGateway {
    pub fn new(timeout: Option<Duration>) -> Result<Self, ConsoleError> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder
            .build()
            .map_err(|err| ConsoleError::Relay(format!("failed to build http client: {err}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl DeliveryGateway for WebhookGateway {
    async fn deliver(
        &self,
        endpoint: &str,
        payload: &DeliveryPayload,
    ) -> Result<(), ConsoleError> {
        let response = self
            .client
            .post(endpoint)
            .json(payload)
            .send()
            .await
            .map_err(|err| {
                warn!(message_id = %payload.message_id, error = %err, "webhook unreachable");
                ConsoleError::Relay(format!("webhook unreachable: {err}"))
            })?;

        let status = response.status();
        if status.is_success() {
            debug!(message_id = %payload.message_id, status = status.as_u16(), "webhook accepted message");
            return Ok(());
        }
        warn!(message_id = %payload.message_id, status = status.as_u16(), "webhook rejected message");
        Err(ConsoleError::Relay(format!("webhook responded with {status}")))
    }

    async fn probe(&self, endpoint: &str) -> ProbeResult {
        let payload = json!({
            "test": true,
            "timestamp": Utc::now().to_rfc3339(),
            "message": "Connection test from the agent console",
        });
        match self.client.post(endpoint).json(&payload).send().await {
            Ok(response) => {
                let status = response.status();
                ProbeResult {
                    ok: status.is_success(),
                    status_code: Some(status.as_u16()),
                    detail: status.to_string(),
                }
            }
            Err(err) => ProbeResult {
                ok: false,
                status_code: None,
                detail: err.to_string(),
            },
        }
    }
}
