//! Transport over a hosted multi-tenant WhatsApp gateway (uazapi-style HTTP
//! API). Each tenant maps to one gateway instance addressed by its token.

use std::collections::HashMap;

use async_trait::async_trait;
use dashmap::DashMap;
use nanoid::nanoid;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::warn;
use trimline_core::{ConnectedIdentity, CoreError};

use crate::transport::{DeliveryHandle, TransportAdapter, TransportEvent};

const EVENT_CAPACITY: usize = 32;

pub struct HostedGatewayTransport {
    http: reqwest::Client,
    api_base: String,
    /// tenant -> gateway instance token.
    tokens: HashMap<String, String>,
    senders: DashMap<String, mpsc::Sender<TransportEvent>>,
}

#[derive(Debug, Deserialize)]
struct ConnectResponse {
    #[serde(default)]
    connected: bool,
    #[serde(default)]
    qrcode: Option<String>,
    #[serde(default)]
    paircode: Option<String>,
    #[serde(default)]
    phone: Option<String>,
}

impl HostedGatewayTransport {
    pub fn new(api_base: impl Into<String>, tokens: HashMap<String, String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_base: api_base.into(),
            tokens,
            senders: DashMap::new(),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{path}", self.api_base.trim_end_matches('/'))
    }

    fn token(&self, tenant: &str) -> Result<&str, CoreError> {
        self.tokens.get(tenant).map(String::as_str).ok_or_else(|| {
            CoreError::AdapterUnavailable(format!("no gateway instance token for tenant {tenant}"))
        })
    }

    async fn emit(&self, tenant: &str, event: TransportEvent) {
        if let Some(sender) = self.senders.get(tenant).map(|s| s.clone()) {
            let _ = sender.send(event).await;
        }
    }
}

#[async_trait]
impl TransportAdapter for HostedGatewayTransport {
    async fn events(&self, tenant: &str) -> mpsc::Receiver<TransportEvent> {
        let (tx, rx) = mpsc::channel(EVENT_CAPACITY);
        self.senders.insert(tenant.to_string(), tx);
        rx
    }

    async fn start_session(&self, tenant: &str) -> Result<(), CoreError> {
        let token = self.token(tenant)?;
        let response = self
            .http
            .post(self.endpoint("instance/connect"))
            .header("token", token)
            .json(&json!({}))
            .send()
            .await
            .map_err(|err| CoreError::AdapterUnavailable(err.to_string()))?;
        if !response.status().is_success() {
            return Err(CoreError::AdapterUnavailable(format!(
                "gateway connect returned {}",
                response.status()
            )));
        }
        let body: ConnectResponse = response
            .json()
            .await
            .map_err(|err| CoreError::AdapterUnavailable(err.to_string()))?;

        if body.connected {
            let phone = body.phone.unwrap_or_default();
            self.emit(
                tenant,
                TransportEvent::Opened {
                    identity: ConnectedIdentity::phone_only(phone),
                },
            )
            .await;
        } else if let Some(payload) = body.qrcode.or(body.paircode) {
            self.emit(tenant, TransportEvent::QrIssued { payload }).await;
        } else {
            warn!(tenant, "gateway connect returned neither state nor pairing artifact");
        }
        Ok(())
    }

    async fn send_text(
        &self,
        tenant: &str,
        recipient: &str,
        body: &str,
    ) -> Result<DeliveryHandle, CoreError> {
        let token = self.token(tenant)?;
        let handle: DeliveryHandle = nanoid!(12);
        let response = self
            .http
            .post(self.endpoint("send/text"))
            .header("token", token)
            .json(&json!({ "number": recipient, "text": body }))
            .send()
            .await
            .map_err(|err| CoreError::AdapterUnavailable(err.to_string()))?;

        if response.status().is_success() {
            self.emit(
                tenant,
                TransportEvent::MessageAck {
                    handle: handle.clone(),
                },
            )
            .await;
        } else {
            let status = response.status();
            let detail = response.text().await.unwrap_or_default();
            self.emit(
                tenant,
                TransportEvent::MessageFailed {
                    handle: handle.clone(),
                    error: format!("gateway send returned {status}: {detail}"),
                },
            )
            .await;
        }
        Ok(handle)
    }

    async fn logout(&self, tenant: &str) -> Result<(), CoreError> {
        let token = self.token(tenant)?;
        self.http
            .post(self.endpoint("instance/disconnect"))
            .header("token", token)
            .json(&json!({}))
            .send()
            .await
            .map_err(|err| CoreError::AdapterUnavailable(err.to_string()))?;
        Ok(())
    }

    fn has_credentials(&self, tenant: &str) -> bool {
        // Hosted instances authenticate with a standing token; holding one is
        // what "stored credential" means for this backend.
        self.tokens.contains_key(tenant)
    }
}
