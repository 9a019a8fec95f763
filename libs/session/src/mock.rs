use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use nanoid::nanoid;
use tokio::sync::{mpsc, Mutex};
use trimline_core::{ConnectedIdentity, CoreError};

use crate::transport::{DeliveryHandle, TransportAdapter, TransportEvent};

const EVENT_CAPACITY: usize = 32;

/// Record of one text accepted by the mock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentText {
    pub tenant: String,
    pub recipient: String,
    pub body: String,
}

/// Scriptable in-process transport used by tests and the `mock` backend.
///
/// On `start_session` it emits a fresh QR payload (`Q1`, `Q2`, …), or an
/// `Opened` event straight away when credentials were marked as stored.
/// Sends are acked automatically unless a failure budget is armed.
pub struct MockTransport {
    senders: DashMap<String, mpsc::Sender<TransportEvent>>,
    credentials: DashMap<String, bool>,
    qr_counter: AtomicU64,
    start_counter: DashMap<String, u64>,
    fail_sends: AtomicU32,
    fail_logout: AtomicBool,
    sent: Mutex<Vec<SentText>>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            senders: DashMap::new(),
            credentials: DashMap::new(),
            qr_counter: AtomicU64::new(0),
            start_counter: DashMap::new(),
            fail_sends: AtomicU32::new(0),
            fail_logout: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Injects an arbitrary event on the tenant's stream.
    pub async fn emit(&self, tenant: &str, event: TransportEvent) {
        if let Some(sender) = self.senders.get(tenant).map(|s| s.clone()) {
            let _ = sender.send(event).await;
        }
    }

    /// Marks whether the backend pretends to hold stored credentials.
    pub fn set_credentials(&self, tenant: &str, stored: bool) {
        self.credentials.insert(tenant.to_string(), stored);
    }

    /// Makes the next `count` sends fail with a transport-level error event.
    pub fn fail_next_sends(&self, count: u32) {
        self.fail_sends.store(count, Ordering::SeqCst);
    }

    /// Makes `logout` fail as if the backend were unreachable.
    pub fn set_logout_failure(&self, failing: bool) {
        self.fail_logout.store(failing, Ordering::SeqCst);
    }

    pub async fn sent(&self) -> Vec<SentText> {
        self.sent.lock().await.clone()
    }

    pub fn start_calls(&self, tenant: &str) -> u64 {
        self.start_counter.get(tenant).map(|c| *c).unwrap_or(0)
    }
}

#[async_trait]
impl TransportAdapter for MockTransport {
    async fn events(&self, tenant: &str) -> mpsc::Receiver<TransportEvent> {
        let (tx, rx) = mpsc::channel(EVENT_CAPACITY);
        self.senders.insert(tenant.to_string(), tx);
        rx
    }

    async fn start_session(&self, tenant: &str) -> Result<(), CoreError> {
        *self.start_counter.entry(tenant.to_string()).or_insert(0) += 1;
        if self.has_credentials(tenant) {
            self.emit(
                tenant,
                TransportEvent::Opened {
                    identity: ConnectedIdentity::phone_only("5511999990000"),
                },
            )
            .await;
        } else {
            let n = self.qr_counter.fetch_add(1, Ordering::SeqCst) + 1;
            self.emit(
                tenant,
                TransportEvent::QrIssued {
                    payload: format!("Q{n}"),
                },
            )
            .await;
        }
        Ok(())
    }

    async fn send_text(
        &self,
        tenant: &str,
        recipient: &str,
        body: &str,
    ) -> Result<DeliveryHandle, CoreError> {
        self.sent.lock().await.push(SentText {
            tenant: tenant.to_string(),
            recipient: recipient.to_string(),
            body: body.to_string(),
        });
        let handle = nanoid!(10);
        let failing = self
            .fail_sends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        let event = if failing {
            TransportEvent::MessageFailed {
                handle: handle.clone(),
                error: "simulated gateway failure".into(),
            }
        } else {
            TransportEvent::MessageAck {
                handle: handle.clone(),
            }
        };
        self.emit(tenant, event).await;
        Ok(handle)
    }

    async fn logout(&self, tenant: &str) -> Result<(), CoreError> {
        if self.fail_logout.load(Ordering::SeqCst) {
            return Err(CoreError::AdapterUnavailable(
                "simulated logout failure".into(),
            ));
        }
        self.credentials.insert(tenant.to_string(), false);
        Ok(())
    }

    fn has_credentials(&self, tenant: &str) -> bool {
        self.credentials.get(tenant).map(|v| *v).unwrap_or(false)
    }
}
