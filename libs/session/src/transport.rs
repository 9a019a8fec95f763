use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use trimline_core::{ConnectedIdentity, CoreError};

/// Opaque per-send correlation handle returned by [`TransportAdapter::send_text`].
pub type DeliveryHandle = String;

/// Shared transport handle used across services.
pub type SharedTransport = Arc<dyn TransportAdapter>;

/// Event emitted on a tenant's transport stream. These events are the only
/// way the rest of the system learns about connection state and delivery
/// outcomes.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    QrIssued {
        payload: String,
    },
    Opened {
        identity: ConnectedIdentity,
    },
    Closed {
        reason: String,
        recoverable: bool,
    },
    MessageAck {
        handle: DeliveryHandle,
    },
    MessageFailed {
        handle: DeliveryHandle,
        error: String,
    },
}

/// Uniform contract over one concrete WhatsApp backend.
///
/// Implemented once per backend (hosted gateway, socket protocol, browser
/// session); the registry consumes all of them identically.
#[async_trait]
pub trait TransportAdapter: Send + Sync {
    /// (Re)creates the tenant's event stream. Called by the registry before
    /// [`start_session`](Self::start_session) so no event is lost.
    async fn events(&self, tenant: &str) -> mpsc::Receiver<TransportEvent>;

    /// Begins pairing, or resumes directly from persisted credentials when
    /// the backend still holds some. Idempotent.
    async fn start_session(&self, tenant: &str) -> Result<(), CoreError>;

    /// Fires a text send. Completion or failure surfaces asynchronously on
    /// the event stream, correlated by the returned handle.
    async fn send_text(
        &self,
        tenant: &str,
        recipient: &str,
        body: &str,
    ) -> Result<DeliveryHandle, CoreError>;

    /// Terminates the session and invalidates any persisted credential.
    async fn logout(&self, tenant: &str) -> Result<(), CoreError>;

    /// Whether the backend still holds a usable credential for the tenant.
    fn has_credentials(&self, tenant: &str) -> bool;
}
