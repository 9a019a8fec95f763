use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use metrics::counter;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use trimline_core::{
    BridgeEvent, ConnectedIdentity, CoreError, EventBridge, PairingArtifact, SessionSnapshot,
    SessionState,
};

use crate::pairing::{PairingCoordinator, PAIRING_TTL};
use crate::tracker::DeliveryTracker;
use crate::transport::{DeliveryHandle, SharedTransport, TransportEvent};

/// Upper bound on how long a caller can see `pairing` before the registry
/// surfaces an explicit timeout state. Must exceed [`PAIRING_TTL`] by enough
/// that at least two artifact refresh cycles fit inside the window.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(120);

/// How long a send waits for the transport's ack event.
const ACK_TIMEOUT: Duration = Duration::from_secs(15);

/// Snapshot of a tenant's session as reported to callers.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub connected: bool,
    pub status: SessionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity: Option<ConnectedIdentity>,
}

impl SessionStatus {
    fn absent() -> Self {
        Self {
            connected: false,
            status: SessionState::Absent,
            identity: None,
        }
    }
}

struct SessionBody {
    state: SessionState,
    identity: Option<ConnectedIdentity>,
    /// Bumped on every (re)connect so stale timeout tasks can recognize
    /// they lost the race.
    epoch: u64,
    pump: Option<JoinHandle<()>>,
    timeout: Option<JoinHandle<()>>,
}

impl SessionBody {
    fn new() -> Self {
        Self {
            state: SessionState::Absent,
            identity: None,
            epoch: 0,
            pump: None,
            timeout: None,
        }
    }

    fn status(&self) -> SessionStatus {
        SessionStatus {
            connected: self.state.is_connected(),
            status: self.state,
            identity: self.identity.clone(),
        }
    }

    fn abort_tasks(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        if let Some(timeout) = self.timeout.take() {
            timeout.abort();
        }
    }
}

struct TenantEntry {
    body: Mutex<SessionBody>,
}

impl TenantEntry {
    fn new() -> Self {
        Self {
            body: Mutex::new(SessionBody::new()),
        }
    }
}

/// Owner of every per-tenant session state machine.
///
/// All transitions for one tenant are serialized behind that tenant's mutex;
/// different tenants share nothing but the map itself.
pub struct SessionRegistry {
    transport: SharedTransport,
    bridge: Arc<EventBridge>,
    pairing: Arc<PairingCoordinator>,
    tracker: Arc<DeliveryTracker>,
    entries: DashMap<String, Arc<TenantEntry>>,
    connect_timeout: Duration,
}

impl SessionRegistry {
    pub fn new(transport: SharedTransport, bridge: Arc<EventBridge>) -> Self {
        Self::with_timeouts(transport, bridge, CONNECT_TIMEOUT, PAIRING_TTL)
    }

    pub fn with_connect_timeout(
        transport: SharedTransport,
        bridge: Arc<EventBridge>,
        connect_timeout: Duration,
    ) -> Self {
        Self::with_timeouts(transport, bridge, connect_timeout, PAIRING_TTL)
    }

    pub fn with_timeouts(
        transport: SharedTransport,
        bridge: Arc<EventBridge>,
        connect_timeout: Duration,
        pairing_ttl: Duration,
    ) -> Self {
        let pairing = Arc::new(PairingCoordinator::with_ttl(transport.clone(), pairing_ttl));
        Self {
            transport,
            bridge,
            pairing,
            tracker: Arc::new(DeliveryTracker::new()),
            entries: DashMap::new(),
            connect_timeout,
        }
    }

    /// Establishes (or resumes) the tenant's session. Safe to call
    /// repeatedly: a tenant already pairing or active just gets its current
    /// status back, and never a second adapter instance.
    pub async fn connect(self: &Arc<Self>, tenant: &str) -> Result<SessionStatus, CoreError> {
        let entry = self.entry(tenant);
        let mut body = entry.body.lock().await;
        if matches!(body.state, SessionState::Pairing | SessionState::Active) {
            debug!(tenant, state = body.state.as_str(), "connect is a no-op");
            return Ok(body.status());
        }

        let rx = self.transport.events(tenant).await;
        self.transport.start_session(tenant).await?;

        body.abort_tasks();
        body.state = SessionState::Pairing;
        body.identity = None;
        body.epoch += 1;
        let epoch = body.epoch;

        let registry = self.clone();
        let pump_tenant = tenant.to_string();
        body.pump = Some(tokio::spawn(async move {
            let mut rx = rx;
            while let Some(event) = rx.recv().await {
                registry.apply_event(&pump_tenant, event).await;
            }
        }));
        body.timeout = Some(self.arm_pairing_window(tenant, epoch));

        info!(tenant, "session pairing started");
        counter!("trimline_session_connects_total", "tenant" => tenant.to_string()).increment(1);
        self.bridge
            .persist_snapshot(SessionSnapshot::new(tenant, SessionState::Pairing, None));
        Ok(body.status())
    }

    /// Current status; `Absent` when the tenant has no registry entry.
    pub async fn status(&self, tenant: &str) -> SessionStatus {
        match self.entries.get(tenant).map(|e| e.value().clone()) {
            Some(entry) => entry.body.lock().await.status(),
            None => SessionStatus::absent(),
        }
    }

    /// Live pairing artifact, if the tenant is mid-pairing.
    pub fn current_pairing(&self, tenant: &str) -> Option<PairingArtifact> {
        self.pairing.current(tenant)
    }

    /// Terminates the session, keeping the registry entry in `Closed` so a
    /// later `connect` can re-pair.
    pub async fn disconnect(&self, tenant: &str) -> Result<SessionStatus, CoreError> {
        let Some(entry) = self.entries.get(tenant).map(|e| e.value().clone()) else {
            return Ok(SessionStatus::absent());
        };
        let mut body = entry.body.lock().await;
        if matches!(body.state, SessionState::Absent | SessionState::Closed) {
            return Ok(body.status());
        }
        // Adapter logout comes first. When it fails the pump and timers are
        // still armed and the state untouched, so the session keeps working
        // and the caller can retry.
        self.transport.logout(tenant).await?;
        body.abort_tasks();
        self.pairing.clear(tenant);
        body.state = SessionState::Closed;
        body.identity = None;
        info!(tenant, "session disconnected");
        self.bridge.publish_with_snapshot(
            tenant,
            BridgeEvent::Disconnected {
                reason: "manual disconnect".into(),
            },
            SessionSnapshot::new(tenant, SessionState::Closed, None),
        );
        Ok(body.status())
    }

    /// Tears the session down completely: adapter logout (credential
    /// invalidation) first, then entry removal. A following `connect` starts
    /// from scratch with a brand-new pairing artifact.
    pub async fn reset(&self, tenant: &str) -> Result<SessionStatus, CoreError> {
        if let Some(entry) = self.entries.get(tenant).map(|e| e.value().clone()) {
            let mut body = entry.body.lock().await;
            // Teardown must complete before any local state is touched; an
            // unreachable adapter leaves the session fully functional in its
            // prior state.
            self.transport.logout(tenant).await?;
            body.abort_tasks();
            self.pairing.clear(tenant);
            body.state = SessionState::Absent;
            body.identity = None;
            drop(body);
            self.entries.remove(tenant);
        } else {
            self.transport.logout(tenant).await?;
        }
        info!(tenant, "session reset");
        self.bridge.publish_with_snapshot(
            tenant,
            BridgeEvent::Disconnected {
                reason: "reset".into(),
            },
            SessionSnapshot::new(tenant, SessionState::Absent, None),
        );
        Ok(SessionStatus::absent())
    }

    /// Sends a text through the tenant's active session and waits for the
    /// transport's ack event.
    pub async fn send_and_confirm(
        &self,
        tenant: &str,
        recipient: &str,
        body: &str,
    ) -> Result<DeliveryHandle, CoreError> {
        let active = match self.entries.get(tenant).map(|e| e.value().clone()) {
            Some(entry) => entry.body.lock().await.state.is_connected(),
            None => false,
        };
        if !active {
            return Err(CoreError::NotPaired(tenant.to_string()));
        }
        let handle = self.transport.send_text(tenant, recipient, body).await?;
        self.tracker
            .wait(&handle, ACK_TIMEOUT)
            .await
            .map_err(CoreError::SendFailedTransient)?;
        Ok(handle)
    }

    /// Number of tenants currently `Active`, for the health endpoint.
    pub async fn active_count(&self) -> usize {
        let entries: Vec<_> = self.entries.iter().map(|e| e.value().clone()).collect();
        let mut count = 0;
        for entry in entries {
            if entry.body.lock().await.state.is_connected() {
                count += 1;
            }
        }
        count
    }

    fn entry(&self, tenant: &str) -> Arc<TenantEntry> {
        self.entries
            .entry(tenant.to_string())
            .or_insert_with(|| Arc::new(TenantEntry::new()))
            .clone()
    }

    fn arm_pairing_window(self: &Arc<Self>, tenant: &str, epoch: u64) -> JoinHandle<()> {
        let registry = self.clone();
        let tenant = tenant.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(registry.connect_timeout).await;
            registry.expire_pairing_window(&tenant, epoch).await;
        })
    }

    async fn expire_pairing_window(&self, tenant: &str, epoch: u64) {
        let Some(entry) = self.entries.get(tenant).map(|e| e.value().clone()) else {
            return;
        };
        let mut body = entry.body.lock().await;
        if body.epoch != epoch || body.state != SessionState::Pairing {
            return;
        }
        warn!(tenant, "pairing window elapsed without an opened session");
        body.state = SessionState::PairingTimedOut;
        self.pairing.clear(tenant);
        self.bridge.publish_with_snapshot(
            tenant,
            BridgeEvent::PairingTimeout,
            SessionSnapshot::new(tenant, SessionState::PairingTimedOut, None),
        );
    }

    async fn apply_event(self: &Arc<Self>, tenant: &str, event: TransportEvent) {
        match event {
            TransportEvent::MessageAck { handle } => self.tracker.resolve(&handle, Ok(())),
            TransportEvent::MessageFailed { handle, error } => {
                self.tracker.resolve(&handle, Err(error))
            }
            other => {
                let Some(entry) = self.entries.get(tenant).map(|e| e.value().clone()) else {
                    return;
                };
                self.apply_session_event(tenant, &entry, other).await;
            }
        }
    }

    async fn apply_session_event(
        self: &Arc<Self>,
        tenant: &str,
        entry: &Arc<TenantEntry>,
        event: TransportEvent,
    ) {
        let mut body = entry.body.lock().await;
        match event {
            TransportEvent::QrIssued { payload } => {
                if body.state != SessionState::Pairing {
                    debug!(tenant, state = body.state.as_str(), "ignoring stray qr");
                    return;
                }
                let artifact = self.pairing.store(tenant, payload);
                self.bridge.publish(tenant, BridgeEvent::Qr { artifact });
            }
            TransportEvent::Opened { identity } => {
                body.state = SessionState::Active;
                body.identity = Some(identity.clone());
                if let Some(timeout) = body.timeout.take() {
                    timeout.abort();
                }
                self.pairing.clear(tenant);
                info!(tenant, phone = %identity.phone, "session active");
                counter!("trimline_sessions_opened_total", "tenant" => tenant.to_string())
                    .increment(1);
                self.bridge.publish_with_snapshot(
                    tenant,
                    BridgeEvent::Ready {
                        identity: identity.clone(),
                    },
                    SessionSnapshot::new(tenant, SessionState::Active, Some(identity)),
                );
            }
            TransportEvent::Closed {
                reason,
                recoverable,
            } => {
                self.pairing.clear(tenant);
                if let Some(timeout) = body.timeout.take() {
                    timeout.abort();
                }
                let may_repair = recoverable
                    && body.state == SessionState::Active
                    && self.transport.has_credentials(tenant);
                body.identity = None;
                if may_repair {
                    match self.transport.start_session(tenant).await {
                        Ok(()) => {
                            body.state = SessionState::Pairing;
                            body.epoch += 1;
                            body.timeout = Some(self.arm_pairing_window(tenant, body.epoch));
                            info!(tenant, %reason, "session closed; re-pairing from stored credentials");
                        }
                        Err(err) => {
                            warn!(tenant, error = %err, "re-pair failed; session closed");
                            body.state = SessionState::Closed;
                        }
                    }
                } else {
                    body.state = SessionState::Closed;
                    info!(tenant, %reason, recoverable, "session closed");
                }
                counter!("trimline_sessions_closed_total", "tenant" => tenant.to_string())
                    .increment(1);
                let state = body.state;
                self.bridge.publish_with_snapshot(
                    tenant,
                    BridgeEvent::Disconnected { reason },
                    SessionSnapshot::new(tenant, state, None),
                );
            }
            TransportEvent::MessageAck { .. } | TransportEvent::MessageFailed { .. } => {
                unreachable!("delivery events are handled before the session lock")
            }
        }
    }
}
