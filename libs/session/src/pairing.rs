use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use trimline_core::PairingArtifact;

use crate::transport::SharedTransport;

/// How long a pairing artifact stays valid before a fresh one is requested.
pub const PAIRING_TTL: Duration = Duration::from_secs(45);

struct Slot {
    artifact: PairingArtifact,
    generation: u64,
    timer: JoinHandle<()>,
}

/// Owns the current pairing artifact per tenant and its expiry timer.
///
/// Expiry clears the artifact and asks the transport for a fresh one; it
/// never tears the session down. The timer is an owned task the registry can
/// cancel on any transition, not a self-rescheduling callback.
pub struct PairingCoordinator {
    ttl: Duration,
    transport: SharedTransport,
    slots: DashMap<String, Slot>,
    generations: AtomicU64,
}

impl PairingCoordinator {
    pub fn new(transport: SharedTransport) -> Self {
        Self::with_ttl(transport, PAIRING_TTL)
    }

    pub fn with_ttl(transport: SharedTransport, ttl: Duration) -> Self {
        Self {
            ttl,
            transport,
            slots: DashMap::new(),
            generations: AtomicU64::new(0),
        }
    }

    /// Stores a freshly issued artifact and arms its expiry timer, replacing
    /// any previous artifact for the tenant.
    pub fn store(self: &Arc<Self>, tenant: &str, payload: String) -> PairingArtifact {
        let artifact = PairingArtifact::new(payload);
        let generation = self.generations.fetch_add(1, Ordering::Relaxed) + 1;
        let timer = {
            let this = self.clone();
            let tenant = tenant.to_string();
            let ttl = self.ttl;
            tokio::spawn(async move {
                tokio::time::sleep(ttl).await;
                this.expire(&tenant, generation).await;
            })
        };
        if let Some(previous) = self.slots.insert(
            tenant.to_string(),
            Slot {
                artifact: artifact.clone(),
                generation,
                timer,
            },
        ) {
            previous.timer.abort();
        }
        artifact
    }

    /// Current artifact for UI polling, if one is live.
    pub fn current(&self, tenant: &str) -> Option<PairingArtifact> {
        self.slots.get(tenant).map(|slot| slot.artifact.clone())
    }

    /// Drops the artifact and cancels its timer. Called by the registry on
    /// open/close/reset transitions.
    pub fn clear(&self, tenant: &str) {
        if let Some((_, slot)) = self.slots.remove(tenant) {
            slot.timer.abort();
        }
    }

    async fn expire(&self, tenant: &str, generation: u64) {
        let expired = self
            .slots
            .remove_if(tenant, |_, slot| slot.generation == generation)
            .is_some();
        if !expired {
            return;
        }
        debug!(tenant, "pairing artifact expired; requesting a fresh one");
        // The slot only exists while the session is pairing, so a fresh
        // start_session is the re-request, not a reconnect.
        if let Err(err) = self.transport.start_session(tenant).await {
            warn!(tenant, error = %err, "failed to refresh pairing artifact");
        }
    }
}
