//! In-process event fan-out between the session registry, the dispatcher and
//! connected UI clients.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::warn;

use crate::types::{ConnectedIdentity, PairingArtifact, SessionSnapshot};

const CHANNEL_CAPACITY: usize = 64;

/// Event published on a tenant's channel. The wire names (`qr`, `ready`,
/// `disconnected`) match what the admin UI listens for.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BridgeEvent {
    Qr { artifact: PairingArtifact },
    Ready { identity: ConnectedIdentity },
    Disconnected { reason: String },
    PairingTimeout,
    MessageSent {
        delivery_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        correlation_id: Option<String>,
    },
    MessageFailed {
        delivery_id: String,
        error: String,
    },
}

/// Destination for durable per-tenant status snapshots.
///
/// Implemented by the external store; kept as a separate trait so the bridge
/// does not depend on any storage crate.
#[async_trait]
pub trait SnapshotSink: Send + Sync {
    async fn upsert(&self, snapshot: SessionSnapshot) -> anyhow::Result<()>;
}

/// Per-tenant broadcast hub.
///
/// Fan-out is fire-and-forget: a slow or absent subscriber never blocks the
/// publisher, and snapshot persistence runs on a spawned task off the
/// transition path.
pub struct EventBridge {
    channels: DashMap<String, broadcast::Sender<BridgeEvent>>,
    sink: Option<Arc<dyn SnapshotSink>>,
}

impl EventBridge {
    pub fn new(sink: Option<Arc<dyn SnapshotSink>>) -> Self {
        Self {
            channels: DashMap::new(),
            sink,
        }
    }

    /// Subscribes to a tenant's event stream, creating the channel on demand.
    pub fn subscribe(&self, tenant: &str) -> broadcast::Receiver<BridgeEvent> {
        self.sender(tenant).subscribe()
    }

    /// Publishes an event to any connected subscribers for `tenant`.
    pub fn publish(&self, tenant: &str, event: BridgeEvent) {
        // A send error only means nobody is listening right now.
        let _ = self.sender(tenant).send(event);
    }

    /// Publishes a lifecycle event and mirrors the session status into the
    /// external store without blocking the caller.
    pub fn publish_with_snapshot(&self, tenant: &str, event: BridgeEvent, snapshot: SessionSnapshot) {
        self.publish(tenant, event);
        self.persist_snapshot(snapshot);
    }

    /// Mirrors a session status into the external store on a spawned task.
    pub fn persist_snapshot(&self, snapshot: SessionSnapshot) {
        if let Some(sink) = self.sink.clone() {
            tokio::spawn(async move {
                if let Err(err) = sink.upsert(snapshot).await {
                    warn!(error = %err, "failed to persist session snapshot");
                }
            });
        }
    }

    fn sender(&self, tenant: &str) -> broadcast::Sender<BridgeEvent> {
        self.channels
            .entry(tenant.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SessionState;
    use tokio::sync::Mutex;

    struct RecordingSink {
        seen: Mutex<Vec<SessionSnapshot>>,
    }

    #[async_trait]
    impl SnapshotSink for RecordingSink {
        async fn upsert(&self, snapshot: SessionSnapshot) -> anyhow::Result<()> {
            self.seen.lock().await.push(snapshot);
            Ok(())
        }
    }

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let bridge = EventBridge::new(None);
        let mut rx = bridge.subscribe("shop-1");
        bridge.publish(
            "shop-1",
            BridgeEvent::Disconnected {
                reason: "test".into(),
            },
        );
        match rx.recv().await.unwrap() {
            BridgeEvent::Disconnected { reason } => assert_eq!(reason, "test"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn publish_without_subscribers_does_not_block() {
        let bridge = EventBridge::new(None);
        bridge.publish("nobody-home", BridgeEvent::PairingTimeout);
    }

    #[tokio::test]
    async fn events_are_scoped_per_tenant() {
        let bridge = EventBridge::new(None);
        let mut rx_a = bridge.subscribe("shop-a");
        let mut rx_b = bridge.subscribe("shop-b");
        bridge.publish("shop-a", BridgeEvent::PairingTimeout);
        assert!(matches!(rx_a.recv().await, Ok(BridgeEvent::PairingTimeout)));
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn snapshot_is_persisted_through_sink() {
        let sink = Arc::new(RecordingSink {
            seen: Mutex::new(Vec::new()),
        });
        let bridge = EventBridge::new(Some(sink.clone()));
        bridge.publish_with_snapshot(
            "shop-1",
            BridgeEvent::Disconnected {
                reason: "reset".into(),
            },
            SessionSnapshot::new("shop-1", SessionState::Absent, None),
        );
        // The write happens on a spawned task.
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let seen = sink.seen.lock().await;
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].state, SessionState::Absent);
    }
}
