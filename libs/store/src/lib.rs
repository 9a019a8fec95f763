//! External business-data store consumed by the session and dispatch crates.
//!
//! The schema (appointments, templates, message log, session snapshots) is
//! owned elsewhere; this crate only fixes the query/RPC surface the core
//! needs and ships two backends: an in-memory store for tests and local runs
//! and a REST-backed store for the hosted database.

mod memory;
mod rest;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use time::Date;
use trimline_core::{
    Appointment, MessageLogEntry, MessageTemplate, SessionSnapshot, SnapshotSink, TemplateKind,
    TenantProfile,
};

pub use memory::MemoryStore;
pub use rest::RestStore;

/// Shared store handle used across services.
pub type SharedStore = Arc<dyn ExternalStore>;

/// Contract against the hosted business database.
#[async_trait]
pub trait ExternalStore: Send + Sync {
    /// Appointments on `date` with status booked/confirmed whose reminder has
    /// not been sent yet.
    async fn appointments_due(&self, date: Date) -> Result<Vec<Appointment>>;

    /// Atomically claims the reminder flag for an appointment. Returns `true`
    /// when this caller won the claim and should proceed with the send,
    /// `false` when the reminder was already sent or claimed.
    async fn claim_reminder(&self, appointment_id: &str) -> Result<bool>;

    /// Releases a previously won claim after a send that ultimately failed,
    /// so a later scheduler pass may retry.
    async fn release_reminder(&self, appointment_id: &str) -> Result<()>;

    /// Active template for a tenant and kind, if one exists.
    async fn template(&self, tenant: &str, kind: TemplateKind) -> Result<Option<MessageTemplate>>;

    async fn append_message_log(&self, entry: MessageLogEntry) -> Result<()>;

    async fn upsert_session_snapshot(&self, snapshot: SessionSnapshot) -> Result<()>;

    async fn tenant_profile(&self, tenant: &str) -> Result<Option<TenantProfile>>;
}

/// Returns an in-memory store wrapped in an [`Arc`].
pub fn shared_memory_store() -> Arc<MemoryStore> {
    Arc::new(MemoryStore::new())
}

/// Adapts any store into the event bridge's snapshot sink.
pub fn snapshot_sink(store: SharedStore) -> Arc<dyn SnapshotSink> {
    Arc::new(StoreSnapshotSink { store })
}

struct StoreSnapshotSink {
    store: SharedStore,
}

#[async_trait]
impl SnapshotSink for StoreSnapshotSink {
    async fn upsert(&self, snapshot: SessionSnapshot) -> Result<()> {
        self.store.upsert_session_snapshot(snapshot).await
    }
}
