use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use time::Date;
use tokio::sync::RwLock;
use trimline_core::{
    Appointment, AppointmentStatus, MessageLogEntry, MessageTemplate, SessionSnapshot,
    TemplateKind, TenantProfile,
};

use crate::ExternalStore;

/// In-memory store for tests and local development.
#[derive(Default)]
pub struct MemoryStore {
    appointments: RwLock<HashMap<String, Appointment>>,
    templates: RwLock<HashMap<(String, TemplateKind), MessageTemplate>>,
    log: RwLock<Vec<MessageLogEntry>>,
    snapshots: RwLock<HashMap<String, SessionSnapshot>>,
    profiles: RwLock<HashMap<String, TenantProfile>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_appointment(&self, appointment: Appointment) {
        self.appointments
            .write()
            .await
            .insert(appointment.id.clone(), appointment);
    }

    pub async fn insert_template(&self, template: MessageTemplate) {
        self.templates
            .write()
            .await
            .insert((template.tenant.clone(), template.kind), template);
    }

    pub async fn insert_profile(&self, profile: TenantProfile) {
        self.profiles
            .write()
            .await
            .insert(profile.tenant.clone(), profile);
    }

    pub async fn message_log(&self) -> Vec<MessageLogEntry> {
        self.log.read().await.clone()
    }

    pub async fn snapshot(&self, tenant: &str) -> Option<SessionSnapshot> {
        self.snapshots.read().await.get(tenant).cloned()
    }

    pub async fn reminder_sent(&self, appointment_id: &str) -> bool {
        self.appointments
            .read()
            .await
            .get(appointment_id)
            .map(|a| a.reminder_sent)
            .unwrap_or(false)
    }
}

#[async_trait]
impl ExternalStore for MemoryStore {
    async fn appointments_due(&self, date: Date) -> Result<Vec<Appointment>> {
        let guard = self.appointments.read().await;
        Ok(guard
            .values()
            .filter(|a| {
                a.date == date
                    && !a.reminder_sent
                    && matches!(
                        a.status,
                        AppointmentStatus::Booked | AppointmentStatus::Confirmed
                    )
            })
            .cloned()
            .collect())
    }

    async fn claim_reminder(&self, appointment_id: &str) -> Result<bool> {
        let mut guard = self.appointments.write().await;
        match guard.get_mut(appointment_id) {
            Some(appointment) if !appointment.reminder_sent => {
                appointment.reminder_sent = true;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Ok(false),
        }
    }

    async fn release_reminder(&self, appointment_id: &str) -> Result<()> {
        if let Some(appointment) = self.appointments.write().await.get_mut(appointment_id) {
            appointment.reminder_sent = false;
        }
        Ok(())
    }

    async fn template(&self, tenant: &str, kind: TemplateKind) -> Result<Option<MessageTemplate>> {
        let guard = self.templates.read().await;
        Ok(guard
            .get(&(tenant.to_string(), kind))
            .filter(|t| t.active)
            .cloned())
    }

    async fn append_message_log(&self, entry: MessageLogEntry) -> Result<()> {
        self.log.write().await.push(entry);
        Ok(())
    }

    async fn upsert_session_snapshot(&self, snapshot: SessionSnapshot) -> Result<()> {
        self.snapshots
            .write()
            .await
            .insert(snapshot.tenant.clone(), snapshot);
        Ok(())
    }

    async fn tenant_profile(&self, tenant: &str) -> Result<Option<TenantProfile>> {
        Ok(self.profiles.read().await.get(tenant).cloned())
    }
}
