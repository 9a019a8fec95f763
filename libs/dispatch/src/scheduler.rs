//! Periodic reminder pass over tomorrow's appointments.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use time::{Date, OffsetDateTime};
pub use time::UtcOffset;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use trimline_core::{
    format_price_cents, render_template, Appointment, CoreError, DeliveryOutcome, OutboundRequest,
    ReminderTally, TemplateKind, TemplateVars,
};
use trimline_store::SharedStore;

use crate::Dispatcher;

/// Walks appointments due tomorrow and hands each one to the dispatcher.
///
/// The pass is advisory about duplicates: the dispatcher's claim step is the
/// actual guard, so overlapping passes or a concurrent manual send can never
/// produce a second reminder for the same appointment.
pub struct ReminderScheduler {
    dispatcher: Arc<Dispatcher>,
    store: SharedStore,
    interval: Duration,
    /// Offset that defines "tomorrow". Appointments are stored in the
    /// business's wall-clock dates, not UTC.
    offset: UtcOffset,
}

impl ReminderScheduler {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        store: SharedStore,
        interval: Duration,
        offset: UtcOffset,
    ) -> Self {
        Self {
            dispatcher,
            store,
            interval,
            offset,
        }
    }

    /// Runs immediately, then on every tick of the configured cadence.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let tally = self.run_once().await;
                info!(
                    processed = tally.processed,
                    sent = tally.sent,
                    suppressed = tally.suppressed,
                    errors = tally.errors,
                    "reminder pass finished"
                );
                tokio::time::sleep(self.interval).await;
            }
        })
    }

    /// One full pass. Failures are per appointment; one broken tenant never
    /// stops the rest of the batch.
    pub async fn run_once(&self) -> ReminderTally {
        let mut tally = ReminderTally::default();
        let Some(tomorrow) = OffsetDateTime::now_utc()
            .to_offset(self.offset)
            .date()
            .next_day()
        else {
            return tally;
        };
        let due = match self.store.appointments_due(tomorrow).await {
            Ok(due) => due,
            Err(err) => {
                warn!(error = %err, "reminder pass could not query due appointments");
                tally.errors += 1;
                return tally;
            }
        };

        for appointment in due {
            tally.processed += 1;
            match self.remind(&appointment).await {
                Ok(DeliveryOutcome::Sent) => tally.sent += 1,
                Ok(DeliveryOutcome::Suppressed) => tally.suppressed += 1,
                Ok(DeliveryOutcome::Failed { code, message }) => {
                    warn!(
                        tenant = %appointment.tenant,
                        appointment_id = %appointment.id,
                        code,
                        error = %message,
                        "reminder delivery failed"
                    );
                    tally.errors += 1;
                }
                Err(err) => {
                    warn!(
                        tenant = %appointment.tenant,
                        appointment_id = %appointment.id,
                        code = err.code(),
                        error = %err,
                        "reminder skipped"
                    );
                    tally.errors += 1;
                }
            }
        }
        counter!("trimline_reminder_passes_total").increment(1);
        tally
    }

    async fn remind(&self, appointment: &Appointment) -> Result<DeliveryOutcome, CoreError> {
        let template = self
            .store
            .template(&appointment.tenant, TemplateKind::Reminder)
            .await?
            .ok_or_else(|| CoreError::TemplateMissing {
                tenant: appointment.tenant.clone(),
                kind: "reminder",
            })?;
        let profile = self.store.tenant_profile(&appointment.tenant).await?;

        let vars = TemplateVars {
            client_name: appointment.client_name.clone(),
            date: format_date(appointment.date),
            time: appointment.start_time.clone(),
            service: appointment.service_name.clone(),
            price: format_price_cents(appointment.service_price_cents),
            staff: appointment.staff_name.clone(),
            business_name: profile
                .as_ref()
                .map(|p| p.business_name.clone())
                .unwrap_or_default(),
            business_address: profile
                .and_then(|p| p.address)
                .unwrap_or_default(),
        };
        let body = render_template(&template.body, &vars);

        let ticket = self
            .dispatcher
            .enqueue(OutboundRequest {
                tenant: appointment.tenant.clone(),
                recipient: appointment.client_phone.clone(),
                body,
                kind: TemplateKind::Reminder,
                correlation_id: Some(appointment.id.clone()),
            })
            .await?;
        Ok(ticket.outcome().await)
    }
}

/// Brazilian dd/mm/yyyy, matching what templates promise.
fn format_date(date: Date) -> String {
    format!(
        "{:02}/{:02}/{:04}",
        date.day(),
        u8::from(date.month()),
        date.year()
    )
}
