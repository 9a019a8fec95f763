//! REST backend for the hosted business database (PostgREST-style API).

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use time::Date;
use tracing::debug;
use trimline_core::{
    Appointment, AppointmentStatus, MessageLogEntry, MessageTemplate, SessionSnapshot,
    TemplateKind, TenantProfile,
};

use crate::ExternalStore;

pub struct RestStore {
    http: reqwest::Client,
    base: String,
    service_key: String,
}

impl RestStore {
    pub fn new(base: impl Into<String>, service_key: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base: base.into(),
            service_key: service_key.into(),
        }
    }

    fn url(&self, table: &str) -> String {
        format!("{}/rest/v1/{table}", self.base.trim_end_matches('/'))
    }

    fn get(&self, url: &str) -> reqwest::RequestBuilder {
        self.http
            .get(url)
            .header("apikey", &self.service_key)
            .bearer_auth(&self.service_key)
    }

    fn patch(&self, url: &str) -> reqwest::RequestBuilder {
        self.http
            .patch(url)
            .header("apikey", &self.service_key)
            .bearer_auth(&self.service_key)
    }

    fn post(&self, url: &str) -> reqwest::RequestBuilder {
        self.http
            .post(url)
            .header("apikey", &self.service_key)
            .bearer_auth(&self.service_key)
    }
}

fn iso_date(date: Date) -> String {
    format!(
        "{:04}-{:02}-{:02}",
        date.year(),
        u8::from(date.month()),
        date.day()
    )
}

#[derive(Debug, Deserialize)]
struct AppointmentRow {
    id: String,
    barbershop_id: String,
    client_name: String,
    client_phone: String,
    appointment_date: Date,
    start_time: String,
    service_name: String,
    service_price: i64,
    #[serde(default)]
    staff_name: String,
    status: AppointmentStatus,
    reminder_sent: bool,
}

impl From<AppointmentRow> for Appointment {
    fn from(row: AppointmentRow) -> Self {
        Appointment {
            id: row.id,
            tenant: row.barbershop_id,
            client_name: row.client_name,
            client_phone: row.client_phone,
            date: row.appointment_date,
            start_time: row.start_time,
            service_name: row.service_name,
            service_price_cents: row.service_price,
            staff_name: row.staff_name,
            status: row.status,
            reminder_sent: row.reminder_sent,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TemplateRow {
    barbershop_id: String,
    template_type: TemplateKind,
    message_template: String,
    is_active: bool,
}

#[derive(Debug, Deserialize)]
struct ProfileRow {
    id: String,
    name: String,
    #[serde(default)]
    address: Option<String>,
    #[serde(default)]
    country_code: Option<String>,
}

#[async_trait]
impl ExternalStore for RestStore {
    async fn appointments_due(&self, date: Date) -> Result<Vec<Appointment>> {
        let url = format!(
            "{}?appointment_date=eq.{}&reminder_sent=eq.false&status=in.(booked,confirmed)",
            self.url("appointments"),
            iso_date(date)
        );
        let response = self.get(&url).send().await.context("query appointments")?;
        if !response.status().is_success() {
            bail!("appointments query failed: {}", response.status());
        }
        let rows: Vec<AppointmentRow> = response.json().await.context("parse appointments")?;
        Ok(rows.into_iter().map(Appointment::from).collect())
    }

    async fn claim_reminder(&self, appointment_id: &str) -> Result<bool> {
        // Conditional update: the filter only matches while the flag is still
        // false, so exactly one concurrent caller gets a non-empty result.
        let url = format!(
            "{}?id=eq.{appointment_id}&reminder_sent=eq.false",
            self.url("appointments")
        );
        let response = self
            .patch(&url)
            .header("Prefer", "return=representation")
            .json(&json!({ "reminder_sent": true }))
            .send()
            .await
            .context("claim reminder flag")?;
        if !response.status().is_success() {
            bail!("reminder claim failed: {}", response.status());
        }
        let updated: Vec<serde_json::Value> = response.json().await.unwrap_or_default();
        debug!(appointment_id, claimed = !updated.is_empty(), "reminder claim");
        Ok(!updated.is_empty())
    }

    async fn release_reminder(&self, appointment_id: &str) -> Result<()> {
        let url = format!("{}?id=eq.{appointment_id}", self.url("appointments"));
        let response = self
            .patch(&url)
            .json(&json!({ "reminder_sent": false }))
            .send()
            .await
            .context("release reminder flag")?;
        if !response.status().is_success() {
            bail!("reminder release failed: {}", response.status());
        }
        Ok(())
    }

    async fn template(&self, tenant: &str, kind: TemplateKind) -> Result<Option<MessageTemplate>> {
        let url = format!(
            "{}?barbershop_id=eq.{tenant}&template_type=eq.{}&is_active=eq.true&limit=1",
            self.url("whatsapp_templates"),
            kind.as_str()
        );
        let response = self.get(&url).send().await.context("query template")?;
        if !response.status().is_success() {
            bail!("template query failed: {}", response.status());
        }
        let rows: Vec<TemplateRow> = response.json().await.context("parse templates")?;
        Ok(rows.into_iter().next().map(|row| MessageTemplate {
            tenant: row.barbershop_id,
            kind: row.template_type,
            body: row.message_template,
            active: row.is_active,
        }))
    }

    async fn append_message_log(&self, entry: MessageLogEntry) -> Result<()> {
        let response = self
            .post(&self.url("whatsapp_message_log"))
            .json(&json!({
                "delivery_id": entry.delivery_id,
                "barbershop_id": entry.tenant,
                "phone_number": entry.recipient,
                "template_type": entry.kind.as_str(),
                "message": entry.body,
                "correlation_id": entry.correlation_id,
                "status": entry.status.as_str(),
                "attempts": entry.attempts,
                "error": entry.error,
                "sent_at": entry.ts,
            }))
            .send()
            .await
            .context("append message log")?;
        if !response.status().is_success() {
            bail!("message log insert failed: {}", response.status());
        }
        Ok(())
    }

    async fn upsert_session_snapshot(&self, snapshot: SessionSnapshot) -> Result<()> {
        let response = self
            .post(&self.url("whatsapp_sessions"))
            .header("Prefer", "resolution=merge-duplicates")
            .json(&json!({
                "barbershop_id": snapshot.tenant,
                "status": snapshot.state.as_str(),
                "phone": snapshot.identity.as_ref().map(|i| i.phone.clone()),
                "display_name": snapshot.identity.as_ref().and_then(|i| i.display_name.clone()),
                "last_transition": snapshot.last_transition,
            }))
            .send()
            .await
            .context("upsert session snapshot")?;
        if !response.status().is_success() {
            bail!("session snapshot upsert failed: {}", response.status());
        }
        Ok(())
    }

    async fn tenant_profile(&self, tenant: &str) -> Result<Option<TenantProfile>> {
        let url = format!("{}?id=eq.{tenant}&limit=1", self.url("barbershops"));
        let response = self.get(&url).send().await.context("query barbershop")?;
        if !response.status().is_success() {
            bail!("barbershop query failed: {}", response.status());
        }
        let rows: Vec<ProfileRow> = response.json().await.context("parse barbershops")?;
        Ok(rows.into_iter().next().map(|row| TenantProfile {
            tenant: row.id,
            business_name: row.name,
            address: row.address,
            default_country_code: row.country_code,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::date;

    #[test]
    fn iso_date_formats_zero_padded() {
        assert_eq!(iso_date(date!(2026 - 08 - 26)), "2026-08-26");
        assert_eq!(iso_date(date!(2026 - 01 - 05)), "2026-01-05");
    }

    #[test]
    fn urls_tolerate_trailing_slash() {
        let store = RestStore::new("https://db.example.com/", "key");
        assert_eq!(
            store.url("appointments"),
            "https://db.example.com/rest/v1/appointments"
        );
    }

    #[test]
    fn appointment_row_maps_to_domain() {
        let row: AppointmentRow = serde_json::from_value(serde_json::json!({
            "id": "a1",
            "barbershop_id": "shop-1",
            "client_name": "João",
            "client_phone": "(11) 99999-8888",
            "appointment_date": "2026-08-26",
            "start_time": "14:30",
            "service_name": "Corte",
            "service_price": 4500,
            "staff_name": "Carlos",
            "status": "confirmed",
            "reminder_sent": false
        }))
        .unwrap();
        let appointment = Appointment::from(row);
        assert_eq!(appointment.tenant, "shop-1");
        assert_eq!(appointment.date, date!(2026 - 08 - 26));
        assert_eq!(appointment.service_price_cents, 4500);
    }
}
