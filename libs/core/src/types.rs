use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime};

/// Lifecycle state of a tenant's WhatsApp session.
///
/// ```
/// use trimline_core::SessionState;
///
/// assert_eq!(SessionState::Pairing.as_str(), "pairing");
/// assert!(!SessionState::Pairing.is_connected());
/// assert!(SessionState::Active.is_connected());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Absent,
    Pairing,
    Active,
    Closed,
    PairingTimedOut,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Absent => "absent",
            SessionState::Pairing => "pairing",
            SessionState::Active => "active",
            SessionState::Closed => "closed",
            SessionState::PairingTimedOut => "pairing_timed_out",
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, SessionState::Active)
    }
}

/// Identity reported by the transport once a session opens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectedIdentity {
    pub phone: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

impl ConnectedIdentity {
    pub fn phone_only(phone: impl Into<String>) -> Self {
        Self {
            phone: phone.into(),
            display_name: None,
            avatar_url: None,
        }
    }
}

/// Transient pairing payload surfaced to the UI while a session pairs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairingArtifact {
    pub payload: String,
    #[serde(with = "time::serde::rfc3339")]
    pub issued_at: OffsetDateTime,
}

impl PairingArtifact {
    pub fn new(payload: impl Into<String>) -> Self {
        Self {
            payload: payload.into(),
            issued_at: OffsetDateTime::now_utc(),
        }
    }

    pub fn age_secs(&self, now: OffsetDateTime) -> i64 {
        (now - self.issued_at).whole_seconds()
    }
}

/// Durable last-known status row persisted per tenant.
///
/// Sessions themselves do not survive a restart; this snapshot is what the
/// admin UI sees until the tenant reconnects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub tenant: String,
    pub state: SessionState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<ConnectedIdentity>,
    pub last_transition: String,
}

impl SessionSnapshot {
    pub fn new(tenant: &str, state: SessionState, identity: Option<ConnectedIdentity>) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            tenant: tenant.to_string(),
            state,
            identity,
            last_transition: now
                .format(&time::format_description::well_known::Rfc3339)
                .unwrap_or_else(|_| now.unix_timestamp().to_string()),
        }
    }
}

/// Kind of message a template (or outbound send) belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TemplateKind {
    Confirmation,
    Reminder,
    Custom,
}

impl TemplateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TemplateKind::Confirmation => "confirmation",
            TemplateKind::Reminder => "reminder",
            TemplateKind::Custom => "custom",
        }
    }
}

/// Per-tenant message template, authored in the admin UI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageTemplate {
    pub tenant: String,
    pub kind: TemplateKind,
    pub body: String,
    pub active: bool,
}

/// Delivery status of an outbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Pending,
    Sent,
    Failed,
    Suppressed,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Pending => "pending",
            MessageStatus::Sent => "sent",
            MessageStatus::Failed => "failed",
            MessageStatus::Suppressed => "suppressed",
        }
    }
}

/// Send request accepted by the dispatcher. `body` is final rendered text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundRequest {
    pub tenant: String,
    pub recipient: String,
    pub body: String,
    pub kind: TemplateKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

/// Unit of work owned by the dispatcher once a request is accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub delivery_id: String,
    pub tenant: String,
    pub recipient: String,
    pub body: String,
    pub kind: TemplateKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    pub attempts: u32,
    pub status: MessageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Terminal result reported back through a delivery ticket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Sent,
    Suppressed,
    Failed { code: String, message: String },
}

/// Row appended to the external message log for every terminal transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageLogEntry {
    pub delivery_id: String,
    pub tenant: String,
    pub recipient: String,
    pub kind: TemplateKind,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    pub status: MessageStatus,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub ts: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppointmentStatus {
    Booked,
    Confirmed,
    Cancelled,
}

/// Appointment row read from the external store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Appointment {
    pub id: String,
    pub tenant: String,
    pub client_name: String,
    pub client_phone: String,
    pub date: Date,
    pub start_time: String,
    pub service_name: String,
    pub service_price_cents: i64,
    pub staff_name: String,
    pub status: AppointmentStatus,
    pub reminder_sent: bool,
}

/// Barbershop profile used when rendering templates and normalizing phones.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantProfile {
    pub tenant: String,
    pub business_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_country_code: Option<String>,
}

/// Outcome counts for one reminder scheduler pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReminderTally {
    pub processed: u32,
    pub sent: u32,
    pub suppressed: u32,
    pub errors: u32,
}
