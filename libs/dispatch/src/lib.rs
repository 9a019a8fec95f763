//! Outbound message dispatch: per-tenant serialization, bounded retry and
//! duplicate-reminder suppression.

pub mod scheduler;

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use metrics::counter;
use nanoid::nanoid;
use time::OffsetDateTime;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};
use trimline_core::{
    normalize_recipient, CoreError, DeliveryOutcome, EventBridge, BridgeEvent, MessageLogEntry,
    MessageStatus, OutboundMessage, OutboundRequest, TemplateKind,
};
use trimline_session::SessionRegistry;
use trimline_store::SharedStore;

const LANE_CAPACITY: usize = 128;

/// Tuning knobs for the dispatcher. Defaults match the backend limits the
/// production gateways enforce.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub max_attempts: u32,
    pub retry_delay: Duration,
    pub inter_message_delay: Duration,
    pub default_country_code: String,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay: Duration::from_secs(1),
            inter_message_delay: Duration::from_secs(1),
            default_country_code: "55".into(),
        }
    }
}

struct Job {
    message: OutboundMessage,
    done: oneshot::Sender<DeliveryOutcome>,
}

/// Handle returned by [`Dispatcher::enqueue`].
#[derive(Debug)]
pub struct DeliveryTicket {
    pub delivery_id: String,
    outcome: oneshot::Receiver<DeliveryOutcome>,
}

impl DeliveryTicket {
    /// Waits for the terminal outcome of the delivery.
    pub async fn outcome(self) -> DeliveryOutcome {
        self.outcome.await.unwrap_or(DeliveryOutcome::Failed {
            code: "E_SEND_TERMINAL".into(),
            message: "dispatcher worker dropped the job".into(),
        })
    }
}

/// Accepts outbound requests and works them off one at a time per tenant.
///
/// Tenants get their own lazily spawned worker task, so one slow barbershop
/// never delays another; within a tenant there is at most one in-flight send
/// plus a fixed delay between messages.
pub struct Dispatcher {
    registry: Arc<SessionRegistry>,
    store: SharedStore,
    bridge: Arc<EventBridge>,
    config: DispatchConfig,
    lanes: DashMap<String, mpsc::Sender<Job>>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<SessionRegistry>,
        store: SharedStore,
        bridge: Arc<EventBridge>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            registry,
            store,
            bridge,
            config,
            lanes: DashMap::new(),
        }
    }

    /// Validates and queues a request. Recipient problems are rejected here,
    /// synchronously; everything after that surfaces on the ticket.
    pub async fn enqueue(self: &Arc<Self>, request: OutboundRequest) -> Result<DeliveryTicket, CoreError> {
        let country_code = self
            .store
            .tenant_profile(&request.tenant)
            .await
            .ok()
            .flatten()
            .and_then(|profile| profile.default_country_code)
            .unwrap_or_else(|| self.config.default_country_code.clone());
        let recipient = normalize_recipient(&request.recipient, &country_code)?;

        let message = OutboundMessage {
            delivery_id: nanoid!(12),
            tenant: request.tenant.clone(),
            recipient,
            body: request.body,
            kind: request.kind,
            correlation_id: request.correlation_id,
            attempts: 0,
            status: MessageStatus::Pending,
            last_error: None,
        };
        let delivery_id = message.delivery_id.clone();

        let (done, outcome) = oneshot::channel();
        let lane = self.lane(&request.tenant);
        lane.send(Job { message, done }).await.map_err(|_| {
            CoreError::SendFailedTransient("dispatch lane closed".into())
        })?;
        counter!("trimline_messages_enqueued_total", "tenant" => request.tenant.clone())
            .increment(1);
        Ok(DeliveryTicket {
            delivery_id,
            outcome,
        })
    }

    fn lane(self: &Arc<Self>, tenant: &str) -> mpsc::Sender<Job> {
        self.lanes
            .entry(tenant.to_string())
            .or_insert_with(|| {
                let (tx, rx) = mpsc::channel(LANE_CAPACITY);
                let dispatcher = self.clone();
                let tenant = tenant.to_string();
                tokio::spawn(async move { dispatcher.run_lane(tenant, rx).await });
                tx
            })
            .clone()
    }

    async fn run_lane(self: Arc<Self>, tenant: String, mut rx: mpsc::Receiver<Job>) {
        while let Some(job) = rx.recv().await {
            let outcome = self.process(job.message).await;
            let _ = job.done.send(outcome);
            // Pace sends the way the gateways expect.
            tokio::time::sleep(self.config.inter_message_delay).await;
        }
        warn!(tenant, "dispatch lane stopped");
    }

    async fn process(&self, mut message: OutboundMessage) -> DeliveryOutcome {
        let claim_key = (message.kind == TemplateKind::Reminder)
            .then(|| message.correlation_id.clone())
            .flatten();

        // Claim the reminder flag before sending so a concurrent scheduler
        // run cannot produce a second `sent` for the same appointment.
        if let Some(appointment_id) = claim_key.as_deref() {
            match self.store.claim_reminder(appointment_id).await {
                Ok(true) => {}
                Ok(false) => {
                    info!(
                        tenant = %message.tenant,
                        appointment_id,
                        "reminder already sent; suppressing"
                    );
                    counter!("trimline_reminders_suppressed_total", "tenant" => message.tenant.clone())
                        .increment(1);
                    message.status = MessageStatus::Suppressed;
                    self.persist(&message).await;
                    return DeliveryOutcome::Suppressed;
                }
                Err(err) => {
                    message.status = MessageStatus::Failed;
                    message.last_error = Some(err.to_string());
                    self.persist(&message).await;
                    return DeliveryOutcome::Failed {
                        code: "E_STORE".into(),
                        message: err.to_string(),
                    };
                }
            }
        }

        let mut last_error: Option<CoreError> = None;
        while message.attempts < self.config.max_attempts {
            message.attempts += 1;
            match self
                .registry
                .send_and_confirm(&message.tenant, &message.recipient, &message.body)
                .await
            {
                Ok(_) => {
                    message.status = MessageStatus::Sent;
                    self.persist(&message).await;
                    counter!("trimline_messages_sent_total", "tenant" => message.tenant.clone())
                        .increment(1);
                    self.bridge.publish(
                        &message.tenant,
                        BridgeEvent::MessageSent {
                            delivery_id: message.delivery_id.clone(),
                            correlation_id: message.correlation_id.clone(),
                        },
                    );
                    return DeliveryOutcome::Sent;
                }
                Err(err) if err.is_transient() && message.attempts < self.config.max_attempts => {
                    warn!(
                        tenant = %message.tenant,
                        delivery_id = %message.delivery_id,
                        attempt = message.attempts,
                        error = %err,
                        "send failed; retrying"
                    );
                    last_error = Some(err);
                    tokio::time::sleep(self.config.retry_delay * message.attempts).await;
                }
                Err(err) => {
                    last_error = Some(err);
                    break;
                }
            }
        }

        // Exhausted retries turn a transient failure terminal.
        let error = match last_error {
            Some(err) if err.is_transient() => ("E_SEND_TERMINAL", err.to_string()),
            Some(err) => (err.code(), err.to_string()),
            None => ("E_SEND_TERMINAL", "send failed".into()),
        };
        message.status = MessageStatus::Failed;
        message.last_error = Some(error.1.clone());

        if let Some(appointment_id) = claim_key.as_deref() {
            // Give the claim back so a later scheduler pass may retry.
            if let Err(err) = self.store.release_reminder(appointment_id).await {
                warn!(appointment_id, error = %err, "failed to release reminder claim");
            }
        }
        self.persist(&message).await;
        counter!("trimline_messages_failed_total", "tenant" => message.tenant.clone()).increment(1);
        self.bridge.publish(
            &message.tenant,
            BridgeEvent::MessageFailed {
                delivery_id: message.delivery_id.clone(),
                error: error.1.clone(),
            },
        );
        DeliveryOutcome::Failed {
            code: error.0.into(),
            message: error.1,
        }
    }

    async fn persist(&self, message: &OutboundMessage) {
        let now = OffsetDateTime::now_utc();
        let entry = MessageLogEntry {
            delivery_id: message.delivery_id.clone(),
            tenant: message.tenant.clone(),
            recipient: message.recipient.clone(),
            kind: message.kind,
            body: message.body.clone(),
            correlation_id: message.correlation_id.clone(),
            status: message.status,
            attempts: message.attempts,
            error: message.last_error.clone(),
            ts: now
                .format(&time::format_description::well_known::Rfc3339)
                .unwrap_or_else(|_| now.unix_timestamp().to_string()),
        };
        if let Err(err) = self.store.append_message_log(entry).await {
            warn!(delivery_id = %message.delivery_id, error = %err, "failed to append message log");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trimline_core::{
        Appointment, AppointmentStatus, ConnectedIdentity, SessionState, TenantProfile,
    };
    use trimline_session::{MockTransport, SharedTransport, TransportEvent};
    use trimline_store::MemoryStore;

    fn test_config() -> DispatchConfig {
        DispatchConfig {
            max_attempts: 3,
            retry_delay: Duration::from_millis(10),
            inter_message_delay: Duration::from_millis(5),
            default_country_code: "55".into(),
        }
    }

    async fn active_stack() -> (Arc<Dispatcher>, Arc<MockTransport>, Arc<MemoryStore>) {
        let mock = Arc::new(MockTransport::new());
        let transport: SharedTransport = mock.clone();
        let bridge = Arc::new(EventBridge::new(None));
        let registry = Arc::new(SessionRegistry::new(transport, bridge.clone()));
        let store = Arc::new(MemoryStore::new());

        registry.connect("shop-1").await.unwrap();
        mock.emit(
            "shop-1",
            TransportEvent::Opened {
                identity: ConnectedIdentity::phone_only("5511999990000"),
            },
        )
        .await;
        for _ in 0..200 {
            if registry.status("shop-1").await.status == SessionState::Active {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let dispatcher = Arc::new(Dispatcher::new(
            registry,
            store.clone(),
            bridge,
            test_config(),
        ));
        (dispatcher, mock, store)
    }

    fn request(kind: TemplateKind, correlation_id: Option<&str>) -> OutboundRequest {
        OutboundRequest {
            tenant: "shop-1".into(),
            recipient: "(11) 99999-8888".into(),
            body: "Olá!".into(),
            kind,
            correlation_id: correlation_id.map(String::from),
        }
    }

    fn tomorrow_appointment(id: &str, reminder_sent: bool) -> Appointment {
        Appointment {
            id: id.into(),
            tenant: "shop-1".into(),
            client_name: "João".into(),
            client_phone: "11999998888".into(),
            date: OffsetDateTime::now_utc().date().next_day().unwrap(),
            start_time: "14:30".into(),
            service_name: "Corte".into(),
            service_price_cents: 4500,
            staff_name: "Carlos".into(),
            status: AppointmentStatus::Confirmed,
            reminder_sent,
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn invalid_recipient_is_rejected_synchronously() {
        let (dispatcher, mock, _store) = active_stack().await;
        let err = dispatcher
            .enqueue(OutboundRequest {
                recipient: "abc".into(),
                ..request(TemplateKind::Custom, None)
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "E_INVALID_RECIPIENT");
        assert!(mock.sent().await.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn recipient_uses_tenant_country_code() {
        let (dispatcher, mock, store) = active_stack().await;
        store
            .insert_profile(TenantProfile {
                tenant: "shop-1".into(),
                business_name: "Barbearia".into(),
                address: None,
                default_country_code: Some("351".into()),
            })
            .await;
        let ticket = dispatcher
            .enqueue(OutboundRequest {
                recipient: "912345678".into(),
                ..request(TemplateKind::Custom, None)
            })
            .await
            .unwrap();
        assert_eq!(ticket.outcome().await, DeliveryOutcome::Sent);
        assert_eq!(mock.sent().await[0].recipient, "351912345678");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn successful_send_is_logged_with_one_attempt() {
        let (dispatcher, mock, store) = active_stack().await;
        let ticket = dispatcher
            .enqueue(request(TemplateKind::Custom, None))
            .await
            .unwrap();
        assert_eq!(ticket.outcome().await, DeliveryOutcome::Sent);
        assert_eq!(mock.sent().await.len(), 1);

        let log = store.message_log().await;
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].status, MessageStatus::Sent);
        assert_eq!(log[0].attempts, 1);
        assert_eq!(log[0].recipient, "5511999998888");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failing_send_exhausts_exactly_max_attempts() {
        let (dispatcher, mock, store) = active_stack().await;
        mock.fail_next_sends(10);
        let ticket = dispatcher
            .enqueue(request(TemplateKind::Custom, None))
            .await
            .unwrap();
        let outcome = ticket.outcome().await;
        assert!(matches!(outcome, DeliveryOutcome::Failed { .. }));
        assert_eq!(mock.sent().await.len(), 3);

        let log = store.message_log().await;
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].status, MessageStatus::Failed);
        assert_eq!(log[0].attempts, 3);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn transient_failure_then_success_recovers() {
        let (dispatcher, mock, store) = active_stack().await;
        mock.fail_next_sends(1);
        let ticket = dispatcher
            .enqueue(request(TemplateKind::Custom, None))
            .await
            .unwrap();
        assert_eq!(ticket.outcome().await, DeliveryOutcome::Sent);
        assert_eq!(mock.sent().await.len(), 2);
        assert_eq!(store.message_log().await[0].attempts, 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn duplicate_reminder_is_suppressed() {
        let (dispatcher, mock, store) = active_stack().await;
        store.insert_appointment(tomorrow_appointment("apt-1", true)).await;

        let ticket = dispatcher
            .enqueue(request(TemplateKind::Reminder, Some("apt-1")))
            .await
            .unwrap();
        assert_eq!(ticket.outcome().await, DeliveryOutcome::Suppressed);
        assert!(mock.sent().await.is_empty());
        assert_eq!(store.message_log().await[0].status, MessageStatus::Suppressed);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn reminder_claim_is_released_after_terminal_failure() {
        let (dispatcher, mock, store) = active_stack().await;
        store.insert_appointment(tomorrow_appointment("apt-1", false)).await;
        mock.fail_next_sends(10);

        let ticket = dispatcher
            .enqueue(request(TemplateKind::Reminder, Some("apt-1")))
            .await
            .unwrap();
        assert!(matches!(ticket.outcome().await, DeliveryOutcome::Failed { .. }));
        assert!(!store.reminder_sent("apt-1").await);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn successful_reminder_keeps_the_flag() {
        let (dispatcher, _mock, store) = active_stack().await;
        store.insert_appointment(tomorrow_appointment("apt-1", false)).await;

        let ticket = dispatcher
            .enqueue(request(TemplateKind::Reminder, Some("apt-1")))
            .await
            .unwrap();
        assert_eq!(ticket.outcome().await, DeliveryOutcome::Sent);
        assert!(store.reminder_sent("apt-1").await);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn send_without_session_fails_without_retry_spin() {
        let mock = Arc::new(MockTransport::new());
        let transport: SharedTransport = mock.clone();
        let bridge = Arc::new(EventBridge::new(None));
        let registry = Arc::new(SessionRegistry::new(transport, bridge.clone()));
        let store = Arc::new(MemoryStore::new());
        let dispatcher = Arc::new(Dispatcher::new(registry, store, bridge, test_config()));

        let ticket = dispatcher
            .enqueue(request(TemplateKind::Custom, None))
            .await
            .unwrap();
        match ticket.outcome().await {
            DeliveryOutcome::Failed { code, .. } => assert_eq!(code, "E_NOT_PAIRED"),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(mock.sent().await.is_empty());
    }
}
