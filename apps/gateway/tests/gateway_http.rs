use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use time::{OffsetDateTime, UtcOffset};
use tower::ServiceExt;
use trimline_core::{
    Appointment, AppointmentStatus, ConnectedIdentity, EventBridge, MessageTemplate, TemplateKind,
    TenantProfile,
};
use trimline_dispatch::scheduler::ReminderScheduler;
use trimline_dispatch::{DispatchConfig, Dispatcher};
use trimline_gateway::http::{build_router, AppState};
use trimline_session::{MockTransport, SessionRegistry, SharedTransport, TransportEvent};
use trimline_store::{snapshot_sink, MemoryStore, SharedStore};

fn test_state() -> (AppState, Arc<MockTransport>, Arc<MemoryStore>) {
    let mock = Arc::new(MockTransport::new());
    let transport: SharedTransport = mock.clone();
    let store = Arc::new(MemoryStore::new());
    let shared: SharedStore = store.clone();
    let bridge = Arc::new(EventBridge::new(Some(snapshot_sink(shared.clone()))));
    let registry = Arc::new(SessionRegistry::new(transport, bridge.clone()));
    let dispatcher = Arc::new(Dispatcher::new(
        registry.clone(),
        shared.clone(),
        bridge.clone(),
        DispatchConfig {
            max_attempts: 3,
            retry_delay: Duration::from_millis(10),
            inter_message_delay: Duration::from_millis(5),
            default_country_code: "55".into(),
        },
    ));
    let scheduler = Arc::new(ReminderScheduler::new(
        dispatcher.clone(),
        shared.clone(),
        Duration::from_secs(3600),
        UtcOffset::UTC,
    ));
    (
        AppState {
            registry,
            dispatcher,
            scheduler,
            bridge,
            store: shared,
        },
        mock,
        store,
    )
}

async fn call(router: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(value) => builder
            .header("content-type", "application/json")
            .body(Body::from(value.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

/// Polls an endpoint until `pred` accepts the response.
async fn poll(
    router: &Router,
    uri: &str,
    pred: impl Fn(StatusCode, &Value) -> bool,
) -> (StatusCode, Value) {
    for _ in 0..200 {
        let (status, body) = call(router, "GET", uri, None).await;
        if pred(status, &body) {
            return (status, body);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out polling {uri}");
}

async fn pair_and_open(router: &Router, mock: &MockTransport, tenant: &str, phone: &str) {
    let (status, _) = call(router, "POST", &format!("/sessions/{tenant}/connect"), None).await;
    assert_eq!(status, StatusCode::OK);
    poll(router, &format!("/sessions/{tenant}/pairing"), |s, _| {
        s == StatusCode::OK
    })
    .await;
    mock.emit(
        tenant,
        TransportEvent::Opened {
            identity: ConnectedIdentity::phone_only(phone),
        },
    )
    .await;
    poll(router, &format!("/sessions/{tenant}/status"), |_, body| {
        body["connected"] == json!(true)
    })
    .await;
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
        service_price_cents: 3500,
        staff_name: "Carlos".into(),
        status: AppointmentStatus::Confirmed,
        reminder_sent,
    }
}

async fn seed_tenant(store: &MemoryStore) {
    store
        .insert_template(MessageTemplate {
            tenant: "shop-1".into(),
            kind: TemplateKind::Reminder,
            body: "Oi {cliente_nome}, amanhã às {horario}!".into(),
            active: true,
        })
        .await;
    store
        .insert_template(MessageTemplate {
            tenant: "shop-1".into(),
            kind: TemplateKind::Confirmation,
            body: "Confirmado, {cliente_nome}: {servico} em {data} às {horario} na {barbearia_nome}.".into(),
            active: true,
        })
        .await;
    store
        .insert_profile(TenantProfile {
            tenant: "shop-1".into(),
            business_name: "Barbearia do Zé".into(),
            address: None,
            default_country_code: Some("55".into()),
        })
        .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn health_reports_active_sessions() {
    let (state, mock, _store) = test_state();
    let router = build_router(state);

    let (status, body) = call(&router, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "status": "ok", "active_sessions": 0 }));

    pair_and_open(&router, &mock, "shop-1", "5511999998888").await;
    let (_, body) = call(&router, "GET", "/health", None).await;
    assert_eq!(body["active_sessions"], json!(1));
}

#[tokio::test(flavor = "multi_thread")]
async fn connect_pair_and_report_identity() {
    let (state, mock, _store) = test_state();
    let router = build_router(state);

    let (status, body) = call(&router, "POST", "/sessions/shop-1/connect", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], json!("pairing"));

    let (_, pairing) = poll(&router, "/sessions/shop-1/pairing", |s, _| {
        s == StatusCode::OK
    })
    .await;
    assert_eq!(pairing["artifact"]["payload"], json!("Q1"));

    mock.emit(
        "shop-1",
        TransportEvent::Opened {
            identity: ConnectedIdentity::phone_only("5511999998888"),
        },
    )
    .await;

    let (_, status_body) = poll(&router, "/sessions/shop-1/status", |_, body| {
        body["connected"] == json!(true)
    })
    .await;
    assert_eq!(status_body["status"], json!("active"));
    assert_eq!(status_body["identity"]["phone"], json!("5511999998888"));
}

#[tokio::test(flavor = "multi_thread")]
async fn connect_is_idempotent_while_pairing() {
    let (state, mock, _store) = test_state();
    let router = build_router(state);

    call(&router, "POST", "/sessions/shop-1/connect", None).await;
    poll(&router, "/sessions/shop-1/pairing", |s, _| {
        s == StatusCode::OK
    })
    .await;
    let (status, body) = call(&router, "POST", "/sessions/shop-1/connect", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], json!("pairing"));
    assert_eq!(mock.start_calls("shop-1"), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn reset_during_pairing_gets_a_fresh_artifact() {
    let (state, _mock, _store) = test_state();
    let router = build_router(state);

    call(&router, "POST", "/sessions/shop-1/connect", None).await;
    let (_, first) = poll(&router, "/sessions/shop-1/pairing", |s, _| {
        s == StatusCode::OK
    })
    .await;
    assert_eq!(first["artifact"]["payload"], json!("Q1"));

    let (status, body) = call(&router, "POST", "/sessions/shop-1/reset", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], json!("absent"));
    let (_, status_body) = call(&router, "GET", "/sessions/shop-1/status", None).await;
    assert_eq!(status_body["connected"], json!(false));
    assert_eq!(status_body["status"], json!("absent"));

    call(&router, "POST", "/sessions/shop-1/connect", None).await;
    let (_, second) = poll(&router, "/sessions/shop-1/pairing", |s, body| {
        s == StatusCode::OK && body["artifact"]["payload"] != json!("Q1")
    })
    .await;
    assert_eq!(second["artifact"]["payload"], json!("Q2"));
}

#[tokio::test(flavor = "multi_thread")]
async fn pairing_endpoint_is_not_found_without_session() {
    let (state, _mock, _store) = test_state();
    let router = build_router(state);
    let (status, body) = call(&router, "GET", "/sessions/ghost/pairing", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], json!("E_NOT_PAIRED"));
}

#[tokio::test(flavor = "multi_thread")]
async fn send_without_session_is_a_conflict() {
    let (state, _mock, _store) = test_state();
    let router = build_router(state);
    let (status, body) = call(
        &router,
        "POST",
        "/messages/shop-1/send",
        Some(json!({ "recipient": "11999998888", "body": "Oi" })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], json!("E_NOT_PAIRED"));
}

#[tokio::test(flavor = "multi_thread")]
async fn send_normalizes_recipient_and_reports_delivery() {
    let (state, mock, _store) = test_state();
    let router = build_router(state);
    pair_and_open(&router, &mock, "shop-1", "5511999990000").await;

    let (status, body) = call(
        &router,
        "POST",
        "/messages/shop-1/send",
        Some(json!({ "recipient": "(11) 99999-8888", "body": "Oi" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], json!("sent"));
    assert!(body["delivery_id"].is_string());

    let sent = mock.sent().await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].recipient, "5511999998888");
    assert_eq!(sent[0].body, "Oi");
}

#[tokio::test(flavor = "multi_thread")]
async fn invalid_recipient_is_a_bad_request() {
    let (state, mock, _store) = test_state();
    let router = build_router(state);
    pair_and_open(&router, &mock, "shop-1", "5511999990000").await;

    let (status, body) = call(
        &router,
        "POST",
        "/messages/shop-1/send",
        Some(json!({ "recipient": "abc", "body": "Oi" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], json!("E_INVALID_RECIPIENT"));
}

#[tokio::test(flavor = "multi_thread")]
async fn template_send_renders_the_stored_template() {
    let (state, mock, store) = test_state();
    let router = build_router(state);
    seed_tenant(&store).await;
    pair_and_open(&router, &mock, "shop-1", "5511999990000").await;

    let (status, body) = call(
        &router,
        "POST",
        "/messages/shop-1/send",
        Some(json!({
            "recipient": "11999998888",
            "template": "confirmation",
            "vars": {
                "client_name": "João",
                "date": "26/08/2026",
                "time": "14:30",
                "service": "Corte"
            }
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], json!("sent"));

    let sent = mock.sent().await;
    assert_eq!(
        sent[0].body,
        "Confirmado, João: Corte em 26/08/2026 às 14:30 na Barbearia do Zé."
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_template_is_not_found() {
    let (state, mock, _store) = test_state();
    let router = build_router(state);
    pair_and_open(&router, &mock, "shop-1", "5511999990000").await;

    let (status, body) = call(
        &router,
        "POST",
        "/messages/shop-1/send",
        Some(json!({ "recipient": "11999998888", "template": "reminder" })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], json!("E_TEMPLATE_MISSING"));
}

#[tokio::test(flavor = "multi_thread")]
async fn reminder_run_reports_the_tally() {
    let (state, mock, store) = test_state();
    let router = build_router(state);
    seed_tenant(&store).await;
    pair_and_open(&router, &mock, "shop-1", "5511999990000").await;

    store.insert_appointment(tomorrow_appointment("apt-1", false)).await;
    store.insert_appointment(tomorrow_appointment("apt-2", true)).await;

    let (status, tally) = call(&router, "POST", "/reminders/run", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        tally,
        json!({ "processed": 1, "sent": 1, "suppressed": 0, "errors": 0 })
    );
    assert_eq!(mock.sent().await.len(), 1);

    // A second pass finds nothing left to remind.
    let (_, tally) = call(&router, "POST", "/reminders/run", None).await;
    assert_eq!(
        tally,
        json!({ "processed": 0, "sent": 0, "suppressed": 0, "errors": 0 })
    );
    assert_eq!(mock.sent().await.len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn disconnect_keeps_the_session_closed() {
    let (state, mock, _store) = test_state();
    let router = build_router(state);
    pair_and_open(&router, &mock, "shop-1", "5511999990000").await;

    let (status, body) = call(&router, "POST", "/sessions/shop-1/disconnect", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], json!("closed"));

    let (_, health) = call(&router, "GET", "/health", None).await;
    assert_eq!(health["active_sessions"], json!(0));
}
