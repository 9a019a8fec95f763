use std::sync::Arc;

use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;
use trimline_core::{
    render_template, CoreError, DeliveryOutcome, EventBridge, OutboundRequest, PairingArtifact,
    ReminderTally, SessionState, TemplateKind, TemplateVars,
};
use trimline_dispatch::{scheduler::ReminderScheduler, Dispatcher};
use trimline_session::SessionRegistry;
use trimline_store::SharedStore;

use crate::ws::session_events;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub dispatcher: Arc<Dispatcher>,
    pub scheduler: Arc<ReminderScheduler>,
    pub bridge: Arc<EventBridge>,
    pub store: SharedStore,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/sessions/{tenant}/connect", post(connect))
        .route("/sessions/{tenant}/status", get(status))
        .route("/sessions/{tenant}/pairing", get(pairing))
        .route("/sessions/{tenant}/disconnect", post(disconnect))
        .route("/sessions/{tenant}/reset", post(reset))
        .route("/sessions/{tenant}/events", get(session_events))
        .route("/messages/{tenant}/send", post(send_message))
        .route("/reminders/run", post(run_reminders))
        .with_state(state)
}

/// JSON error envelope returned by every failing route.
pub struct ApiError {
    status: StatusCode,
    code: String,
    message: String,
}

impl ApiError {
    fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        let code = code.into();
        Self {
            status: status_for(&code),
            code,
            message: message.into(),
        }
    }
}

fn status_for(code: &str) -> StatusCode {
    match code {
        "E_INVALID_RECIPIENT" | "E_INVALID_REQUEST" => StatusCode::BAD_REQUEST,
        "E_NOT_PAIRED" | "E_DUPLICATE_SUPPRESSED" => StatusCode::CONFLICT,
        "E_PAIRING_EXPIRED" => StatusCode::GONE,
        "E_TEMPLATE_MISSING" => StatusCode::NOT_FOUND,
        "E_ADAPTER_UNAVAILABLE" => StatusCode::SERVICE_UNAVAILABLE,
        "E_SEND_TRANSIENT" | "E_SEND_TERMINAL" => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        Self::new(err.code(), err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": { "code": self.code, "message": self.message }
        });
        (self.status, Json(body)).into_response()
    }
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let active = state.registry.active_count().await;
    Json(json!({ "status": "ok", "active_sessions": active }))
}

async fn connect(
    State(state): State<AppState>,
    Path(tenant): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let status = state.registry.connect(&tenant).await?;
    counter!("trimline_http_connect_total", "tenant" => tenant.clone()).increment(1);
    let message = match status.status {
        SessionState::Active => "session already active",
        SessionState::Pairing => "pairing in progress; watch the event stream for a QR",
        _ => "pairing started",
    };
    Ok(Json(json!({ "status": status.status, "message": message })))
}

async fn status(
    State(state): State<AppState>,
    Path(tenant): Path<String>,
) -> Json<serde_json::Value> {
    let status = state.registry.status(&tenant).await;
    Json(serde_json::to_value(&status).unwrap_or_else(|_| json!({ "connected": false })))
}

#[derive(Serialize)]
struct PairingResponse {
    artifact: PairingArtifact,
}

async fn pairing(
    State(state): State<AppState>,
    Path(tenant): Path<String>,
) -> Result<Response, ApiError> {
    match state.registry.current_pairing(&tenant) {
        Some(artifact) => Ok(Json(PairingResponse { artifact }).into_response()),
        None => {
            let status = state.registry.status(&tenant).await;
            if status.status == SessionState::Pairing {
                // Session is pairing but the transport has not produced an
                // artifact yet; the caller should retry or watch the stream.
                Ok((StatusCode::ACCEPTED, Json(json!({ "status": "pending" }))).into_response())
            } else {
                let err = CoreError::NotPaired(tenant);
                Err(ApiError {
                    status: StatusCode::NOT_FOUND,
                    code: err.code().into(),
                    message: err.to_string(),
                })
            }
        }
    }
}

async fn disconnect(
    State(state): State<AppState>,
    Path(tenant): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let status = state.registry.disconnect(&tenant).await?;
    Ok(Json(json!({ "status": status.status })))
}

async fn reset(
    State(state): State<AppState>,
    Path(tenant): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let status = state.registry.reset(&tenant).await?;
    Ok(Json(json!({ "status": status.status })))
}

/// Send request. Either a final `body`, or a stored `template` kind plus the
/// variables to render it with.
#[derive(Debug, Deserialize)]
pub struct SendRequest {
    pub recipient: String,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub template: Option<TemplateKind>,
    #[serde(default)]
    pub vars: Option<SendVars>,
    #[serde(default)]
    pub correlation_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SendVars {
    #[serde(default)]
    pub client_name: String,
    #[serde(default)]
    pub date: String,
    #[serde(default)]
    pub time: String,
    #[serde(default)]
    pub service: String,
    #[serde(default)]
    pub price: String,
    #[serde(default)]
    pub staff: String,
}

async fn send_message(
    State(state): State<AppState>,
    Path(tenant): Path<String>,
    Json(request): Json<SendRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let (body, kind) = match (&request.body, request.template) {
        (Some(body), kind) => (body.clone(), kind.unwrap_or(TemplateKind::Custom)),
        (None, Some(kind)) => {
            let template = state
                .store
                .template(&tenant, kind)
                .await
                .map_err(CoreError::Store)?
                .ok_or_else(|| CoreError::TemplateMissing {
                    tenant: tenant.clone(),
                    kind: kind.as_str(),
                })?;
            let profile = state
                .store
                .tenant_profile(&tenant)
                .await
                .map_err(CoreError::Store)?;
            let given = request.vars.unwrap_or_default();
            let vars = TemplateVars {
                client_name: given.client_name,
                date: given.date,
                time: given.time,
                service: given.service,
                price: given.price,
                staff: given.staff,
                business_name: profile
                    .as_ref()
                    .map(|p| p.business_name.clone())
                    .unwrap_or_default(),
                business_address: profile.and_then(|p| p.address).unwrap_or_default(),
            };
            (render_template(&template.body, &vars), kind)
        }
        (None, None) => {
            return Err(ApiError::new(
                "E_INVALID_REQUEST",
                "request needs either body or template",
            ));
        }
    };

    let ticket = state
        .dispatcher
        .enqueue(OutboundRequest {
            tenant,
            recipient: request.recipient,
            body,
            kind,
            correlation_id: request.correlation_id,
        })
        .await?;
    let delivery_id = ticket.delivery_id.clone();
    match ticket.outcome().await {
        DeliveryOutcome::Sent => Ok(Json(json!({ "status": "sent", "delivery_id": delivery_id }))),
        DeliveryOutcome::Suppressed => Ok(Json(
            json!({ "status": "suppressed", "delivery_id": delivery_id }),
        )),
        DeliveryOutcome::Failed { code, message } => Err(ApiError::new(code, message)),
    }
}

async fn run_reminders(State(state): State<AppState>) -> Json<ReminderTally> {
    let tally = state.scheduler.run_once().await;
    info!(
        processed = tally.processed,
        sent = tally.sent,
        suppressed = tally.suppressed,
        errors = tally.errors,
        "manual reminder pass finished"
    );
    Json(tally)
}
