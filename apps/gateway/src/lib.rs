//! Process wiring for the Trimline gateway.
//!
//! The binary reads its configuration from the environment, assembles the
//! store, transport, registry, dispatcher and scheduler, and serves the HTTP
//! and WebSocket surface. Tests assemble the same [`AppState`] around the
//! mock transport and in-memory store.

pub mod config;
pub mod http;
pub mod ws;

use std::sync::Arc;

use anyhow::{Context, Result};
use trimline_core::EventBridge;
use trimline_dispatch::{
    scheduler::{ReminderScheduler, UtcOffset},
    DispatchConfig, Dispatcher,
};
use trimline_session::{HostedGatewayTransport, MockTransport, SessionRegistry, SharedTransport};
use trimline_store::{shared_memory_store, snapshot_sink, RestStore, SharedStore};

use crate::config::{BackendConfig, GatewayConfig, StoreConfig};
use crate::http::AppState;

/// Builds the full application state from configuration.
pub fn bootstrap(config: &GatewayConfig) -> Result<AppState> {
    let store: SharedStore = match &config.store {
        StoreConfig::Rest { url, service_key } => Arc::new(RestStore::new(url, service_key)),
        StoreConfig::Memory => shared_memory_store(),
    };

    let transport: SharedTransport = match &config.backend {
        BackendConfig::Hosted { api_base, tokens } => {
            Arc::new(HostedGatewayTransport::new(api_base.clone(), tokens.clone()))
        }
        BackendConfig::Mock => Arc::new(MockTransport::new()),
    };

    let bridge = Arc::new(EventBridge::new(Some(snapshot_sink(store.clone()))));
    let registry = Arc::new(SessionRegistry::new(transport, bridge.clone()));
    let dispatcher = Arc::new(Dispatcher::new(
        registry.clone(),
        store.clone(),
        bridge.clone(),
        DispatchConfig {
            default_country_code: config.default_country_code.clone(),
            ..DispatchConfig::default()
        },
    ));
    let offset = UtcOffset::from_hms(config.utc_offset_hours, 0, 0)
        .context("UTC_OFFSET_HOURS is out of range")?;
    let scheduler = Arc::new(ReminderScheduler::new(
        dispatcher.clone(),
        store.clone(),
        config.reminder_interval,
        offset,
    ));

    Ok(AppState {
        registry,
        dispatcher,
        scheduler,
        bridge,
        store,
    })
}
