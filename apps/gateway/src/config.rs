use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context, Result};

/// Which transport backend the process talks to.
#[derive(Debug, Clone)]
pub enum BackendConfig {
    /// Hosted multi-tenant gateway; tenants map to instance tokens.
    Hosted {
        api_base: String,
        tokens: HashMap<String, String>,
    },
    /// In-process scriptable transport for local runs and tests.
    Mock,
}

/// Where business data lives.
#[derive(Debug, Clone)]
pub enum StoreConfig {
    Rest { url: String, service_key: String },
    Memory,
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind: SocketAddr,
    pub store: StoreConfig,
    pub backend: BackendConfig,
    pub default_country_code: String,
    pub reminder_interval: Duration,
    /// Whole-hour UTC offset of the businesses' wall clock; the reminder
    /// scheduler uses it to decide which date counts as "tomorrow".
    pub utc_offset_hours: i8,
}

impl GatewayConfig {
    /// Reads configuration from the environment.
    ///
    /// `BIND` (default `0.0.0.0:8080`), `STORE_URL` + `STORE_SERVICE_KEY`
    /// (memory store when unset), `WA_BACKEND` = `hosted` | `mock` with
    /// `WA_API_BASE` and `WA_INSTANCE_TOKENS` (JSON object, tenant to token),
    /// `DEFAULT_COUNTRY_CODE` (default `55`), `REMINDER_INTERVAL_SECS`
    /// (default 3600) and `UTC_OFFSET_HOURS` (default `0`, e.g. `-3` for
    /// São Paulo).
    pub fn from_env() -> Result<Self> {
        let bind = match std::env::var("BIND") {
            Ok(raw) => raw.parse().context("invalid BIND address")?,
            Err(_) => SocketAddr::from(([0, 0, 0, 0], 8080)),
        };

        let store = match std::env::var("STORE_URL") {
            Ok(url) => StoreConfig::Rest {
                url,
                service_key: std::env::var("STORE_SERVICE_KEY")
                    .context("STORE_SERVICE_KEY is required when STORE_URL is set")?,
            },
            Err(_) => StoreConfig::Memory,
        };

        let backend = match std::env::var("WA_BACKEND").as_deref() {
            Ok("mock") => BackendConfig::Mock,
            Ok("hosted") | Err(_) => {
                let api_base =
                    std::env::var("WA_API_BASE").context("WA_API_BASE is required for the hosted backend")?;
                let tokens = match std::env::var("WA_INSTANCE_TOKENS") {
                    Ok(raw) => serde_json::from_str(&raw)
                        .context("WA_INSTANCE_TOKENS must be a JSON object of tenant to token")?,
                    Err(_) => HashMap::new(),
                };
                BackendConfig::Hosted { api_base, tokens }
            }
            Ok(other) => bail!("unknown WA_BACKEND {other:?}; expected hosted or mock"),
        };

        let default_country_code =
            std::env::var("DEFAULT_COUNTRY_CODE").unwrap_or_else(|_| "55".into());

        let reminder_interval = match std::env::var("REMINDER_INTERVAL_SECS") {
            Ok(raw) => Duration::from_secs(
                raw.parse()
                    .context("REMINDER_INTERVAL_SECS must be an integer")?,
            ),
            Err(_) => Duration::from_secs(3600),
        };

        let utc_offset_hours = match std::env::var("UTC_OFFSET_HOURS") {
            Ok(raw) => raw
                .parse::<i8>()
                .context("UTC_OFFSET_HOURS must be a whole number of hours")?,
            Err(_) => 0,
        };
        if !(-23..=23).contains(&utc_offset_hours) {
            bail!("UTC_OFFSET_HOURS must be between -23 and 23");
        }

        Ok(Self {
            bind,
            store,
            backend,
            default_country_code,
            reminder_interval,
            utc_offset_hours,
        })
    }
}
