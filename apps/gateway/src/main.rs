use anyhow::Result;
use axum::serve;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;
use trimline_gateway::config::GatewayConfig;
use trimline_gateway::http::build_router;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = GatewayConfig::from_env()?;
    let state = trimline_gateway::bootstrap(&config)?;

    // One eager pass at boot, then the configured cadence.
    state.scheduler.clone().spawn();

    let router = build_router(state);
    let listener = TcpListener::bind(config.bind).await?;
    info!("trimline-gateway listening on {}", config.bind);

    serve(listener, router)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
        })
        .await?;

    Ok(())
}
