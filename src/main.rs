use std::sync::Arc;
use anyhow::Context;
use oracle_infra::api::{create_router, ApiState};
use oracle_infra::config::AppConfig;
use oracle_infra::observability::{init_tracing, register_metrics};
use oracle_infra::price_infra::OracleServiceBuilder;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = std::env::var("ORACLE_ENV").unwrap_or_else(|_| "development".to_string());
    let app = AppConfig::load(&env).context("loading configuration")?;

    init_tracing(&app.logging)?;
    register_metrics().context("registering metrics")?;

    let service = OracleServiceBuilder::from_app_config(&app)
        .build()
        .context("building oracle service")?;
    let state = Arc::new(ApiState::new(Arc::new(service)));

    let listener = tokio::net::TcpListener::bind(&app.server.bind_addr)
        .await
        .with_context(|| format!("binding {}", app.server.bind_addr))?;
    tracing::info!(env = %env, addr = %app.server.bind_addr, "Oracle service listening");

    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Oracle service stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }
}
