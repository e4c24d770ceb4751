use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;

use kitsu_api::app::{build_app, services};
use kitsu_infra::config::Settings;
use kitsu_observability::LogFormat;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::from_env().context("loading configuration")?;
    let format: LogFormat = settings.log_format.parse()?;
    kitsu_observability::init(format);

    let services = Arc::new(services::build_services(&settings)?);
    services.start().await;

    let app = build_app(services.clone());
    let listener = tokio::net::TcpListener::bind(settings.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", settings.bind_addr))?;

    tracing::info!(addr = %listener.local_addr()?, "listening");

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    services.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}
