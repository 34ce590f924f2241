use anyhow::Context;

use commitpulse_infra::config::JobSystemConfig;
use commitpulse_infra::jobs::StartOutcome;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    commitpulse_observability::init();

    let config = JobSystemConfig::from_env();
    let bind_addr = config.bind_addr.clone();

    let (app, services) = commitpulse_api::app::build_app(config).await?;

    if services.system.start().await != StartOutcome::Started {
        tracing::warn!("job system was already started");
    }

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;

    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    services.system.stop().await;
    tracing::info!("shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}
