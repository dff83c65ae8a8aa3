use anyhow::Result;
use certpilot::{
    api::{ApiServer, ApiState},
    config::Settings,
    controller::RenewalScheduler,
    service::CertificateOrchestrator,
    telemetry,
};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Environment overrides from .env
    dotenvy::dotenv().ok();

    // 2. Load configuration
    let settings = Settings::load()?;

    // 3. Initialize telemetry
    telemetry::init_logging(&settings.telemetry)?;
    info!(version = env!("CARGO_PKG_VERSION"), "Starting certpilot...");

    // 4. Build the orchestrator and restore persisted certificates
    let orchestrator = Arc::new(CertificateOrchestrator::from_settings(&settings).await?);
    info!(store = %settings.store.backend, acme = %settings.acme.provider, "Orchestrator ready");

    // Shutdown fan-out for the listeners
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown = |mut rx: watch::Receiver<bool>| async move {
        let _ = rx.changed().await;
    };

    let mut servers = Vec::new();

    // 5. HTTP-01 responder
    if settings.challenge.serve_http {
        let responder = ApiServer::with_router(
            settings.challenge_address()?,
            orchestrator.challenge_responder().router(),
        );
        let rx = shutdown_rx.clone();
        servers.push(tokio::spawn(async move {
            if let Err(e) = responder.serve_with_shutdown("http-01", shutdown(rx)).await {
                error!(error = %e, "HTTP-01 responder failed");
            }
        }));
    }

    // 6. REST API
    if settings.api.enabled {
        let api = ApiServer::new(&settings, ApiState::new(orchestrator.clone()))?;
        let rx = shutdown_rx.clone();
        servers.push(tokio::spawn(async move {
            if let Err(e) = api.serve_with_shutdown("api", shutdown(rx)).await {
                error!(error = %e, "API server failed");
            }
        }));
    }

    // 7. Renewal scheduler
    let scheduler = Arc::new(RenewalScheduler::from_config(orchestrator.clone(), &settings.renewal));
    if settings.renewal.enabled {
        scheduler.start();
    }

    // 8. Wait for shutdown signal
    info!("certpilot started");
    signal::ctrl_c().await?;
    info!("Shutdown signal received, stopping certpilot...");

    scheduler.stop().await;
    shutdown_tx.send_replace(true);
    for server in servers {
        let _ = server.await;
    }

    info!("certpilot stopped");
    Ok(())
}
