use std::net::SocketAddr;
use std::process::ExitCode;

use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use api_gatekeeper::{AppState, Config, build_router, metrics, utils};

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .with_thread_ids(true)
        .init();

    info!("Starting API Gatekeeper v{}", env!("CARGO_PKG_VERSION"));

    match run().await {
        Ok(()) => ExitCode::from(exitcode::OK as u8),
        Err(exit_code) => ExitCode::from(exit_code as u8),
    }
}

/// Run the application, returning an exit code on error.
async fn run() -> Result<(), exitcode::ExitCode> {
    // Load configuration
    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {e}");
        exitcode::CONFIG
    })?;
    info!(
        host = %config.host,
        port = %config.port,
        environment = %config.environment,
        "Configuration loaded"
    );
    if !config.proxy_validation_enabled() {
        warn!("TRUSTED_PROXIES not set, forwarded client IPs are trusted from any peer");
    }

    if let Some(metrics_addr) = config.metrics_addr() {
        metrics::try_init_metrics(metrics_addr);
    } else {
        info!("Metrics export disabled (METRICS_PORT=0)");
    }

    let addr: SocketAddr = config.server_addr().parse().map_err(|e| {
        error!("Invalid server address: {e}");
        exitcode::CONFIG
    })?;

    // The store is connected lazily; an unreachable store degrades rate
    // limiting and profile lookups but does not prevent startup.
    let state = AppState::from_config(config).map_err(|e| {
        error!("Failed to build application state: {e}");
        exitcode::CONFIG
    })?;
    if !state.store.health_check().await {
        warn!("Store unreachable at startup, continuing in degraded mode");
    }

    let app = build_router(state);

    let listener = TcpListener::bind(addr).await.map_err(|e| {
        error!("Failed to bind to {addr}: {e}");
        exitcode::UNAVAILABLE
    })?;

    info!("Server listening on http://{addr}");
    info!("API endpoints:");
    info!("  GET    /health               - Health check");
    info!("  GET    /ready                - Readiness check");
    info!("  GET    /api/csrf-token       - Issue CSRF token");
    info!("  POST   /api/auth/login       - Exchange credential for platform token");
    info!("  POST   /api/auth/signup      - Create profile");
    info!("  GET    /api/me               - Current caller");
    info!("  POST   /api/surveys          - Create survey");
    info!("  DELETE /api/surveys/{{id}}     - Delete own survey");
    info!("  GET    /api/admin/stats      - Gatekeeper statistics (admin)");
    info!("  POST   /api/ai/suggestions   - Question suggestions");

    // Peer addresses feed the rate limiter's client IP resolution
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(utils::shutdown_signal())
    .await
    .map_err(|e| {
        error!("Server error: {e}");
        exitcode::SOFTWARE
    })?;

    info!("Server shutdown complete");
    Ok(())
}
