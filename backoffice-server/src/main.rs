use anyhow::Result;
use axum::Router;
use backoffice_telemetry::logging::init_tracing_subscriber;
use backoffice_telemetry::shutdown::ShutdownSignal;
use backoffice_telemetry::Telemetry;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

mod config;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = config::Config::load()?;

    // Initialize tracing
    init_tracing_subscriber(&config.logging)?;
    tracing::info!(
        service = %config.telemetry.service_name,
        "Starting back-office telemetry server"
    );

    // Build the telemetry container
    let telemetry = Arc::new(Telemetry::init(config.telemetry.clone())?);
    telemetry.start_background();
    tracing::info!("Telemetry initialized");

    let app = Router::new()
        .merge(telemetry.router())
        .layer(TraceLayer::new_for_http());

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let signal = ShutdownSignal::new();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { signal.wait().await })
        .await?;

    tracing::info!("Server stopped, draining telemetry");
    telemetry.shutdown(config.shutdown_timeout).await?;

    Ok(())
}
