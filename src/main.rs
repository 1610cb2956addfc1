use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use trailguard::application::handlers::control_handler;
use trailguard::application::services::engine::Engine;
use trailguard::config::EngineConfig;
use trailguard::infrastructure::bitget_client::{BitgetClient, BitgetConfig};
use trailguard::rate_limit::control_rate_limiter;
use trailguard::secrets::ApiCredentials;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // A missing .env file is fine; the environment may already be set
    let _ = dotenvy::dotenv();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "trailguard=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = EngineConfig::from_env();
    info!(
        "Trailguard starting: leverage {}x, size {}%, {} strategy instruments",
        config.leverage,
        config.position_size_percent,
        config.strategy_instruments.len()
    );

    let credentials = ApiCredentials::from_env().map_err(|e| {
        error!("Failed to load Bitget credentials: {}", e);
        e
    })?;
    let venue = BitgetClient::new_with_config(
        credentials,
        BitgetConfig {
            api_base: config.bitget_api_base.clone(),
            requests_per_second: config.venue_requests_per_second,
        },
    )?;

    let engine = Arc::new(Engine::new(Arc::new(venue), &config));
    engine.add_configured_strategies(&config).await;
    engine.start().await;

    let app = control_handler::router(
        engine.clone(),
        control_rate_limiter(config.control_requests_per_minute),
    );

    let addr: SocketAddr = config.control_api_addr.parse()?;
    info!("Control API listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let server = axum::serve(listener, app);

    let shutdown_signal = async move {
        let ctrl_c = async {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Received Ctrl+C signal"),
                Err(e) => error!("Failed to install Ctrl+C handler: {}", e),
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sig) => {
                    sig.recv().await;
                    info!("Received SIGTERM signal");
                }
                Err(e) => error!("Failed to install SIGTERM handler: {}", e),
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }
    };

    server.with_graceful_shutdown(shutdown_signal).await?;

    info!("Control API stopped, shutting down engine...");
    engine.shutdown().await;

    info!("Shutdown complete");
    Ok(())
}
