use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use relay_core::{create_broker, load_config, start_relay_service, validate_config, RelayService};
use relay_server::api::create_router;
use relay_server::state::AppState;

/// Delay before the startup connectivity probe, so early subscribers see it.
const STARTUP_PROBE_DELAY: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("Fatal error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Determine config path
    let config_path = std::env::var("RELAY_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("relay.toml"));

    // Load configuration
    info!("Loading configuration from {:?}", config_path);
    let config = load_config(&config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;

    // Validate configuration
    validate_config(&config).context("Configuration validation failed")?;

    info!("Configuration loaded successfully");
    info!(
        "Relaying {} -> {} as group {}",
        config.broker.instruction_topic, config.broker.checkpoint_topic, config.broker.consumer_group
    );

    let broker = create_broker(&config).context("Failed to create broker backend")?;
    info!("Using {} broker backend", broker.name());

    let service = start_relay_service(config.clone(), broker)
        .context("Failed to start relay service")?;
    info!(
        "Relay service started (commit policy {:?}, checkpoint source {:?})",
        config.relay.commit_policy, config.relay.checkpoint_source
    );

    let state = Arc::new(AppState::new(config.clone(), service.clone()));
    let app = create_router(state);

    // Start server
    let addr = SocketAddr::new(config.server.host, config.server.port);
    info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    tokio::spawn(startup_probe(service.clone()));

    // Run server with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Server shutting down...");
    service.stop().await;
    info!("Relay service stopped");

    Ok(())
}

/// Probe the broker once and report the result to subscribers.
async fn startup_probe(service: RelayService) {
    tokio::time::sleep(STARTUP_PROBE_DELAY).await;
    service.log("📊 Testing broker connectivity...");

    let report = service.test_connectivity().await;
    if report.success {
        service.log("✅ Broker connectivity OK");
    } else {
        let detail = report
            .stages
            .last()
            .map(|s| s.detail.as_str())
            .unwrap_or_default();
        service.log(&format!("❌ {}: {}", report.message, detail));
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
