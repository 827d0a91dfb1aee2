//! Gateway service entry point.
//!
//! Binds the device-facing TCP listener and the observer-facing HTTP/
//! WebSocket server, wires the shared registry, dispatcher and hub, and
//! runs until SIGINT/SIGTERM.

use anyhow::{Context, Result};
use gateway::{
    create_router, tcp_server, AppState, Config, DeviceRegistry, Dispatcher, Ingress, LogFormat,
    ObserverRegistry, SessionContext,
};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    let config = Config::from_env().context("reading configuration")?;

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));
    match config.log_format {
        LogFormat::Console => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
    }

    info!("Starting GT06 gateway");
    info!("Configuration:");
    info!("  TCP_PORT: {}", config.tcp_port);
    info!("  HTTP_PORT: {}", config.http_port);
    info!("  METRICS_PORT: {}", config.metrics_port);
    info!("  STATIC_DIR: {}", config.static_dir.display());
    info!("  HEMISPHERE_MODE: {:?}", config.hemisphere);
    info!("  QUEUE_CAP: {}", config.queue_cap);

    // Start Prometheus metrics server
    PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], config.metrics_port))
        .install()
        .context("starting Prometheus exporter")?;
    info!("Prometheus metrics server started on port {}", config.metrics_port);

    // Shared state, initialized before any listener accepts.
    let registry = Arc::new(DeviceRegistry::new());
    let observers = Arc::new(ObserverRegistry::new(registry.clone()));
    let dispatcher = Arc::new(Dispatcher::new(observers.clone(), config.queue_cap));
    let ingress = Ingress::new(registry, dispatcher.clone());

    let cancel = CancellationToken::new();

    // Device-facing TCP listener.
    let device_addr = SocketAddr::from(([0, 0, 0, 0], config.tcp_port));
    let device_listener = bind(device_addr, "device listener").await?;
    info!("Device listener on {}", device_addr);

    let session_ctx = SessionContext {
        ingress: ingress.clone(),
        hemisphere: config.hemisphere,
        idle_timeout: config.device_idle,
    };
    let device_task = tokio::spawn(tcp_server::serve(
        device_listener,
        session_ctx,
        cancel.clone(),
    ));

    // Observer-facing HTTP/WebSocket server.
    let state = Arc::new(AppState { observers, ingress });
    let app = create_router(state, &config.static_dir);

    let http_addr = SocketAddr::from(([0, 0, 0, 0], config.http_port));
    let http_listener = bind(http_addr, "observer endpoint").await?;
    info!("Observer endpoint on {}", http_addr);

    axum::serve(http_listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Stop accepting devices, close sessions, then let queues flush.
    info!("Shutting down...");
    cancel.cancel();
    let _ = device_task.await;

    if dispatcher.drain_all(config.drain_grace).await {
        info!("Queues drained");
    } else {
        warn!(
            pending = dispatcher.pending_total(),
            "drain grace elapsed with updates pending"
        );
    }

    info!("Gateway stopped");
    Ok(())
}

/// Bind a listener, logging the failure before surfacing it; a bind
/// failure is fatal and exits non-zero.
async fn bind(addr: SocketAddr, what: &str) -> Result<TcpListener> {
    TcpListener::bind(addr).await.map_err(|e| {
        error!(%addr, error = %e, "failed to bind {what}");
        anyhow::Error::from(e).context(format!("binding {what} on {addr}"))
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received terminate signal"),
    }
}
