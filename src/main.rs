//! Upload Server
//!
//! Resumable upload endpoints with per-mount storage routing, durable
//! session records and background expiry.

use std::time::Duration;

use anyhow::Context;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use upload_server::config::Config;
use upload_server::db;
use upload_server::routes;
use upload_server::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "upload_server=debug,tower_http=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();

    let config = Config::from_env().unwrap_or_else(|e| {
        tracing::warn!("Failed to load config from env: {}, using defaults", e);
        Config::default()
    });

    tracing::info!("Starting Upload Server v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Storage provider: {:?}", config.storage.provider);

    // Initialize database
    let db_pool = match &config.database.url {
        Some(url) => {
            let pool = db::create_pool(url)
                .await
                .context("Failed to initialize database")?;
            tracing::info!("Database initialized at {}", url);
            Some(pool)
        }
        None => {
            tracing::warn!("DATABASE_URL not set, upload sessions will not survive a restart");
            None
        }
    };
    let durable = db_pool.is_some();

    let sweep_interval = Duration::from_secs(config.uploads.sweep_interval_secs.max(1));
    let addr = format!("{}:{}", config.server.host, config.server.port);

    // Create application state
    let app_state = AppState::from_config(config, db_pool)
        .await
        .context("Failed to initialize upload mounts")?;

    for mount in app_state.mounts() {
        if durable {
            match mount.engine.reconcile_all().await {
                Ok(count) => tracing::info!(mount = %mount.name, sessions = count, "Restored upload sessions"),
                Err(e) => tracing::warn!(mount = %mount.name, error = %e, "Session reconciliation failed"),
            }
        }
        mount.engine.clone().start_sweep_task(sweep_interval);
    }

    let app = routes::app(app_state);

    // Start server with graceful shutdown
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    tracing::info!("Upload Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, starting graceful shutdown...");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown...");
        },
    }
}
