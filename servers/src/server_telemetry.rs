//! # Telemetry Relay
//!
//! Accepts signed telemetry batches from agents, stores them in SQLite and
//! pushes every stored event to connected WebSocket viewers.
//!
//! ## Core Responsibilities:
//! - **Authenticated ingest:** a static API token plus a timestamped
//!   HMAC-SHA256 signature over the raw body, with a replay window.
//! - **Live fan-out:** viewers on `/ws` receive each stored event, optionally
//!   filtered to one agent. A viewer that cannot keep up is dropped.
//! - **History:** recent events can be listed and cleared over HTTP.
//!
//! Configuration comes from defaults, then `server_telemetry.conf` (JSON),
//! then environment variables and CLI flags. When both TLS paths are set the
//! server terminates TLS itself.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum_server::tls_rustls::RustlsConfig;
use tokio::signal;

use lib_common::connections::SqliteEventStore;
use lib_common::core::BroadcastRegistry;
use lib_common::loggers::{setup_logging, LoggerLocalOptions};
use lib_common::security::SignatureValidator;

mod telemetry_logic;
use telemetry_logic::{config, routes, state::AppState};

const APP_NAME: &str = "server_telemetry";
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = config::load_config()?;
    let _log_guard = setup_logging(
        APP_NAME,
        &LoggerLocalOptions {
            level: config.log_level().to_string(),
            log_dir: config.log_dir.clone(),
            ..Default::default()
        },
    )?;

    let db_path = config.db_path();
    let store = SqliteEventStore::open(&db_path, config.db_max_connections())
        .await
        .with_context(|| format!("cannot open database {}", db_path.display()))?;
    tracing::info!("event store ready at {}", db_path.display());

    let settings = config.signature_settings();
    tracing::info!(
        drift_secs = settings.drift_secs,
        retention_secs = settings.retention_secs,
        "signature validation configured"
    );

    let state = AppState::new(
        SignatureValidator::new(settings),
        BroadcastRegistry::new(config.send_timeout()),
        Arc::new(store),
        config.api_token(),
    );
    let app = routes::build_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port()));
    let handle = axum_server::Handle::new();

    let signal_handle = handle.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::warn!("Shutdown signal received. Closing server gracefully...");
        signal_handle.graceful_shutdown(Some(SHUTDOWN_GRACE));
    });

    match config.tls_paths() {
        Some((cert_path, key_path)) => {
            // Rustls 0.23+ requires an explicit crypto provider.
            rustls::crypto::ring::default_provider()
                .install_default()
                .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;
            let tls_config = RustlsConfig::from_pem_file(cert_path, key_path)
                .await
                .context("TLS configuration error")?;

            tracing::info!("telemetry relay listening on https://{}", addr);
            axum_server::bind_rustls(addr, tls_config)
                .handle(handle)
                .serve(app.into_make_service())
                .await?;
        }
        None => {
            tracing::info!("telemetry relay listening on http://{}", addr);
            axum_server::bind(addr)
                .handle(handle)
                .serve(app.into_make_service())
                .await?;
        }
    }

    tracing::info!("Shutdown complete.");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
