use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{Router, routing::get};
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

use super::api::{self, AppState};
use super::db::{DbHandle, RoundTableDb};
use super::generation::build_generator;
use super::kamiwaza::KamiwazaClient;
use super::orchestrator::RoundTableService;
use super::ws;
use crate::config::RoundTableConfig;

/// Build the full application router with API and WebSocket routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    let ws_tx = state.service.events().clone();

    api::api_router()
        .route(
            "/ws",
            get(move |ws_upgrade| ws::ws_handler_with_sender(ws_upgrade, ws_tx)),
        )
        .with_state(state)
}

/// Open (creating if needed) the database at the configured path.
pub fn open_database(config: &RoundTableConfig) -> Result<RoundTableDb> {
    let db_path = &config.server.db_path;
    if let Some(parent) = db_path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }
    RoundTableDb::new(db_path).context("Failed to initialize round table database")
}

/// Start the round-table server.
pub async fn start_server(config: RoundTableConfig) -> Result<()> {
    let db = open_database(&config)?;
    let generator = build_generator(&config.llm).context("Failed to configure generation backend")?;
    let (ws_tx, _rx) = broadcast::channel::<String>(256);
    let service = RoundTableService::new(DbHandle::new(db), generator, ws_tx);

    let kamiwaza = config
        .kamiwaza
        .api_uri
        .as_deref()
        .map(|uri| KamiwazaClient::new(uri, config.llm.timeout_secs))
        .transpose()?;
    let state = Arc::new(AppState {
        service: service.clone(),
        kamiwaza,
    });
    let mut app = build_router(state);

    if config.server.dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    info!(
        address = %local_addr,
        provider = %config.llm.provider,
        model = %config.llm.model_name(),
        db_path = %config.server.db_path.display(),
        "round table server listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(service))
        .await
        .context("Server error")?;

    info!("server shut down gracefully");
    Ok(())
}

/// Wait for Ctrl+C, then pause every active run so none is left mid-turn.
async fn shutdown_signal(service: RoundTableService) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for shutdown signal");
        return;
    }
    info!("shutting down; pausing active discussions");
    service.pause_all().await;
}
