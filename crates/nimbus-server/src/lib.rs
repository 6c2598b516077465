//! # nimbus-server
//!
//! Ingestion service for Nimbus provisioning telemetry.
//! Accepts samples from device agents, keeps the client registry and event
//! log in Turso, and serves query and live-update endpoints over Axum.

mod broadcast;
mod server;
mod service;
mod sse;

pub use broadcast::{LiveUpdates, TelemetryUpdate};
pub use server::{router, ApiError, AppState, SharedState, API_KEY_HEADER};
pub use service::{validate, IngestionService};

use anyhow::Context;
use nimbus_core::ServerSettings;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Run the ingestion API until `cancel` fires
pub async fn run(settings: ServerSettings, cancel: CancellationToken) -> anyhow::Result<()> {
    if settings.api_key.is_empty() {
        tracing::warn!("No API key configured; protected endpoints will answer 500");
    }

    let service = IngestionService::open(&settings)
        .await
        .context("Failed to open telemetry database")?;

    let app = router(Arc::new(AppState {
        service,
        api_key: settings.api_key.clone(),
    }));

    let listener = tokio::net::TcpListener::bind(&settings.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", settings.bind_addr))?;
    info!("Nimbus ingestion service listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;

    info!("Nimbus ingestion service stopped");
    Ok(())
}
