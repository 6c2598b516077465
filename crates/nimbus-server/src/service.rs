//! Ingestion service
//!
//! Owns the database handle and the live-update channel. Every operation
//! takes the database lock for the duration of one storage call, so
//! concurrent ingests for the same device are serialized.

use crate::broadcast::{LiveUpdates, TelemetryUpdate};
use chrono::Utc;
use nimbus_core::{
    ClientRecord, DeploymentPhase, FleetStatistics, NimbusError, Result, ServerSettings,
    TelemetryEventView, TelemetryRequest,
};
use nimbus_storage::{ClientFilter, ClientPage, Database, EventFilter};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info};

/// Reject samples missing a field the store cannot do without
pub fn validate(request: &TelemetryRequest) -> Result<()> {
    if request.client_id.trim().is_empty() {
        return Err(NimbusError::Validation("client_id is required".to_string()));
    }
    if request.event_type.trim().is_empty() {
        return Err(NimbusError::Validation("event_type is required".to_string()));
    }
    Ok(())
}

#[derive(Clone)]
pub struct IngestionService {
    db: Arc<Mutex<Database>>,
    updates: LiveUpdates,
}

impl IngestionService {
    pub fn new(db: Database, updates: LiveUpdates) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
            updates,
        }
    }

    /// Open the configured database, creating the schema when needed
    pub async fn open(settings: &ServerSettings) -> Result<Self> {
        let db = Database::open(&settings.database_path).await?;
        db.init_schema().await?;
        info!("Opened telemetry database at {}", db.path());
        Ok(Self::new(db, LiveUpdates::new(settings.broadcast_capacity)))
    }

    /// Store one sample and notify live subscribers. Returns the event id.
    pub async fn ingest(&self, request: TelemetryRequest) -> Result<i64> {
        validate(&request)?;

        let outcome = {
            let mut db = self.db.lock().await;
            db.ingest(&request, Utc::now()).await?
        };

        info!(
            "Stored event {} for {} ({})",
            outcome.event_id, outcome.client.client_id, request.event_type
        );

        let listeners = self.updates.publish(TelemetryUpdate {
            event_id: outcome.event_id,
            client_id: outcome.client.client_id.clone(),
            device_name: outcome.client.device_name.clone(),
            client_status: outcome.client.status.clone(),
            phase_name: outcome.phase.map(|p| p.phase_name.to_string()),
            phase_order: outcome.phase.map(|p| p.phase_order),
            event_type: request.event_type,
            status: request.status,
            progress_percentage: request.progress_percentage,
            event_timestamp: outcome.event_timestamp,
        });
        debug!("Live update sent to {} subscribers", listeners);

        Ok(outcome.event_id)
    }

    pub async fn list_clients(&self, filter: &ClientFilter) -> Result<ClientPage> {
        Ok(self.db.lock().await.list_clients(filter).await?)
    }

    /// A client and its full event history, newest first
    pub async fn client_details(
        &self,
        client_id: &str,
    ) -> Result<(ClientRecord, Vec<TelemetryEventView>)> {
        let db = self.db.lock().await;
        let client = db.get_client(client_id).await?;
        let events = db.client_events(client_id).await?;
        Ok((client, events))
    }

    pub async fn list_events(&self, filter: &EventFilter) -> Result<Vec<TelemetryEventView>> {
        Ok(self.db.lock().await.list_events(filter).await?)
    }

    pub async fn statistics(&self) -> Result<FleetStatistics> {
        Ok(self.db.lock().await.statistics(Utc::now()).await?)
    }

    pub async fn phases(&self) -> Result<Vec<DeploymentPhase>> {
        Ok(self.db.lock().await.phases().await?)
    }

    /// Whether the database answers
    pub async fn health(&self) -> Result<()> {
        Ok(self.db.lock().await.ping().await?)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TelemetryUpdate> {
        self.updates.subscribe()
    }
}
