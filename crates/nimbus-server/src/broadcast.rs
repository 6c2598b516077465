//! Live update fan-out

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Notification published after every stored sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryUpdate {
    pub event_id: i64,
    pub client_id: String,
    pub device_name: Option<String>,
    pub client_status: String,
    pub phase_name: Option<String>,
    pub phase_order: Option<i64>,
    pub event_type: String,
    pub status: Option<String>,
    pub progress_percentage: Option<i64>,
    pub event_timestamp: DateTime<Utc>,
}

/// Bounded broadcast channel. Publishing never blocks and never fails the
/// caller; subscribers that fall behind skip messages.
#[derive(Debug, Clone)]
pub struct LiveUpdates {
    tx: broadcast::Sender<TelemetryUpdate>,
}

impl LiveUpdates {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Returns how many subscribers received the update
    pub fn publish(&self, update: TelemetryUpdate) -> usize {
        self.tx.send(update).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TelemetryUpdate> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
