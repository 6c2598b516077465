//! Core type definitions for Nimbus telemetry

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Free-form sample metadata, serialized as a JSON object
pub type Metadata = BTreeMap<String, serde_json::Value>;

/// Kind of sample an agent emits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    #[default]
    Progress,
    Heartbeat,
    Completion,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Progress => write!(f, "progress"),
            Self::Heartbeat => write!(f, "heartbeat"),
            Self::Completion => write!(f, "completion"),
        }
    }
}

impl std::str::FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "progress" => Ok(Self::Progress),
            "heartbeat" => Ok(Self::Heartbeat),
            "completion" => Ok(Self::Completion),
            _ => Err(format!("Invalid event type: {}", s)),
        }
    }
}

/// Deployment status carried by a sample
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleStatus {
    #[default]
    Active,
    InProgress,
    Completed,
    Failed,
    Error,
}

impl SampleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for SampleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SampleStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "active" => Ok(Self::Active),
            "in_progress" | "inprogress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "error" => Ok(Self::Error),
            _ => Err(format!("Invalid status: {}", s)),
        }
    }
}

/// Second-precision ISO-8601 UTC timestamps (`2024-01-01T00:00:00Z`).
///
/// Deserialization accepts any RFC 3339 timestamp, plus offset-less
/// timestamps which are taken as UTC.
pub mod wire_timestamp {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub const FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&ts.format(FORMAT).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).map_err(serde::de::Error::custom)
    }

    pub fn parse(raw: &str) -> Result<DateTime<Utc>, String> {
        if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
            return Ok(dt.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
            .map(|naive| naive.and_utc())
            .map_err(|e| format!("invalid timestamp '{}': {}", raw, e))
    }

    /// Same as the parent module, for `Option<DateTime<Utc>>` fields
    pub mod option {
        use chrono::{DateTime, Utc};
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(
            ts: &Option<DateTime<Utc>>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match ts {
                Some(ts) => super::serialize(ts, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<DateTime<Utc>>, D::Error> {
            match Option::<String>::deserialize(deserializer)? {
                Some(raw) if !raw.is_empty() => super::parse(&raw)
                    .map(Some)
                    .map_err(serde::de::Error::custom),
                _ => Ok(None),
            }
        }
    }
}

/// One telemetry reading emitted by an agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    pub client_id: String,
    pub device_name: String,
    pub deployment_profile: String,
    pub phase_name: String,
    pub event_type: EventType,
    #[serde(with = "wire_timestamp")]
    pub event_timestamp: DateTime<Utc>,
    pub progress_percentage: u8,
    pub status: SampleStatus,
    pub duration_seconds: i64,
    pub error_message: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
}

/// Result of one phase detection pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseInfo {
    pub phase: String,
    pub progress: u8,
    pub status: SampleStatus,
    pub error: Option<String>,
}

/// Inbound sample as accepted by the ingestion endpoint.
///
/// Only `client_id` and `event_type` are mandatory; everything else may be
/// omitted by older or partial agents.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRequest {
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub device_name: Option<String>,
    #[serde(default)]
    pub deployment_profile: Option<String>,
    #[serde(default)]
    pub phase_name: Option<String>,
    #[serde(default)]
    pub event_type: String,
    #[serde(default, with = "wire_timestamp::option")]
    pub event_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub progress_percentage: Option<i64>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub duration_seconds: Option<i64>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub metadata: Option<Metadata>,
}

impl From<&TelemetrySample> for TelemetryRequest {
    fn from(sample: &TelemetrySample) -> Self {
        Self {
            client_id: sample.client_id.clone(),
            device_name: Some(sample.device_name.clone()),
            deployment_profile: Some(sample.deployment_profile.clone()),
            phase_name: Some(sample.phase_name.clone()),
            event_type: sample.event_type.to_string(),
            event_timestamp: Some(sample.event_timestamp),
            progress_percentage: Some(i64::from(sample.progress_percentage)),
            status: Some(sample.status.to_string()),
            duration_seconds: Some(sample.duration_seconds),
            error_message: sample.error_message.clone(),
            metadata: Some(sample.metadata.clone()),
        }
    }
}

/// Client status values stored in the registry
pub mod client_status {
    pub const ACTIVE: &str = "active";
    pub const COMPLETED: &str = "completed";
    pub const FAILED: &str = "failed";
}

/// A device known to the ingestion service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientRecord {
    pub client_id: String,
    pub device_name: Option<String>,
    pub deployment_profile: Option<String>,
    pub status: String,
    pub enrolled_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A stored telemetry event joined with its phase and client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEventView {
    pub event_id: i64,
    pub client_id: String,
    pub phase_id: Option<i64>,
    pub phase_name: Option<String>,
    pub phase_order: Option<i64>,
    pub event_type: String,
    pub event_timestamp: DateTime<Utc>,
    pub progress_percentage: Option<i64>,
    pub status: Option<String>,
    pub duration_seconds: Option<i64>,
    pub error_message: Option<String>,
    pub metadata: Option<String>,
    pub created_at: DateTime<Utc>,
    pub device_name: Option<String>,
}

/// Number of clients in one status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCount {
    pub status: String,
    pub count: i64,
}

/// Fleet-wide deployment statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FleetStatistics {
    pub total_clients: i64,
    pub clients_by_status: Vec<StatusCount>,
    /// Clients seen within the past hour
    pub active_deployments: i64,
    /// Mean `last_seen - enrolled_at` over completed clients
    pub average_duration_seconds: Option<f64>,
}
