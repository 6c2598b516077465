//! Database layer for the Nimbus ingestion service, backed by Turso.
//!
//! Architecture:
//!   - Database file: configurable, `nimbus-data/nimbus.db` by default
//!   - WAL mode: concurrent reads while an ingest transaction writes
//!   - Schema: clients, deployment_phases, telemetry_events tables
//!   - Timestamps: RFC 3339 text with fixed microsecond precision, so text
//!     ordering matches time ordering

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use nimbus_core::catalog::{self, PHASE_CATALOG};
use nimbus_core::types::client_status;
use nimbus_core::{
    ClientRecord, DeploymentPhase, EventType, FleetStatistics, NimbusError, SampleStatus,
    StatusCount, TelemetryEventView, TelemetryRequest,
};
use std::path::Path;
use tracing::{debug, instrument, warn};
use turso::transaction::DropBehavior;
use turso::{params, Builder, Connection};

/// Database connection wrapper for Turso
pub struct Database {
    conn: Connection,
    path: String,
}

/// Database errors
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("turso error: {0}")]
    Turso(#[from] turso::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("client not found: {0}")]
    ClientNotFound(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, DbError>;

impl From<DbError> for NimbusError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::ClientNotFound(id) => NimbusError::NotFound(format!("client {}", id)),
            other => NimbusError::Storage(other.to_string()),
        }
    }
}

/// Filter options for listing clients
#[derive(Debug, Clone)]
pub struct ClientFilter {
    /// Filter by client status (None = all statuses)
    pub status: Option<String>,
    pub limit: i64,
    pub offset: i64,
}

impl Default for ClientFilter {
    fn default() -> Self {
        Self {
            status: None,
            limit: 100,
            offset: 0,
        }
    }
}

/// Filter options for listing telemetry events
#[derive(Debug, Clone)]
pub struct EventFilter {
    pub client_id: Option<String>,
    /// Canonical phase name
    pub phase_name: Option<String>,
    /// Event status
    pub status: Option<String>,
    /// Inclusive lower bound on event_timestamp
    pub from: Option<DateTime<Utc>>,
    /// Inclusive upper bound on event_timestamp
    pub to: Option<DateTime<Utc>>,
    pub limit: i64,
    pub offset: i64,
}

impl Default for EventFilter {
    fn default() -> Self {
        Self {
            client_id: None,
            phase_name: None,
            status: None,
            from: None,
            to: None,
            limit: 100,
            offset: 0,
        }
    }
}

/// A page of clients plus the unpaged count
#[derive(Debug, Clone, PartialEq)]
pub struct ClientPage {
    pub clients: Vec<ClientRecord>,
    pub total: i64,
}

/// Result of one ingest transaction
#[derive(Debug, Clone, PartialEq)]
pub struct IngestOutcome {
    pub event_id: i64,
    pub client: ClientRecord,
    pub phase: Option<&'static DeploymentPhase>,
    pub event_timestamp: DateTime<Utc>,
}

const CLIENT_COLUMNS: &str = "client_id, device_name, deployment_profile, status, \
     enrolled_at, last_seen, created_at, updated_at";

const EVENT_SELECT: &str = "SELECT te.event_id, te.client_id, te.phase_id, dp.phase_name, \
     dp.phase_order, te.event_type, te.event_timestamp, te.progress_percentage, te.status, \
     te.duration_seconds, te.error_message, te.metadata, te.created_at, c.device_name
     FROM telemetry_events te
     LEFT JOIN deployment_phases dp ON te.phase_id = dp.phase_id
     LEFT JOIN clients c ON te.client_id = c.client_id";

impl Database {
    /// Open a database at `path`, creating the file and parent directory
    /// when missing. Call [`Database::init_schema`] before use.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();

        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let db = Builder::new_local(&path_str).build().await?;
        let conn = db.connect()?;

        // PRAGMA statements may return rows
        let _ = conn.query("PRAGMA journal_mode=WAL", params![]).await?;
        let _ = conn.query("PRAGMA busy_timeout=5000", params![]).await?;

        Ok(Database {
            conn,
            path: path_str,
        })
    }

    /// Returns the database file path
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Create tables and indexes if missing, then seed the phase catalog.
    /// Idempotent.
    pub async fn init_schema(&self) -> Result<()> {
        let statements = [
            r#"CREATE TABLE IF NOT EXISTS clients (
                client_id TEXT PRIMARY KEY,
                device_name TEXT,
                deployment_profile TEXT,
                status TEXT NOT NULL DEFAULT 'active',
                enrolled_at TEXT NOT NULL,
                last_seen TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )"#,
            r#"CREATE TABLE IF NOT EXISTS deployment_phases (
                phase_id INTEGER PRIMARY KEY,
                phase_name TEXT NOT NULL UNIQUE,
                phase_order INTEGER NOT NULL,
                description TEXT
            )"#,
            r#"CREATE TABLE IF NOT EXISTS telemetry_events (
                event_id INTEGER PRIMARY KEY,
                client_id TEXT NOT NULL,
                phase_id INTEGER,
                event_type TEXT NOT NULL,
                event_timestamp TEXT NOT NULL,
                progress_percentage INTEGER,
                status TEXT,
                duration_seconds INTEGER,
                error_message TEXT,
                metadata TEXT,
                created_at TEXT NOT NULL
            )"#,
            "CREATE INDEX IF NOT EXISTS idx_clients_status ON clients(status)",
            "CREATE INDEX IF NOT EXISTS idx_clients_last_seen ON clients(last_seen)",
            "CREATE INDEX IF NOT EXISTS idx_events_client ON telemetry_events(client_id)",
            "CREATE INDEX IF NOT EXISTS idx_events_timestamp ON telemetry_events(event_timestamp)",
            "CREATE INDEX IF NOT EXISTS idx_events_status ON telemetry_events(status)",
        ];

        for stmt in statements {
            self.conn.execute(stmt, params![]).await?;
        }

        self.seed_phases().await
    }

    async fn seed_phases(&self) -> Result<()> {
        let existing = self.count("SELECT COUNT(*) FROM deployment_phases").await?;
        if existing > 0 {
            return Ok(());
        }

        for phase in PHASE_CATALOG.iter() {
            self.conn
                .execute(
                    "INSERT INTO deployment_phases (phase_id, phase_name, phase_order, description)
                     VALUES (?, ?, ?, ?)",
                    params![
                        phase.phase_id,
                        phase.phase_name,
                        phase.phase_order,
                        phase.description
                    ],
                )
                .await?;
        }
        debug!("Seeded {} deployment phases", PHASE_CATALOG.len());
        Ok(())
    }

    /// Record one sample: upsert its client and append the event, atomically.
    ///
    /// `received_at` stands in for a missing event timestamp and stamps
    /// `created_at` / `updated_at`. Callers validate the request first.
    #[instrument(skip_all, fields(client_id = %request.client_id, event_type = %request.event_type))]
    pub async fn ingest(
        &mut self,
        request: &TelemetryRequest,
        received_at: DateTime<Utc>,
    ) -> Result<IngestOutcome> {
        let event_timestamp = request.event_timestamp.unwrap_or(received_at);
        let event_ts = format_ts(event_timestamp);
        let now_ts = format_ts(received_at);
        let phase = request
            .phase_name
            .as_deref()
            .and_then(catalog::find_by_name);

        let mut tx = self.conn.transaction().await?;

        let written = async {
            let mut rows = tx
                .query(
                    &format!("SELECT {} FROM clients WHERE client_id = ?", CLIENT_COLUMNS),
                    params![request.client_id.clone()],
                )
                .await?;
            // Drain before parsing; a statement left mid-step ends the transaction
            let mut found = None;
            while let Some(row) = rows.next().await? {
                found = Some(row);
            }
            let existing = found.as_ref().map(parse_client_row).transpose()?;

            let incoming_name = non_empty(request.device_name.as_deref());
            let incoming_profile = non_empty(request.deployment_profile.as_deref());

            let client = match existing {
                None => {
                    let client = ClientRecord {
                        client_id: request.client_id.clone(),
                        device_name: incoming_name,
                        deployment_profile: incoming_profile,
                        status: next_client_status(client_status::ACTIVE, request),
                        enrolled_at: event_timestamp,
                        last_seen: event_timestamp,
                        created_at: received_at,
                        updated_at: received_at,
                    };
                    tx.execute(
                        &format!(
                            "INSERT INTO clients ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                            CLIENT_COLUMNS
                        ),
                        params![
                            client.client_id.clone(),
                            client.device_name.clone(),
                            client.deployment_profile.clone(),
                            client.status.clone(),
                            event_ts.clone(),
                            event_ts.clone(),
                            now_ts.clone(),
                            now_ts.clone()
                        ],
                    )
                    .await?;
                    debug!("Registered new client");
                    client
                }
                Some(current) => {
                    let client = ClientRecord {
                        device_name: incoming_name.or(current.device_name),
                        deployment_profile: incoming_profile.or(current.deployment_profile),
                        status: next_client_status(&current.status, request),
                        last_seen: event_timestamp,
                        updated_at: received_at,
                        ..current
                    };
                    tx.execute(
                        "UPDATE clients SET device_name = ?, deployment_profile = ?, status = ?,
                             last_seen = ?, updated_at = ?
                         WHERE client_id = ?",
                        params![
                            client.device_name.clone(),
                            client.deployment_profile.clone(),
                            client.status.clone(),
                            event_ts.clone(),
                            now_ts.clone(),
                            client.client_id.clone()
                        ],
                    )
                    .await?;
                    client
                }
            };

            let mut rows = tx
                .query(
                    "SELECT COALESCE(MAX(event_id), 0) + 1 FROM telemetry_events",
                    params![],
                )
                .await?;
            let mut event_id: i64 = 1;
            while let Some(row) = rows.next().await? {
                event_id = row.get(0)?;
            }

            let metadata = match &request.metadata {
                Some(metadata) => Some(serde_json::to_string(metadata)?),
                None => None,
            };

            tx.execute(
                "INSERT INTO telemetry_events (
                    event_id, client_id, phase_id, event_type, event_timestamp,
                    progress_percentage, status, duration_seconds, error_message,
                    metadata, created_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                params![
                    event_id,
                    request.client_id.clone(),
                    phase.map(|p| p.phase_id),
                    request.event_type.clone(),
                    event_ts,
                    request.progress_percentage,
                    request.status.clone(),
                    request.duration_seconds,
                    request.error_message.clone(),
                    metadata,
                    now_ts
                ],
            )
            .await?;

            Ok::<_, DbError>(IngestOutcome {
                event_id,
                client,
                phase,
                event_timestamp,
            })
        }
        .await;

        // An ended transaction must not leave a pending rollback on the
        // shared connection
        if tx.is_autocommit()? {
            tx.set_drop_behavior(DropBehavior::Ignore);
            return match written {
                Ok(_) => Err(DbError::Other(
                    "ingest transaction ended before commit".to_string(),
                )),
                Err(e) => Err(e),
            };
        }

        match written {
            Ok(outcome) => {
                tx.commit().await?;
                debug!("Stored event {}", outcome.event_id);
                Ok(outcome)
            }
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    warn!("Rollback after failed ingest also failed: {}", rollback);
                }
                Err(e)
            }
        }
    }

    /// Page through clients, most recently seen first
    pub async fn list_clients(&self, filter: &ClientFilter) -> Result<ClientPage> {
        let mut where_clause = String::new();
        let mut params_vec: Vec<turso::Value> = Vec::new();

        if let Some(status) = &filter.status {
            where_clause.push_str(" WHERE status = ?");
            params_vec.push(status.clone().into());
        }

        let total = {
            let mut rows = self
                .conn
                .query(
                    &format!("SELECT COUNT(*) FROM clients{}", where_clause),
                    params_vec.clone(),
                )
                .await?;
            match rows.next().await? {
                Some(row) => row.get(0)?,
                None => 0,
            }
        };

        let query = format!(
            "SELECT {} FROM clients{} ORDER BY last_seen DESC LIMIT ? OFFSET ?",
            CLIENT_COLUMNS, where_clause
        );
        params_vec.push(filter.limit.into());
        params_vec.push(filter.offset.into());

        let mut rows = self.conn.query(&query, params_vec).await?;
        let mut clients = Vec::new();
        while let Some(row) = rows.next().await? {
            clients.push(parse_client_row(&row)?);
        }

        Ok(ClientPage { clients, total })
    }

    /// Look up one client
    pub async fn get_client(&self, client_id: &str) -> Result<ClientRecord> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {} FROM clients WHERE client_id = ?", CLIENT_COLUMNS),
                params![client_id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => parse_client_row(&row),
            None => Err(DbError::ClientNotFound(client_id.to_string())),
        }
    }

    /// Full event history of one client, newest first
    pub async fn client_events(&self, client_id: &str) -> Result<Vec<TelemetryEventView>> {
        let query = format!(
            "{} WHERE te.client_id = ? ORDER BY te.event_timestamp DESC, te.event_id DESC",
            EVENT_SELECT
        );
        let mut rows = self.conn.query(&query, params![client_id]).await?;

        let mut events = Vec::new();
        while let Some(row) = rows.next().await? {
            events.push(parse_event_row(&row)?);
        }
        Ok(events)
    }

    /// Query events across all clients, newest first
    pub async fn list_events(&self, filter: &EventFilter) -> Result<Vec<TelemetryEventView>> {
        let mut conditions = Vec::new();
        let mut params_vec: Vec<turso::Value> = Vec::new();

        if let Some(client_id) = &filter.client_id {
            conditions.push("te.client_id = ?");
            params_vec.push(client_id.clone().into());
        }

        if let Some(phase_name) = &filter.phase_name {
            conditions.push("dp.phase_name = ?");
            params_vec.push(phase_name.clone().into());
        }

        if let Some(status) = &filter.status {
            conditions.push("te.status = ?");
            params_vec.push(status.clone().into());
        }

        if let Some(from) = filter.from {
            conditions.push("te.event_timestamp >= ?");
            params_vec.push(format_ts(from).into());
        }

        if let Some(to) = filter.to {
            conditions.push("te.event_timestamp <= ?");
            params_vec.push(format_ts(to).into());
        }

        let mut query = String::from(EVENT_SELECT);
        if !conditions.is_empty() {
            query.push_str(" WHERE ");
            query.push_str(&conditions.join(" AND "));
        }
        query.push_str(" ORDER BY te.event_timestamp DESC, te.event_id DESC LIMIT ? OFFSET ?");
        params_vec.push(filter.limit.into());
        params_vec.push(filter.offset.into());

        let mut rows = self.conn.query(&query, params_vec).await?;
        let mut events = Vec::new();
        while let Some(row) = rows.next().await? {
            events.push(parse_event_row(&row)?);
        }
        Ok(events)
    }

    /// Fleet-wide statistics as of `now`
    pub async fn statistics(&self, now: DateTime<Utc>) -> Result<FleetStatistics> {
        let total_clients = self.count("SELECT COUNT(*) FROM clients").await?;

        let mut clients_by_status = Vec::new();
        let mut rows = self
            .conn
            .query(
                "SELECT status, COUNT(*) FROM clients GROUP BY status ORDER BY status",
                params![],
            )
            .await?;
        while let Some(row) = rows.next().await? {
            clients_by_status.push(StatusCount {
                status: row.get(0)?,
                count: row.get(1)?,
            });
        }
        drop(rows);

        let cutoff = format_ts(now - Duration::hours(1));
        let mut rows = self
            .conn
            .query(
                "SELECT COUNT(*) FROM clients WHERE last_seen > ?",
                params![cutoff],
            )
            .await?;
        let active_deployments: i64 = match rows.next().await? {
            Some(row) => row.get(0)?,
            None => 0,
        };
        drop(rows);

        let mut rows = self
            .conn
            .query(
                "SELECT enrolled_at, last_seen FROM clients WHERE status = ?",
                params![client_status::COMPLETED],
            )
            .await?;
        let mut durations = Vec::new();
        while let Some(row) = rows.next().await? {
            let enrolled_at = parse_ts(&row.get::<String>(0)?, "enrolled_at")?;
            let last_seen = parse_ts(&row.get::<String>(1)?, "last_seen")?;
            durations.push((last_seen - enrolled_at).num_milliseconds() as f64 / 1000.0);
        }

        let average_duration_seconds = if durations.is_empty() {
            None
        } else {
            Some(durations.iter().sum::<f64>() / durations.len() as f64)
        };

        Ok(FleetStatistics {
            total_clients,
            clients_by_status,
            active_deployments,
            average_duration_seconds,
        })
    }

    /// The seeded phase catalog, in phase order
    pub async fn phases(&self) -> Result<Vec<DeploymentPhase>> {
        let mut rows = self
            .conn
            .query(
                "SELECT phase_id FROM deployment_phases ORDER BY phase_order",
                params![],
            )
            .await?;

        let mut phases = Vec::new();
        while let Some(row) = rows.next().await? {
            let phase_id: i64 = row.get(0)?;
            let phase = catalog::find_by_id(phase_id)
                .ok_or_else(|| DbError::Other(format!("unknown phase id {}", phase_id)))?;
            phases.push(*phase);
        }
        Ok(phases)
    }

    /// Round-trip a trivial query
    pub async fn ping(&self) -> Result<()> {
        let mut rows = self.conn.query("SELECT 1", params![]).await?;
        rows.next().await?;
        Ok(())
    }

    pub async fn event_count(&self) -> Result<i64> {
        self.count("SELECT COUNT(*) FROM telemetry_events").await
    }

    async fn count(&self, query: &str) -> Result<i64> {
        let mut rows = self.conn.query(query, params![]).await?;
        match rows.next().await? {
            Some(row) => Ok(row.get(0)?),
            None => Ok(0),
        }
    }
}

/// Client status after applying one sample
fn next_client_status(current: &str, request: &TelemetryRequest) -> String {
    let status = request
        .status
        .as_deref()
        .and_then(|s| s.parse::<SampleStatus>().ok());
    let event_type = request.event_type.parse::<EventType>().ok();

    if status == Some(SampleStatus::Completed) || event_type == Some(EventType::Completion) {
        client_status::COMPLETED.to_string()
    } else if status == Some(SampleStatus::Failed) {
        client_status::FAILED.to_string()
    } else {
        current.to_string()
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str, column: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DbError::Other(format!("failed to parse {}: {}", column, e)))
}

fn parse_client_row(row: &turso::Row) -> Result<ClientRecord> {
    Ok(ClientRecord {
        client_id: row.get(0)?,
        device_name: row.get(1)?,
        deployment_profile: row.get(2)?,
        status: row.get(3)?,
        enrolled_at: parse_ts(&row.get::<String>(4)?, "enrolled_at")?,
        last_seen: parse_ts(&row.get::<String>(5)?, "last_seen")?,
        created_at: parse_ts(&row.get::<String>(6)?, "created_at")?,
        updated_at: parse_ts(&row.get::<String>(7)?, "updated_at")?,
    })
}

fn parse_event_row(row: &turso::Row) -> Result<TelemetryEventView> {
    Ok(TelemetryEventView {
        event_id: row.get(0)?,
        client_id: row.get(1)?,
        phase_id: row.get(2)?,
        phase_name: row.get(3)?,
        phase_order: row.get(4)?,
        event_type: row.get(5)?,
        event_timestamp: parse_ts(&row.get::<String>(6)?, "event_timestamp")?,
        progress_percentage: row.get(7)?,
        status: row.get(8)?,
        duration_seconds: row.get(9)?,
        error_message: row.get(10)?,
        metadata: row.get(11)?,
        created_at: parse_ts(&row.get::<String>(12)?, "created_at")?,
        device_name: row.get(13)?,
    })
}
