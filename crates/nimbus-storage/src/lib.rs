//! Nimbus Storage - Database layer for the ingestion service
//!
//! Persists the client registry, the seeded deployment phase catalog and
//! the append-only telemetry event log in an embedded Turso database.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │         Ingestion Service                   │
//! │  (HTTP API, live updates)                   │
//! └─────────────────┬───────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────┐
//! │         Nimbus Storage (this crate)         │
//! │  • Transactional ingest                     │
//! │  • Client / event queries                   │
//! │  • Fleet statistics                         │
//! └─────────────────┬───────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────┐
//! │         Turso Database                      │
//! │  • WAL mode                                 │
//! │  • Tables: clients, deployment_phases,      │
//! │    telemetry_events                         │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! # Example Usage
//!
//! ```no_run
//! use nimbus_storage::Database;
//! use nimbus_core::TelemetryRequest;
//! use chrono::Utc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut db = Database::open("nimbus-data/nimbus.db").await?;
//! db.init_schema().await?;
//!
//! let request = TelemetryRequest {
//!     client_id: "PC1-SN123".to_string(),
//!     event_type: "progress".to_string(),
//!     phase_name: Some("Account Setup".to_string()),
//!     progress_percentage: Some(40),
//!     ..Default::default()
//! };
//! let outcome = db.ingest(&request, Utc::now()).await?;
//! println!("Stored event {}", outcome.event_id);
//! # Ok(())
//! # }
//! ```

pub mod db;

pub use db::{ClientFilter, ClientPage, Database, DbError, EventFilter, IngestOutcome, Result};
