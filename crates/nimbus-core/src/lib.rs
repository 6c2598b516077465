//! # nimbus-core
//!
//! Core types shared by the Nimbus provisioning telemetry agent and the
//! ingestion service.
//!
//! ## Core Paradigm
//!
//! - A device agent emits `TelemetrySample`s describing its deployment phase
//! - Phases come from a fixed, ordered catalog of six canonical stages
//! - The wire format is snake_case JSON, identical on both sides
//! - The service owns client records; events are append-only

pub mod catalog;
pub mod config;
mod error;
pub mod types;

pub use catalog::{DeploymentPhase, PHASE_CATALOG};
pub use config::{AgentSettings, NimbusConfig, ServerSettings};
pub use error::{NimbusError, Result};
pub use types::*;
