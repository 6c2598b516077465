//! # nimbus-agent
//!
//! Device-side telemetry agent for Nimbus.
//!
//! The agent runs one cooperative loop per device:
//! - `PhaseDetector` infers the provisioning phase from local system state
//! - `ReportingLoop` decides which samples are worth sending
//! - `DeliveryClient` posts them to the ingestion service with bounded retries
//! - `AgentStateStore` keeps the change-detection baseline across restarts

pub mod client;
pub mod detector;
pub mod identity;
pub mod reporting;
pub mod state_store;
pub mod system_state;

pub use client::{DeliveryClient, TelemetrySink};
pub use detector::{default_rules, EnrollmentStatus, PhaseDetector, PhaseRule, Probe};
pub use identity::DeviceIdentity;
pub use reporting::{should_send, LoopState, ReportingLoop};
pub use state_store::{default_state_path, AgentState, AgentStateStore};
pub use system_state::{FsSystemState, SystemState};
