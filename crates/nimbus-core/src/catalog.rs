//! Canonical deployment phase catalog
//!
//! Static reference data: six ordered stages every device passes through.
//! The catalog is seeded into storage once and never mutated afterwards.

use serde::Serialize;

/// One canonical deployment phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeploymentPhase {
    pub phase_id: i64,
    pub phase_name: &'static str,
    pub phase_order: i64,
    pub description: &'static str,
}

pub const DEVICE_PREPARATION: &str = "Device Preparation";
pub const DEVICE_SETUP: &str = "Device Setup";
pub const ACCOUNT_SETUP: &str = "Account Setup";
pub const APPS_INSTALLATION: &str = "Apps Installation";
pub const POLICIES_APPLICATION: &str = "Policies Application";
pub const COMPLETION: &str = "Completion";

/// Phase name reported when detection itself fails
pub const UNKNOWN_PHASE: &str = "Unknown";

/// Phase name carried by heartbeat samples
pub const SERVICE_RUNNING: &str = "Service Running";

/// The fixed catalog, in phase order
pub const PHASE_CATALOG: [DeploymentPhase; 6] = [
    DeploymentPhase {
        phase_id: 1,
        phase_name: DEVICE_PREPARATION,
        phase_order: 1,
        description: "Initial device setup and preparation",
    },
    DeploymentPhase {
        phase_id: 2,
        phase_name: DEVICE_SETUP,
        phase_order: 2,
        description: "Core device configuration",
    },
    DeploymentPhase {
        phase_id: 3,
        phase_name: ACCOUNT_SETUP,
        phase_order: 3,
        description: "User account configuration",
    },
    DeploymentPhase {
        phase_id: 4,
        phase_name: APPS_INSTALLATION,
        phase_order: 4,
        description: "Application deployment",
    },
    DeploymentPhase {
        phase_id: 5,
        phase_name: POLICIES_APPLICATION,
        phase_order: 5,
        description: "Security and configuration policies",
    },
    DeploymentPhase {
        phase_id: 6,
        phase_name: COMPLETION,
        phase_order: 6,
        description: "Final deployment stage",
    },
];

/// Look up a phase by its exact name
pub fn find_by_name(name: &str) -> Option<&'static DeploymentPhase> {
    PHASE_CATALOG.iter().find(|p| p.phase_name == name)
}

/// Look up a phase by id
pub fn find_by_id(phase_id: i64) -> Option<&'static DeploymentPhase> {
    PHASE_CATALOG.iter().find(|p| p.phase_id == phase_id)
}

/// The phase every device starts in
pub fn first_phase() -> &'static DeploymentPhase {
    &PHASE_CATALOG[0]
}
