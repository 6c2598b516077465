//! Phase detection
//!
//! The detector folds an ordered table of (probe, phase) rules over the
//! system-state tree. Every probe runs on every pass and the most advanced
//! phase whose probe held wins. A failing probe counts as "not reached";
//! only an unreachable system-state source degrades the whole pass to
//! `Unknown`.

use crate::system_state::SystemState;
use nimbus_core::catalog::{
    self, ACCOUNT_SETUP, APPS_INSTALLATION, COMPLETION, DEVICE_SETUP, POLICIES_APPLICATION,
    UNKNOWN_PHASE,
};
use nimbus_core::{Metadata, NimbusError, PhaseInfo, Result, SampleStatus};
use serde_json::json;
use tracing::debug;

pub const SETUP_STATE_KEY: &str = "SOFTWARE/Microsoft/Windows/CurrentVersion/Setup/State";
pub const PROFILE_LIST_KEY: &str = "SOFTWARE/Microsoft/Windows NT/CurrentVersion/ProfileList";
pub const APPS_KEY: &str = "SOFTWARE/Microsoft/IntuneManagementExtension/Apps";
pub const POLICY_KEY: &str = "SOFTWARE/Microsoft/PolicyManager/current";
pub const AUTOPILOT_CACHE_KEY: &str = "SOFTWARE/Microsoft/Provisioning/AutopilotPolicyCache";
pub const ENROLLMENTS_KEY: &str = "SOFTWARE/Microsoft/Enrollments";

/// A single local-state check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Probe {
    /// The key exists
    KeyExists(String),
    /// The key has more than `count` subkeys
    SubkeyCountAbove { path: String, count: usize },
}

impl Probe {
    pub fn evaluate(&self, state: &dyn SystemState) -> Result<bool> {
        match self {
            Probe::KeyExists(path) => state.key_exists(path),
            Probe::SubkeyCountAbove { path, count } => Ok(state.subkeys(path)?.len() > *count),
        }
    }
}

/// Maps a probe to the phase it signals
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseRule {
    pub probe: Probe,
    pub phase: &'static str,
    pub progress: u8,
}

/// The standard Autopilot rule table, in phase order
pub fn default_rules() -> Vec<PhaseRule> {
    vec![
        PhaseRule {
            probe: Probe::KeyExists(SETUP_STATE_KEY.to_string()),
            phase: DEVICE_SETUP,
            progress: 20,
        },
        PhaseRule {
            probe: Probe::SubkeyCountAbove {
                path: PROFILE_LIST_KEY.to_string(),
                count: 2,
            },
            phase: ACCOUNT_SETUP,
            progress: 40,
        },
        PhaseRule {
            probe: Probe::KeyExists(APPS_KEY.to_string()),
            phase: APPS_INSTALLATION,
            progress: 60,
        },
        PhaseRule {
            probe: Probe::KeyExists(POLICY_KEY.to_string()),
            phase: POLICIES_APPLICATION,
            progress: 80,
        },
        PhaseRule {
            probe: Probe::KeyExists(AUTOPILOT_CACHE_KEY.to_string()),
            phase: COMPLETION,
            progress: 100,
        },
    ]
}

/// Enrollment diagnostics folded into sample metadata
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnrollmentStatus {
    pub is_active: bool,
    pub enrollment_state: Option<i64>,
    pub last_error: Option<i64>,
    pub error: Option<String>,
}

impl EnrollmentStatus {
    /// Write `esp_active`, `enrollment_state` and `last_error` into `metadata`
    pub fn fill_metadata(&self, metadata: &mut Metadata) {
        metadata.insert("esp_active".to_string(), json!(self.is_active));
        metadata.insert(
            "enrollment_state".to_string(),
            json!(self.enrollment_state.unwrap_or(0)),
        );
        metadata.insert("last_error".to_string(), json!(self.last_error.unwrap_or(0)));
    }
}

/// Infers the current deployment phase from local system state
pub struct PhaseDetector {
    state: Box<dyn SystemState>,
    rules: Vec<PhaseRule>,
}

impl PhaseDetector {
    /// Create a detector with the default rule table
    pub fn new(state: impl SystemState + 'static) -> Self {
        Self::with_rules(state, default_rules())
    }

    pub fn with_rules(state: impl SystemState + 'static, rules: Vec<PhaseRule>) -> Self {
        Self {
            state: Box::new(state),
            rules,
        }
    }

    pub fn rules(&self) -> &[PhaseRule] {
        &self.rules
    }

    /// Detect the current phase. Never fails: errors become `Unknown`/`error`.
    pub fn detect(&self) -> PhaseInfo {
        match self.try_detect() {
            Ok(info) => info,
            Err(e) => PhaseInfo {
                phase: UNKNOWN_PHASE.to_string(),
                progress: 0,
                status: SampleStatus::Error,
                error: Some(e.to_string()),
            },
        }
    }

    fn try_detect(&self) -> Result<PhaseInfo> {
        self.state.available()?;

        let first = catalog::first_phase();
        let (phase, progress) = self
            .rules
            .iter()
            .fold((first.phase_name, 0u8), |current, rule| {
                match rule.probe.evaluate(self.state.as_ref()) {
                    Ok(true) => (rule.phase, rule.progress),
                    Ok(false) => current,
                    Err(e) => {
                        debug!("Probe for {} failed, treating as not reached: {}", rule.phase, e);
                        current
                    }
                }
            });

        Ok(PhaseInfo {
            phase: phase.to_string(),
            progress,
            status: if progress == 100 {
                SampleStatus::Completed
            } else {
                SampleStatus::InProgress
            },
            error: None,
        })
    }

    /// Inspect enrollment records. Independent of phase selection.
    pub fn enrollment_status(&self) -> EnrollmentStatus {
        match self.try_enrollment_status() {
            Ok(status) => status,
            Err(e) => EnrollmentStatus {
                is_active: false,
                error: Some(e.to_string()),
                ..Default::default()
            },
        }
    }

    fn try_enrollment_status(&self) -> Result<EnrollmentStatus> {
        for enrollment in self.state.subkeys(ENROLLMENTS_KEY)? {
            let key = format!("{}/{}", ENROLLMENTS_KEY, enrollment);
            let Some(raw_state) = self.state.read_value(&key, "EnrollmentState")? else {
                continue;
            };

            let enrollment_state = parse_int(&raw_state)?;
            let last_error = match self.state.read_value(&key, "LastError")? {
                Some(raw) => Some(parse_int(&raw)?),
                None => None,
            };

            return Ok(EnrollmentStatus {
                is_active: true,
                enrollment_state: Some(enrollment_state),
                last_error,
                error: None,
            });
        }

        Ok(EnrollmentStatus::default())
    }
}

fn parse_int(raw: &str) -> Result<i64> {
    let trimmed = raw.trim();
    let parsed = match trimmed.strip_prefix("0x") {
        Some(hex) => i64::from_str_radix(hex, 16),
        None => trimmed.parse::<i64>(),
    };
    parsed.map_err(|e| NimbusError::Probe(format!("invalid integer value '{}': {}", raw, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system_state::FsSystemState;
    use nimbus_core::catalog::DEVICE_PREPARATION;
    use std::path::Path;
    use tempfile::TempDir;

    fn mkkey(root: &Path, key: &str) {
        std::fs::create_dir_all(root.join(key)).unwrap();
    }

    /// Fails every lookup under one key, delegates the rest
    struct FlakyState {
        inner: FsSystemState,
        broken: &'static str,
    }

    impl SystemState for FlakyState {
        fn available(&self) -> Result<()> {
            self.inner.available()
        }

        fn key_exists(&self, path: &str) -> Result<bool> {
            if path == self.broken {
                return Err(NimbusError::Probe("access denied".to_string()));
            }
            self.inner.key_exists(path)
        }

        fn subkeys(&self, path: &str) -> Result<Vec<String>> {
            if path == self.broken {
                return Err(NimbusError::Probe("access denied".to_string()));
            }
            self.inner.subkeys(path)
        }

        fn read_value(&self, path: &str, name: &str) -> Result<Option<String>> {
            self.inner.read_value(path, name)
        }
    }

    #[test]
    fn test_no_signals_defaults_to_first_phase() {
        let dir = TempDir::new().unwrap();
        let detector = PhaseDetector::new(FsSystemState::new(dir.path()));

        let info = detector.detect();
        assert_eq!(info.phase, DEVICE_PREPARATION);
        assert_eq!(info.progress, 0);
        assert_eq!(info.status, SampleStatus::InProgress);
        assert!(info.error.is_none());
    }

    #[test]
    fn test_last_true_wins() {
        let dir = TempDir::new().unwrap();
        mkkey(dir.path(), APPS_KEY);
        mkkey(dir.path(), POLICY_KEY);

        let info = PhaseDetector::new(FsSystemState::new(dir.path())).detect();
        assert_eq!(info.phase, POLICIES_APPLICATION);
        assert_eq!(info.progress, 80);
    }

    #[test]
    fn test_later_signal_wins_even_without_earlier_ones() {
        let dir = TempDir::new().unwrap();
        mkkey(dir.path(), SETUP_STATE_KEY);
        mkkey(dir.path(), APPS_KEY);

        let info = PhaseDetector::new(FsSystemState::new(dir.path())).detect();
        assert_eq!(info.phase, APPS_INSTALLATION);
        assert_eq!(info.progress, 60);
    }

    #[test]
    fn test_profile_count_threshold() {
        let dir = TempDir::new().unwrap();
        for sid in ["S-1-5-18", "S-1-5-19"] {
            mkkey(dir.path(), &format!("{}/{}", PROFILE_LIST_KEY, sid));
        }
        let detector = PhaseDetector::new(FsSystemState::new(dir.path()));
        assert_eq!(detector.detect().phase, DEVICE_PREPARATION);

        mkkey(dir.path(), &format!("{}/S-1-5-21-1001", PROFILE_LIST_KEY));
        let info = detector.detect();
        assert_eq!(info.phase, ACCOUNT_SETUP);
        assert_eq!(info.progress, 40);
    }

    #[test]
    fn test_completion_sets_completed_status() {
        let dir = TempDir::new().unwrap();
        mkkey(dir.path(), AUTOPILOT_CACHE_KEY);

        let info = PhaseDetector::new(FsSystemState::new(dir.path())).detect();
        assert_eq!(info.phase, COMPLETION);
        assert_eq!(info.progress, 100);
        assert_eq!(info.status, SampleStatus::Completed);
    }

    #[test]
    fn test_failing_probe_counts_as_false() {
        let dir = TempDir::new().unwrap();
        mkkey(dir.path(), SETUP_STATE_KEY);
        mkkey(dir.path(), POLICY_KEY);

        let detector = PhaseDetector::new(FlakyState {
            inner: FsSystemState::new(dir.path()),
            broken: POLICY_KEY,
        });

        let info = detector.detect();
        assert_eq!(info.phase, DEVICE_SETUP);
        assert_eq!(info.status, SampleStatus::InProgress);
        assert!(info.error.is_none());
    }

    #[test]
    fn test_unavailable_source_reports_unknown() {
        let detector = PhaseDetector::new(FsSystemState::new("/nonexistent/nimbus/root"));

        let info = detector.detect();
        assert_eq!(info.phase, UNKNOWN_PHASE);
        assert_eq!(info.progress, 0);
        assert_eq!(info.status, SampleStatus::Error);
        assert!(info.error.unwrap().contains("not accessible"));
    }

    #[test]
    fn test_enrollment_status_reads_first_enrollment() {
        let dir = TempDir::new().unwrap();
        let key = dir.path().join(ENROLLMENTS_KEY).join("{A1B2}");
        std::fs::create_dir_all(&key).unwrap();
        std::fs::write(key.join("EnrollmentState"), "1").unwrap();
        std::fs::write(key.join("LastError"), "0x80180014").unwrap();
        mkkey(dir.path(), &format!("{}/Context", ENROLLMENTS_KEY));

        let status = PhaseDetector::new(FsSystemState::new(dir.path())).enrollment_status();
        assert!(status.is_active);
        assert_eq!(status.enrollment_state, Some(1));
        assert_eq!(status.last_error, Some(0x80180014));

        let mut metadata = Metadata::new();
        status.fill_metadata(&mut metadata);
        assert_eq!(metadata["esp_active"], json!(true));
        assert_eq!(metadata["enrollment_state"], json!(1));
    }

    #[test]
    fn test_enrollment_status_inactive_without_records() {
        let dir = TempDir::new().unwrap();
        let status = PhaseDetector::new(FsSystemState::new(dir.path())).enrollment_status();
        assert_eq!(status, EnrollmentStatus::default());

        let mut metadata = Metadata::new();
        status.fill_metadata(&mut metadata);
        assert_eq!(metadata["esp_active"], json!(false));
        assert_eq!(metadata["last_error"], json!(0));
    }

    #[test]
    fn test_enrollment_garbage_value_is_reported() {
        let dir = TempDir::new().unwrap();
        let key = dir.path().join(ENROLLMENTS_KEY).join("bad");
        std::fs::create_dir_all(&key).unwrap();
        std::fs::write(key.join("EnrollmentState"), "pending").unwrap();

        let status = PhaseDetector::new(FsSystemState::new(dir.path())).enrollment_status();
        assert!(!status.is_active);
        assert!(status.error.is_some());
    }
}
