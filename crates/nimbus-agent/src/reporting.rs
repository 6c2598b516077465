//! The agent's reporting loop
//!
//! Samples the deployment phase on a fixed interval and forwards only
//! meaningful changes, interleaved with periodic heartbeats. After the
//! deployment completes the loop drops into maintenance mode and only
//! heartbeats remain. Cancellation is the sole way out.

use crate::client::{DeliveryClient, TelemetrySink};
use crate::detector::{EnrollmentStatus, PhaseDetector};
use crate::identity::DeviceIdentity;
use crate::state_store::{default_state_path, AgentStateStore};
use crate::system_state::FsSystemState;
use chrono::{DateTime, Utc};
use nimbus_core::catalog::SERVICE_RUNNING;
use nimbus_core::{
    AgentSettings, EventType, Metadata, PhaseInfo, Result, SampleStatus, TelemetrySample,
};
use serde_json::json;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Smallest progress delta worth reporting on its own
pub const PROGRESS_THRESHOLD: u8 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Sampling,
    Maintenance,
    Stopped,
}

/// Decide whether a detection result is worth sending
///
/// `baseline` is the phase and progress of the last sample the server
/// accepted.
pub fn should_send(baseline: Option<(&str, u8)>, info: &PhaseInfo) -> bool {
    if matches!(info.status, SampleStatus::Completed | SampleStatus::Error) {
        return true;
    }
    match baseline {
        None => true,
        Some((phase, progress)) => {
            phase != info.phase || progress.abs_diff(info.progress) >= PROGRESS_THRESHOLD
        }
    }
}

pub struct ReportingLoop<S: TelemetrySink> {
    settings: AgentSettings,
    identity: DeviceIdentity,
    detector: PhaseDetector,
    sink: S,
    store: AgentStateStore,
    state: LoopState,
    started: Instant,
    last_heartbeat: Instant,
    deployment_start: DateTime<Utc>,
}

impl ReportingLoop<DeliveryClient> {
    /// Wire up the production loop from agent settings
    pub fn from_settings(settings: AgentSettings) -> Result<Self> {
        settings.validate()?;

        let identity = DeviceIdentity::resolve(&settings);
        let detector = PhaseDetector::new(FsSystemState::new(settings.system_state_root.clone()));
        let sink = DeliveryClient::new(&settings)?;
        let store = AgentStateStore::open(
            settings
                .state_path
                .clone()
                .unwrap_or_else(default_state_path),
        );

        Ok(Self::new(settings, identity, detector, sink, store))
    }
}

impl<S: TelemetrySink> ReportingLoop<S> {
    pub fn new(
        settings: AgentSettings,
        identity: DeviceIdentity,
        detector: PhaseDetector,
        sink: S,
        store: AgentStateStore,
    ) -> Self {
        let now = Instant::now();
        Self {
            settings,
            identity,
            detector,
            sink,
            store,
            state: LoopState::Sampling,
            started: now,
            last_heartbeat: now,
            deployment_start: Utc::now(),
        }
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    /// Run until `cancel` fires. Always ends in `LoopState::Stopped`.
    pub async fn run(mut self, cancel: CancellationToken) -> LoopState {
        self.start();
        info!(
            "Reporting loop started for {} (profile {})",
            self.identity.client_id, self.identity.deployment_profile
        );

        loop {
            if cancel.is_cancelled() {
                self.state = LoopState::Stopped;
            }

            match self.state {
                LoopState::Sampling => {
                    self.sample_once(&cancel).await;
                    if self.state == LoopState::Sampling
                        && !sleep_or_cancel(&cancel, self.settings.interval()).await
                    {
                        self.state = LoopState::Stopped;
                    }
                }
                LoopState::Maintenance => {
                    if sleep_or_cancel(&cancel, self.settings.maintenance_interval()).await {
                        self.send_heartbeat(&cancel).await;
                    } else {
                        self.state = LoopState::Stopped;
                    }
                }
                LoopState::Stopped => break,
            }
        }

        info!("Reporting loop stopped");
        self.state
    }

    fn start(&mut self) {
        let now = Instant::now();
        self.started = now;
        self.last_heartbeat = now;

        self.deployment_start = match self.store.deployment_start_time() {
            Some(at) => at,
            None => {
                let at = Utc::now();
                if let Err(e) = self.store.save_deployment_start_time(at) {
                    warn!("Could not persist deployment start time: {}", e);
                }
                at
            }
        };
    }

    async fn sample_once(&mut self, cancel: &CancellationToken) {
        if self.last_heartbeat.elapsed() >= self.settings.heartbeat_interval() {
            self.send_heartbeat(cancel).await;
        }

        let info = self.detector.detect();
        let enrollment = self.detector.enrollment_status();
        let sample = self.progress_sample(&info, &enrollment);

        let baseline = self
            .store
            .last_phase()
            .zip(self.store.last_progress());

        if should_send(baseline, &info) {
            info!(
                "Reporting {} at {}% ({})",
                info.phase, info.progress, info.status
            );
            if self.sink.send(&sample, cancel).await {
                if let Err(e) = self.store.save_last_reported(&info.phase, info.progress) {
                    warn!("Could not persist reported baseline: {}", e);
                }
            }
        } else {
            debug!(
                "No significant change ({} at {}%), skipping sample",
                info.phase, info.progress
            );
        }

        if info.status == SampleStatus::Completed {
            let completion = TelemetrySample {
                event_type: EventType::Completion,
                ..sample
            };
            if !self.sink.send(&completion, cancel).await {
                warn!("Completion sample was not delivered");
            }
            info!("Deployment completed, entering maintenance mode");
            self.state = LoopState::Maintenance;
        }
    }

    async fn send_heartbeat(&mut self, cancel: &CancellationToken) {
        self.last_heartbeat = Instant::now();

        let mut metadata = Metadata::new();
        metadata.insert(
            "service_uptime_seconds".to_string(),
            json!(self.started.elapsed().as_secs()),
        );
        metadata.insert("os_version".to_string(), json!(self.identity.os_version));

        let heartbeat = TelemetrySample {
            client_id: self.identity.client_id.clone(),
            device_name: self.identity.device_name.clone(),
            deployment_profile: self.identity.deployment_profile.clone(),
            phase_name: SERVICE_RUNNING.to_string(),
            event_type: EventType::Heartbeat,
            event_timestamp: Utc::now(),
            progress_percentage: 0,
            status: SampleStatus::Active,
            duration_seconds: (Utc::now() - self.deployment_start).num_seconds().max(0),
            error_message: None,
            metadata,
        };

        if self.sink.send(&heartbeat, cancel).await {
            debug!("Heartbeat sent");
        } else {
            warn!("Heartbeat was not delivered");
        }
    }

    fn progress_sample(&self, info: &PhaseInfo, enrollment: &EnrollmentStatus) -> TelemetrySample {
        let now = Utc::now();

        let mut metadata = Metadata::new();
        enrollment.fill_metadata(&mut metadata);
        metadata.insert("os_version".to_string(), json!(self.identity.os_version));

        TelemetrySample {
            client_id: self.identity.client_id.clone(),
            device_name: self.identity.device_name.clone(),
            deployment_profile: self.identity.deployment_profile.clone(),
            phase_name: info.phase.clone(),
            event_type: EventType::Progress,
            event_timestamp: now,
            progress_percentage: info.progress,
            status: info.status,
            duration_seconds: (now - self.deployment_start).num_seconds().max(0),
            error_message: info.error.clone(),
            metadata,
        }
    }
}

/// Sleep for `duration`; false when cancelled first
async fn sleep_or_cancel(cancel: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::{APPS_KEY, AUTOPILOT_CACHE_KEY, SETUP_STATE_KEY};
    use crate::state_store::STATE_FILE_NAME;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use nimbus_core::catalog::{APPS_INSTALLATION, COMPLETION, DEVICE_SETUP, UNKNOWN_PHASE};
    use std::path::{Path, PathBuf};
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    #[derive(Clone)]
    struct RecordingSink {
        sent: Arc<Mutex<Vec<TelemetrySample>>>,
        accept: bool,
    }

    impl RecordingSink {
        fn new(accept: bool) -> Self {
            Self {
                sent: Arc::new(Mutex::new(Vec::new())),
                accept,
            }
        }

        fn sent(&self) -> Vec<TelemetrySample> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl TelemetrySink for RecordingSink {
        async fn send(&self, sample: &TelemetrySample, _cancel: &CancellationToken) -> bool {
            self.sent.lock().unwrap().push(sample.clone());
            self.accept
        }
    }

    struct Fixture {
        dir: TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            std::fs::create_dir_all(dir.path().join("state")).unwrap();
            Self { dir }
        }

        fn root(&self) -> PathBuf {
            self.dir.path().join("state")
        }

        fn state_file(&self) -> PathBuf {
            self.dir.path().join("data").join(STATE_FILE_NAME)
        }

        fn add_key(&self, key: &str) {
            std::fs::create_dir_all(self.root().join(key)).unwrap();
        }

        fn build(&self, sink: RecordingSink) -> ReportingLoop<RecordingSink> {
            self.build_with_root(sink, &self.root())
        }

        fn build_with_root(&self, sink: RecordingSink, root: &Path) -> ReportingLoop<RecordingSink> {
            let settings = AgentSettings {
                api_key: "secret".to_string(),
                ..Default::default()
            };
            let identity = DeviceIdentity {
                client_id: "PC1-SN123".to_string(),
                device_name: "PC1".to_string(),
                deployment_profile: "Standard".to_string(),
                os_version: "linux x86_64".to_string(),
            };
            ReportingLoop::new(
                settings,
                identity,
                PhaseDetector::new(FsSystemState::new(root)),
                sink,
                AgentStateStore::open(self.state_file()),
            )
        }
    }

    async fn run_for(reporting: ReportingLoop<RecordingSink>, secs: u64) -> LoopState {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(reporting.run(cancel.clone()));
        tokio::time::sleep(Duration::from_secs(secs)).await;
        cancel.cancel();
        handle.await.unwrap()
    }

    fn info(phase: &str, progress: u8, status: SampleStatus) -> PhaseInfo {
        PhaseInfo {
            phase: phase.to_string(),
            progress,
            status,
            error: None,
        }
    }

    #[test]
    fn test_change_detection_boundary() {
        let baseline = Some(("Apps Installation", 50));
        assert!(!should_send(
            baseline,
            &info("Apps Installation", 53, SampleStatus::InProgress)
        ));
        assert!(should_send(
            baseline,
            &info("Apps Installation", 55, SampleStatus::InProgress)
        ));
        assert!(should_send(
            baseline,
            &info("Apps Installation", 45, SampleStatus::InProgress)
        ));
    }

    #[test]
    fn test_phase_change_or_terminal_status_always_sends() {
        let baseline = Some(("Apps Installation", 60));
        assert!(should_send(
            baseline,
            &info("Policies Application", 60, SampleStatus::InProgress)
        ));
        assert!(should_send(
            Some(("Completion", 100)),
            &info("Completion", 100, SampleStatus::Completed)
        ));
        assert!(should_send(
            Some(("Unknown", 0)),
            &info("Unknown", 0, SampleStatus::Error)
        ));
        assert!(should_send(None, &info("Device Setup", 20, SampleStatus::InProgress)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unchanged_phase_sends_once_then_heartbeat() {
        let fixture = Fixture::new();
        fixture.add_key(SETUP_STATE_KEY);
        let sink = RecordingSink::new(true);

        let state = run_for(fixture.build(sink.clone()), 301).await;
        assert_eq!(state, LoopState::Stopped);

        let sent = sink.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].event_type, EventType::Progress);
        assert_eq!(sent[0].phase_name, DEVICE_SETUP);
        assert_eq!(sent[0].progress_percentage, 20);
        assert_eq!(sent[0].metadata["esp_active"], json!(false));
        assert_eq!(sent[0].metadata["os_version"], json!("linux x86_64"));

        assert_eq!(sent[1].event_type, EventType::Heartbeat);
        assert_eq!(sent[1].phase_name, SERVICE_RUNNING);
        assert_eq!(sent[1].status, SampleStatus::Active);
        assert_eq!(sent[1].metadata["service_uptime_seconds"], json!(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_carries_deployment_duration() {
        let fixture = Fixture::new();
        fixture.add_key(SETUP_STATE_KEY);
        let start = Utc::now() - chrono::Duration::hours(2);
        {
            let mut store = AgentStateStore::open(fixture.state_file());
            store.save_deployment_start_time(start).unwrap();
            store.save_last_reported(DEVICE_SETUP, 20).unwrap();
        }
        let sink = RecordingSink::new(true);

        run_for(fixture.build(sink.clone()), 301).await;

        let sent = sink.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].event_type, EventType::Heartbeat);
        assert!(sent[0].duration_seconds >= 7200);
    }

    #[tokio::test(start_paused = true)]
    async fn test_phase_change_is_reported() {
        let fixture = Fixture::new();
        fixture.add_key(SETUP_STATE_KEY);
        let sink = RecordingSink::new(true);

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(fixture.build(sink.clone()).run(cancel.clone()));
        tokio::time::sleep(Duration::from_secs(45)).await;
        fixture.add_key(APPS_KEY);
        tokio::time::sleep(Duration::from_secs(30)).await;
        cancel.cancel();
        handle.await.unwrap();

        let phases: Vec<String> = sink.sent().into_iter().map(|s| s.phase_name).collect();
        assert_eq!(phases, vec![DEVICE_SETUP, APPS_INSTALLATION]);

        let store = AgentStateStore::open(fixture.state_file());
        assert_eq!(store.last_phase(), Some(APPS_INSTALLATION));
        assert_eq!(store.last_progress(), Some(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_completion_enters_maintenance() {
        let fixture = Fixture::new();
        fixture.add_key(AUTOPILOT_CACHE_KEY);
        let sink = RecordingSink::new(true);

        run_for(fixture.build(sink.clone()), 1201).await;

        let kinds: Vec<EventType> = sink.sent().iter().map(|s| s.event_type).collect();
        assert_eq!(
            kinds,
            vec![
                EventType::Progress,
                EventType::Completion,
                EventType::Heartbeat,
                EventType::Heartbeat,
            ]
        );
        let sent = sink.sent();
        assert_eq!(sent[1].phase_name, COMPLETION);
        assert_eq!(sent[1].status, SampleStatus::Completed);
        assert_eq!(sent[1].progress_percentage, 100);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_send_keeps_baseline() {
        let fixture = Fixture::new();
        fixture.add_key(SETUP_STATE_KEY);
        let sink = RecordingSink::new(false);

        run_for(fixture.build(sink.clone()), 31).await;

        assert_eq!(sink.sent().len(), 2);
        let store = AgentStateStore::open(fixture.state_file());
        assert!(store.last_phase().is_none());
        assert!(store.last_progress().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_persisted_baseline_suppresses_resend() {
        let fixture = Fixture::new();
        fixture.add_key(SETUP_STATE_KEY);
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        {
            let mut store = AgentStateStore::open(fixture.state_file());
            store.save_deployment_start_time(start).unwrap();
            store.save_last_reported(DEVICE_SETUP, 20).unwrap();
        }
        let sink = RecordingSink::new(true);

        run_for(fixture.build(sink.clone()), 61).await;

        assert!(sink.sent().is_empty());
        let store = AgentStateStore::open(fixture.state_file());
        assert_eq!(store.deployment_start_time(), Some(start));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_time_initialized_and_used_for_duration() {
        let fixture = Fixture::new();
        fixture.add_key(SETUP_STATE_KEY);
        let start = Utc::now() - chrono::Duration::hours(1);
        {
            let mut store = AgentStateStore::open(fixture.state_file());
            store.save_deployment_start_time(start).unwrap();
        }
        let sink = RecordingSink::new(true);

        run_for(fixture.build(sink.clone()), 1).await;

        let sent = sink.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].duration_seconds >= 3600);

        let fresh = Fixture::new();
        run_for(fresh.build(RecordingSink::new(true)), 1).await;
        assert!(AgentStateStore::open(fresh.state_file())
            .deployment_start_time()
            .is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_detection_error_is_sent_every_iteration() {
        let fixture = Fixture::new();
        let sink = RecordingSink::new(true);
        let missing = fixture.dir.path().join("missing-root");

        run_for(fixture.build_with_root(sink.clone(), &missing), 61).await;

        let sent = sink.sent();
        assert_eq!(sent.len(), 3);
        assert!(sent.iter().all(|s| s.phase_name == UNKNOWN_PHASE));
        assert!(sent.iter().all(|s| s.status == SampleStatus::Error));
        assert!(sent[0].error_message.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_before_start_stops_immediately() {
        let fixture = Fixture::new();
        let sink = RecordingSink::new(true);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let state = fixture.build(sink.clone()).run(cancel).await;
        assert_eq!(state, LoopState::Stopped);
        assert!(sink.sent().is_empty());
    }
}
