//! Persisted agent state
//!
//! A single small JSON document survives restarts so the agent keeps its
//! deployment start time and change-detection baseline. The file is
//! rewritten in full on every save.

use chrono::{DateTime, Utc};
use nimbus_core::{NimbusError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const STATE_FILE_NAME: &str = "telemetry-state.json";

/// Contents of the state document
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentState {
    #[serde(default)]
    pub deployment_start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_phase: Option<String>,
    #[serde(default)]
    pub last_progress: Option<u8>,
}

/// Per-machine state location
pub fn default_state_path() -> PathBuf {
    if cfg!(windows) {
        let base = std::env::var_os("ProgramData")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(r"C:\ProgramData"));
        base.join("Nimbus").join(STATE_FILE_NAME)
    } else {
        PathBuf::from("/var/lib/nimbus").join(STATE_FILE_NAME)
    }
}

/// Durable key/value state for one agent
#[derive(Debug)]
pub struct AgentStateStore {
    path: PathBuf,
    state: AgentState,
}

impl AgentStateStore {
    /// Open the store. A missing or unreadable document yields empty state.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let state = Self::load(&path);
        Self { path, state }
    }

    fn load(path: &Path) -> AgentState {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) => {
                debug!("No agent state at {}: {}", path.display(), e);
                return AgentState::default();
            }
        };

        match serde_json::from_str(&content) {
            Ok(state) => state,
            Err(e) => {
                warn!("Discarding corrupt agent state at {}: {}", path.display(), e);
                AgentState::default()
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> &AgentState {
        &self.state
    }

    pub fn deployment_start_time(&self) -> Option<DateTime<Utc>> {
        self.state.deployment_start_time
    }

    pub fn last_phase(&self) -> Option<&str> {
        self.state.last_phase.as_deref()
    }

    pub fn last_progress(&self) -> Option<u8> {
        self.state.last_progress
    }

    pub fn save_deployment_start_time(&mut self, at: DateTime<Utc>) -> Result<()> {
        self.state.deployment_start_time = Some(at);
        self.persist()
    }

    pub fn save_last_phase(&mut self, phase: &str) -> Result<()> {
        self.state.last_phase = Some(phase.to_string());
        self.persist()
    }

    pub fn save_last_progress(&mut self, progress: u8) -> Result<()> {
        self.state.last_progress = Some(progress);
        self.persist()
    }

    /// Record the baseline of a delivered sample in one rewrite
    pub fn save_last_reported(&mut self, phase: &str, progress: u8) -> Result<()> {
        self.state.last_phase = Some(phase.to_string());
        self.state.last_progress = Some(progress);
        self.persist()
    }

    fn persist(&self) -> Result<()> {
        self.write().map_err(|e| {
            NimbusError::Persistence(format!(
                "failed to write agent state to {}: {}",
                self.path.display(),
                e
            ))
        })
    }

    fn write(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let content = serde_json::to_string_pretty(&self.state)?;
        std::fs::write(&self.path, content)?;
        Ok(())
    }
}
