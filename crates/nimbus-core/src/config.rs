//! Configuration management for Nimbus
//!
//! Both the agent and the ingestion service read one TOML file with an
//! `[agent]` and a `[server]` section. Missing keys fall back to defaults,
//! and `NIMBUS_API_KEY` overrides the shared secret in both sections.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{NimbusError, Result};

/// Environment variable that overrides the configured API key
pub const API_KEY_ENV: &str = "NIMBUS_API_KEY";

/// Top-level configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NimbusConfig {
    #[serde(default)]
    pub agent: AgentSettings,

    #[serde(default)]
    pub server: ServerSettings,
}

/// Device agent settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSettings {
    /// Base URL of the ingestion service
    #[serde(default = "default_api_endpoint")]
    pub api_endpoint: String,

    /// Shared secret sent as `X-API-Key`
    #[serde(default)]
    pub api_key: String,

    /// Deployment profile reported with every sample
    #[serde(default = "default_deployment_profile")]
    pub deployment_profile: String,

    /// Seconds between sampling iterations
    #[serde(default = "default_interval_seconds")]
    pub interval_seconds: u64,

    /// Seconds between heartbeats while sampling
    #[serde(default = "default_heartbeat_interval_seconds")]
    pub heartbeat_interval_seconds: u64,

    /// Seconds between heartbeats once deployment completed
    #[serde(default = "default_maintenance_interval_seconds")]
    pub maintenance_interval_seconds: u64,

    /// Additional delivery attempts after the first one
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Per-request HTTP timeout
    #[serde(default = "default_request_timeout_seconds")]
    pub request_timeout_seconds: u64,

    /// State file location (platform default when unset)
    #[serde(default)]
    pub state_path: Option<PathBuf>,

    /// Root of the system-state tree inspected by the phase probes
    #[serde(default = "default_system_state_root")]
    pub system_state_root: PathBuf,

    /// Overrides the hardware-derived client id
    #[serde(default)]
    pub client_id: Option<String>,

    /// Overrides the detected host name
    #[serde(default)]
    pub device_name: Option<String>,
}

/// Ingestion service settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Address the HTTP API listens on
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Path of the embedded database file
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// Shared secret expected in `X-API-Key`
    #[serde(default)]
    pub api_key: String,

    /// Live-update queue depth per subscriber
    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,
}

// Default value providers
fn default_api_endpoint() -> String {
    "http://localhost:5000".to_string()
}

fn default_deployment_profile() -> String {
    "Standard".to_string()
}

fn default_interval_seconds() -> u64 {
    30
}

fn default_heartbeat_interval_seconds() -> u64 {
    300
}

fn default_maintenance_interval_seconds() -> u64 {
    600
}

fn default_max_retries() -> u32 {
    3
}

fn default_request_timeout_seconds() -> u64 {
    30
}

fn default_system_state_root() -> PathBuf {
    PathBuf::from("/")
}

fn default_bind_addr() -> String {
    "0.0.0.0:5000".to_string()
}

fn default_database_path() -> PathBuf {
    PathBuf::from("nimbus-data/nimbus.db")
}

fn default_broadcast_capacity() -> usize {
    256
}

impl NimbusConfig {
    /// Load configuration from `path`, or use defaults when the file is absent
    pub fn load_or_default(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            toml::from_str(&content)
                .map_err(|e| NimbusError::Config(format!("Failed to parse config file: {}", e)))?
        } else {
            Self::default()
        };

        if let Ok(key) = std::env::var(API_KEY_ENV) {
            config.apply_api_key(key);
        }

        Ok(config)
    }

    /// Write the default configuration to `path`
    pub fn write_default(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let content = toml::to_string_pretty(&Self::default())
            .map_err(|e| NimbusError::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    fn apply_api_key(&mut self, key: String) {
        if key.is_empty() {
            return;
        }
        self.agent.api_key = key.clone();
        self.server.api_key = key;
    }
}

impl AgentSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_seconds)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_seconds)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }

    /// Check the settings the agent cannot run without
    pub fn validate(&self) -> Result<()> {
        if self.api_endpoint.trim().is_empty() {
            return Err(NimbusError::Config("agent.api_endpoint is required".to_string()));
        }
        if self.api_key.is_empty() {
            return Err(NimbusError::Config(format!(
                "agent.api_key is required (or set {})",
                API_KEY_ENV
            )));
        }
        for (name, value) in [
            ("interval_seconds", self.interval_seconds),
            ("heartbeat_interval_seconds", self.heartbeat_interval_seconds),
            ("maintenance_interval_seconds", self.maintenance_interval_seconds),
        ] {
            if value == 0 {
                return Err(NimbusError::Config(format!(
                    "agent.{} must be positive",
                    name
                )));
            }
        }
        Ok(())
    }
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            api_endpoint: default_api_endpoint(),
            api_key: String::new(),
            deployment_profile: default_deployment_profile(),
            interval_seconds: default_interval_seconds(),
            heartbeat_interval_seconds: default_heartbeat_interval_seconds(),
            maintenance_interval_seconds: default_maintenance_interval_seconds(),
            max_retries: default_max_retries(),
            request_timeout_seconds: default_request_timeout_seconds(),
            state_path: None,
            system_state_root: default_system_state_root(),
            client_id: None,
            device_name: None,
        }
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            database_path: default_database_path(),
            api_key: String::new(),
            broadcast_capacity: default_broadcast_capacity(),
        }
    }
}
