//! Device identity

use nimbus_core::AgentSettings;
use std::path::Path;

const UNKNOWN_SERIAL: &str = "UNKNOWN";
const SERIAL_PATHS: &[&str] = &[
    "/sys/class/dmi/id/product_serial",
    "/sys/class/dmi/id/board_serial",
];

/// Who this agent reports as
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub client_id: String,
    pub device_name: String,
    pub deployment_profile: String,
    pub os_version: String,
}

impl DeviceIdentity {
    /// Resolve the identity from the host, applying config overrides
    pub fn resolve(settings: &AgentSettings) -> Self {
        let device_name = settings
            .device_name
            .clone()
            .filter(|n| !n.is_empty())
            .unwrap_or_else(host_name);

        let client_id = settings
            .client_id
            .clone()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| client_id_for(&device_name, hardware_serial().as_deref()));

        Self {
            client_id,
            device_name,
            deployment_profile: settings.deployment_profile.clone(),
            os_version: os_version(),
        }
    }
}

/// `{device}-{serial}`, with `UNKNOWN` standing in for a missing serial
pub fn client_id_for(device_name: &str, serial: Option<&str>) -> String {
    let serial = serial
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(UNKNOWN_SERIAL);
    format!("{}-{}", device_name, serial)
}

fn host_name() -> String {
    for var in ["COMPUTERNAME", "HOSTNAME"] {
        if let Ok(name) = std::env::var(var) {
            if !name.trim().is_empty() {
                return name.trim().to_string();
            }
        }
    }

    std::fs::read_to_string("/etc/hostname")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

fn hardware_serial() -> Option<String> {
    SERIAL_PATHS
        .iter()
        .filter_map(|p| read_trimmed(Path::new(p)))
        .next()
}

fn read_trimmed(path: &Path) -> Option<String> {
    std::fs::read_to_string(path)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn os_version() -> String {
    format!("{} {}", std::env::consts::OS, std::env::consts::ARCH)
}
