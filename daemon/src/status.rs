use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{error, warn};

use crate::dash_manager::ActiveDash;
use crate::dash_variant::DashType;
use crate::hover::HoverStatus;
use crate::services::ServiceState;

/// Runtime status written by the daemon to %APPDATA%\PCVR Nexus\status.toml.
/// Front-ends read this file (read-only) to display daemon state.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DaemonStatus {
    /// Daemon binary version (set from Cargo.toml at compile time).
    pub version: String,
    /// What currently occupies the runtime's dash slot.
    pub current_dash: ActiveDash,
    pub current_dash_name: String,
    pub normal_installed: bool,
    pub oculus_killer_installed: bool,
    pub steamvr_running: bool,
    pub link_service: ServiceState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_activation_dash: Option<DashType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_activation_succeeded: Option<bool>,
    /// RFC 3339 timestamp of the most recent activation attempt, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_activation_timestamp: Option<String>,
    /// Human-readable error message if the daemon encountered a non-fatal error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Hover buttons, kept last because it serializes as a TOML table.
    #[serde(default)]
    pub hover: HoverStatus,
}

impl DaemonStatus {
    pub fn new() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            current_dash: ActiveDash::Missing,
            current_dash_name: "Missing".to_string(),
            normal_installed: false,
            oculus_killer_installed: false,
            steamvr_running: false,
            link_service: ServiceState::NotFound,
            last_activation_dash: None,
            last_activation_succeeded: None,
            last_activation_timestamp: None,
            error: None,
            hover: HoverStatus::default(),
        }
    }

    /// Records an activation attempt stamped with the current local time.
    pub fn record_activation(&mut self, dash: DashType, succeeded: bool) {
        self.last_activation_dash = Some(dash);
        self.last_activation_succeeded = Some(succeeded);
        self.last_activation_timestamp = Some(chrono::Local::now().to_rfc3339());
    }
}

impl Default for DaemonStatus {
    fn default() -> Self {
        Self::new()
    }
}

/// Serializes `status` to TOML and writes it to `path`.
/// Creates the parent directory if it does not exist.
/// Failures are logged; a status write never stops the daemon.
pub fn write_status(path: &Path, status: &DaemonStatus) {
    if let Some(parent) = path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            warn!(dir = %parent.display(), error = %e, "failed to create status directory");
            return;
        }
    }
    match toml::to_string_pretty(status) {
        Ok(content) => {
            if let Err(e) = std::fs::write(path, content) {
                warn!(path = %path.display(), error = %e, "failed to write status file");
            }
        }
        Err(e) => error!(error = %e, "failed to serialize status"),
    }
}
