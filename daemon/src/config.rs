use anyhow::{Context, Result};
use notify::{Config as NotifyConfig, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::event::ManagerEvent;

pub const DEFAULT_SERVICE_NAME: &str = "OVRService";
pub const DEFAULT_LIBRARY_SERVICE_NAME: &str = "OVRLibraryService";
pub const DEFAULT_SERVICE_TIMEOUT_SECS: u64 = 30;
pub const MIN_SERVICE_TIMEOUT_SECS: u64 = 1;
pub const MAX_SERVICE_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_RESTART_DELAY_SECS: u64 = 2;
pub const DEFAULT_FAST_SWITCH_ATTEMPTS: u32 = 10;
pub const DEFAULT_HOVER_SECS: u32 = 5;
pub const MIN_HOVER_SECS: u32 = 1;
pub const MAX_HOVER_SECS: u32 = 30;
pub const DEFAULT_HOVER_POLL_MS: u64 = 100;
pub const DEFAULT_WATCHER_POLL_MS: u64 = 1000;
pub const DEFAULT_LOG_LEVEL: &str = "info";
/// Issuer of the certificate Oculus signs the stock dash with.
pub const DEFAULT_TRUSTED_ISSUER: &str =
    "CN=DigiCert SHA2 Assured ID Code Signing CA, OU=www.digicert.com, O=DigiCert Inc, C=US";

/// Root configuration structure. Deserialized from %APPDATA%\PCVR Nexus\config.toml.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub dash: DashConfig,
    #[serde(default)]
    pub link: LinkConfig,
    #[serde(default)]
    pub hover: HoverConfig,
    #[serde(default)]
    pub watcher: WatcherConfig,
    #[serde(default)]
    pub log: LogConfig,
}

/// Dash switching behaviour.
#[derive(Debug, Deserialize, Clone)]
pub struct DashConfig {
    /// Use the fast (rename-aside) activation strategy instead of the safe copy.
    #[serde(default = "default_true")]
    pub fast_switch: bool,
    /// Overrides `%OculusBase%` when the runtime lives somewhere unusual.
    #[serde(default)]
    pub oculus_base: Option<PathBuf>,
    /// Signer issuer that marks the stock dash as genuine.
    #[serde(default = "default_trusted_issuer")]
    pub trusted_issuer: String,
    /// Retry budget for the fast transition used by hover activation.
    #[serde(default = "default_fast_switch_attempts")]
    pub fast_switch_attempts: u32,
}

impl Default for DashConfig {
    fn default() -> Self {
        Self {
            fast_switch: true,
            oculus_base: None,
            trusted_issuer: DEFAULT_TRUSTED_ISSUER.to_string(),
            fast_switch_attempts: DEFAULT_FAST_SWITCH_ATTEMPTS,
        }
    }
}

/// Oculus Link service handling.
#[derive(Debug, Deserialize, Clone)]
pub struct LinkConfig {
    #[serde(default = "default_service_name")]
    pub service_name: String,
    #[serde(default = "default_library_service_name")]
    pub library_service_name: String,
    /// Bounded wait for service start/stop. Clamped to [1, 120].
    #[serde(default = "default_service_timeout")]
    pub service_timeout_secs: u64,
    /// Delay before the link is brought back after a SteamVR reset.
    #[serde(default = "default_restart_delay")]
    pub restart_delay_secs: u64,
    /// Reset the link when the user quits SteamVR.
    #[serde(default)]
    pub exit_link_on_user_exit_steamvr: bool,
    /// Stop manual-start Oculus services when the daemon exits.
    #[serde(default)]
    pub close_services_on_exit: bool,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            library_service_name: DEFAULT_LIBRARY_SERVICE_NAME.to_string(),
            service_timeout_secs: DEFAULT_SERVICE_TIMEOUT_SECS,
            restart_delay_secs: DEFAULT_RESTART_DELAY_SECS,
            exit_link_on_user_exit_steamvr: false,
            close_services_on_exit: false,
        }
    }
}

impl LinkConfig {
    pub fn service_timeout(&self) -> Duration {
        Duration::from_secs(
            self.service_timeout_secs
                .clamp(MIN_SERVICE_TIMEOUT_SECS, MAX_SERVICE_TIMEOUT_SECS),
        )
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_secs(self.restart_delay_secs)
    }
}

/// Hover-to-activate buttons.
#[derive(Debug, Deserialize, Clone)]
pub struct HoverConfig {
    /// Seconds of continuous hover before the action fires. Clamped to [1, 30].
    #[serde(default = "default_hover_secs")]
    pub activation_secs: u32,
    #[serde(default = "default_hover_poll")]
    pub poll_interval_ms: u64,
    /// Let hover buttons fire even when SteamVR is not running.
    #[serde(default)]
    pub ignore_steamvr_status: bool,
}

impl Default for HoverConfig {
    fn default() -> Self {
        Self {
            activation_secs: DEFAULT_HOVER_SECS,
            poll_interval_ms: DEFAULT_HOVER_POLL_MS,
            ignore_steamvr_status: false,
        }
    }
}

impl HoverConfig {
    pub fn threshold(&self) -> Duration {
        Duration::from_secs(u64::from(
            self.activation_secs.clamp(MIN_HOVER_SECS, MAX_HOVER_SECS),
        ))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(10))
    }
}

/// Process watcher tuning.
#[derive(Debug, Deserialize, Clone)]
pub struct WatcherConfig {
    #[serde(default = "default_watcher_poll")]
    pub poll_interval_ms: u64,
    /// Process names never reported to subscribers (e.g. "svchost.exe").
    #[serde(default)]
    pub ignored_processes: Vec<String>,
}

impl WatcherConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(50))
    }
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_WATCHER_POLL_MS,
            ignored_processes: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: DEFAULT_LOG_LEVEL.to_string(),
        }
    }
}

/// Loads the config file at `path`, returning `Config::default()` if the file does not exist.
/// Returns an error if the file exists but cannot be read or parsed.
pub fn load_or_default(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Spawns a file watcher on the parent directory of `path`.  Whenever the config
/// file is created or modified, reloads it and sends a `ConfigReloaded` event.
pub async fn watch_config(path: PathBuf, tx: mpsc::Sender<ManagerEvent>) {
    let (watch_tx, mut watch_rx) = mpsc::channel::<notify::Event>(16);

    let mut watcher = match RecommendedWatcher::new(
        move |res: notify::Result<notify::Event>| {
            if let Ok(event) = res {
                let _ = watch_tx.blocking_send(event);
            }
        },
        NotifyConfig::default(),
    ) {
        Ok(w) => w,
        Err(e) => {
            warn!(error = %e, "failed to create config watcher");
            return;
        }
    };

    // Watch the parent directory rather than the file directly so we catch
    // editor-style atomic saves (write-new + rename).
    let Some(watch_dir) = path.parent().map(Path::to_path_buf) else {
        warn!(path = %path.display(), "config path has no parent directory");
        return;
    };

    if let Err(e) = watcher.watch(&watch_dir, RecursiveMode::NonRecursive) {
        warn!(error = %e, dir = %watch_dir.display(), "failed to watch config directory");
        return;
    }

    while let Some(event) = watch_rx.recv().await {
        let affects_config = event.paths.iter().any(|p| p == path.as_path());
        let is_write = matches!(
            event.kind,
            notify::EventKind::Create(_) | notify::EventKind::Modify(_)
        );

        if affects_config && is_write {
            match load_or_default(&path) {
                Ok(config) => {
                    debug!("config file changed, reloading");
                    if tx.send(ManagerEvent::ConfigReloaded(config)).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!(error = %format!("{e:#}"), "failed to reload config"),
            }
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_trusted_issuer() -> String {
    DEFAULT_TRUSTED_ISSUER.to_string()
}

fn default_fast_switch_attempts() -> u32 {
    DEFAULT_FAST_SWITCH_ATTEMPTS
}

fn default_service_name() -> String {
    DEFAULT_SERVICE_NAME.to_string()
}

fn default_library_service_name() -> String {
    DEFAULT_LIBRARY_SERVICE_NAME.to_string()
}

fn default_service_timeout() -> u64 {
    DEFAULT_SERVICE_TIMEOUT_SECS
}

fn default_restart_delay() -> u64 {
    DEFAULT_RESTART_DELAY_SECS
}

fn default_hover_secs() -> u32 {
    DEFAULT_HOVER_SECS
}

fn default_hover_poll() -> u64 {
    DEFAULT_HOVER_POLL_MS
}

fn default_watcher_poll() -> u64 {
    DEFAULT_WATCHER_POLL_MS
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── defaults ──────────────────────────────────────────────────────────────

    #[test]
    fn dash_config_default_values() {
        let d = DashConfig::default();
        assert!(d.fast_switch);
        assert!(d.oculus_base.is_none());
        assert_eq!(d.trusted_issuer, DEFAULT_TRUSTED_ISSUER);
        assert_eq!(d.fast_switch_attempts, DEFAULT_FAST_SWITCH_ATTEMPTS);
    }

    #[test]
    fn link_config_default_values() {
        let l = LinkConfig::default();
        assert_eq!(l.service_name, "OVRService");
        assert_eq!(l.library_service_name, "OVRLibraryService");
        assert_eq!(l.service_timeout(), Duration::from_secs(30));
        assert!(!l.exit_link_on_user_exit_steamvr);
        assert!(!l.close_services_on_exit);
    }

    // ── clamping ──────────────────────────────────────────────────────────────

    #[test]
    fn service_timeout_is_clamped() {
        let mut l = LinkConfig::default();
        l.service_timeout_secs = 0;
        assert_eq!(l.service_timeout(), Duration::from_secs(MIN_SERVICE_TIMEOUT_SECS));
        l.service_timeout_secs = 10_000;
        assert_eq!(l.service_timeout(), Duration::from_secs(MAX_SERVICE_TIMEOUT_SECS));
    }

    #[test]
    fn hover_threshold_is_clamped() {
        let mut h = HoverConfig::default();
        assert_eq!(h.threshold(), Duration::from_secs(5));
        h.activation_secs = 0;
        assert_eq!(h.threshold(), Duration::from_secs(u64::from(MIN_HOVER_SECS)));
        h.activation_secs = 999;
        assert_eq!(h.threshold(), Duration::from_secs(u64::from(MAX_HOVER_SECS)));
    }

    // ── load_or_default ───────────────────────────────────────────────────────

    #[test]
    fn load_or_default_missing_file_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nonexistent.toml");
        let config = load_or_default(&path).unwrap();
        assert!(config.dash.fast_switch);
        assert!(config.watcher.ignored_processes.is_empty());
    }

    #[test]
    fn load_or_default_parses_valid_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[dash]
fast_switch = false
oculus_base = "D:\\Oculus"

[link]
service_timeout_secs = 10
exit_link_on_user_exit_steamvr = true

[hover]
activation_secs = 3

[watcher]
ignored_processes = ["svchost.exe", "conhost.exe"]

[log]
level = "debug"
"#,
        )
        .unwrap();

        let config = load_or_default(&path).unwrap();
        assert!(!config.dash.fast_switch);
        assert_eq!(config.dash.oculus_base, Some(PathBuf::from("D:\\Oculus")));
        assert_eq!(config.link.service_timeout(), Duration::from_secs(10));
        assert!(config.link.exit_link_on_user_exit_steamvr);
        assert_eq!(config.hover.threshold(), Duration::from_secs(3));
        assert_eq!(config.watcher.ignored_processes.len(), 2);
        assert_eq!(config.log.level, "debug");
    }

    #[test]
    fn load_or_default_partial_toml_uses_field_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        // Only override one field; the rest should get their defaults.
        std::fs::write(&path, "[link]\nrestart_delay_secs = 5\n").unwrap();

        let config = load_or_default(&path).unwrap();
        assert_eq!(config.link.restart_delay(), Duration::from_secs(5));
        assert_eq!(config.link.service_name, DEFAULT_SERVICE_NAME);
        assert_eq!(config.dash.trusted_issuer, DEFAULT_TRUSTED_ISSUER);
        assert_eq!(config.hover.poll_interval_ms, DEFAULT_HOVER_POLL_MS);
    }

    #[test]
    fn load_or_default_invalid_toml_returns_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "this is not valid toml ][[[").unwrap();
        assert!(load_or_default(&path).is_err());
    }
}
