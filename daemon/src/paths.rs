/// Canonical file paths for PCVR Nexus data files and the Oculus runtime.
///
/// Daemon files live under %APPDATA%\PCVR Nexus\:
///   - config.toml  Written by the GUI (or by hand), read by the daemon.
///   - status.toml  Written by the daemon, read by the GUI.
///   - requests\    Request files dropped by front-ends, consumed by the daemon.
///   - daemon.lock  Held by the running daemon.
///   - logs\        Daily rolling daemon log.
///
/// The Oculus runtime is located through the `OculusBase` environment variable
/// set by the Oculus installer, unless `dash.oculus_base` overrides it.
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

const APP_DIR_NAME: &str = "PCVR Nexus";
pub const CONFIG_FILE_NAME: &str = "config.toml";
pub const STATUS_FILE_NAME: &str = "status.toml";
pub const LOG_DIR_NAME: &str = "logs";
pub const REQUEST_DIR_NAME: &str = "requests";
pub const DAEMON_LOCK_FILE_NAME: &str = "daemon.lock";

/// Name of the runtime's fixed dash slot.
pub const ACTIVE_DASH_FILE_NAME: &str = "OculusDash.exe";
/// Suffix of the sidecar holding the previously active dash during a fast switch.
pub const SIDECAR_SUFFIX: &str = ".delete";
/// Suffix a leftover sidecar is parked under while a new switch needs the name.
pub const STALE_SIDECAR_SUFFIX: &str = ".delete.old";

const DASH_DIR: &[&str] = &["Support", "oculus-dash", "dash", "bin"];
const CLIENT_EXE: &[&str] = &["Support", "oculus-client", "OculusClient.exe"];

/// Returns the PCVR Nexus application data directory: %APPDATA%\PCVR Nexus\
pub fn app_data_dir() -> Result<PathBuf> {
    let appdata = std::env::var_os("APPDATA").context("APPDATA environment variable not set")?;
    Ok(PathBuf::from(appdata).join(APP_DIR_NAME))
}

/// Returns the full path to the config file: %APPDATA%\PCVR Nexus\config.toml
pub fn config_file_path() -> Result<PathBuf> {
    Ok(app_data_dir()?.join(CONFIG_FILE_NAME))
}

/// Returns the full path to the status file: %APPDATA%\PCVR Nexus\status.toml
pub fn status_file_path() -> Result<PathBuf> {
    Ok(app_data_dir()?.join(STATUS_FILE_NAME))
}

/// Returns the log directory: %APPDATA%\PCVR Nexus\logs\
pub fn log_dir() -> Result<PathBuf> {
    Ok(app_data_dir()?.join(LOG_DIR_NAME))
}

/// Returns the directory front-ends drop request files into.
pub fn request_dir() -> Result<PathBuf> {
    Ok(app_data_dir()?.join(REQUEST_DIR_NAME))
}

/// Returns the lock file held for the lifetime of `nexus run`.
pub fn daemon_lock_path() -> Result<PathBuf> {
    Ok(app_data_dir()?.join(DAEMON_LOCK_FILE_NAME))
}

/// Locations inside an Oculus installation that the dash subsystem touches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimePaths {
    /// Root of the Oculus install (`%OculusBase%`).
    pub base: PathBuf,
    /// Directory holding the active dash and the stored variants.
    pub dash_dir: PathBuf,
    /// The slot the runtime launches: `<dash_dir>\OculusDash.exe`.
    pub active_dash: PathBuf,
    pub client_exe: PathBuf,
}

impl RuntimePaths {
    pub fn from_base(base: impl Into<PathBuf>) -> Self {
        let base = base.into();
        let dash_dir = DASH_DIR.iter().fold(base.clone(), |p, c| p.join(c));
        let client_exe = CLIENT_EXE.iter().fold(base.clone(), |p, c| p.join(c));
        Self {
            active_dash: dash_dir.join(ACTIVE_DASH_FILE_NAME),
            dash_dir,
            client_exe,
            base,
        }
    }

    /// Resolves the runtime from an explicit override or `%OculusBase%`.
    /// Returns `None` when neither points at an existing directory.
    pub fn locate(override_base: Option<&Path>) -> Option<Self> {
        let base = match override_base {
            Some(p) => p.to_path_buf(),
            None => PathBuf::from(std::env::var_os("OculusBase")?),
        };
        base.is_dir().then(|| Self::from_base(base))
    }

    /// Path of a stored variant binary inside the dash directory.
    pub fn variant_path(&self, file_name: &str) -> PathBuf {
        self.dash_dir.join(file_name)
    }

    /// `<active_dash>.delete`
    pub fn sidecar(&self) -> PathBuf {
        self.slot_with_suffix(SIDECAR_SUFFIX)
    }

    /// `<active_dash>.delete.old`
    pub fn stale_sidecar(&self) -> PathBuf {
        self.slot_with_suffix(STALE_SIDECAR_SUFFIX)
    }

    fn slot_with_suffix(&self, suffix: &str) -> PathBuf {
        let mut name = self.active_dash.as_os_str().to_owned();
        name.push(suffix);
        PathBuf::from(name)
    }

    /// True when the Oculus client is installed alongside the runtime.
    pub fn oculus_installed(&self) -> bool {
        self.client_exe.is_file()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_paths_follow_oculus_layout() {
        let paths = RuntimePaths::from_base("base");
        let expected_dir: PathBuf = ["base", "Support", "oculus-dash", "dash", "bin"].iter().collect();
        assert_eq!(paths.dash_dir, expected_dir);
        assert_eq!(paths.active_dash, expected_dir.join("OculusDash.exe"));
        assert_eq!(paths.client_exe.file_name().unwrap(), "OculusClient.exe");
    }

    #[test]
    fn sidecar_appends_delete_suffix() {
        let paths = RuntimePaths::from_base("base");
        assert_eq!(paths.sidecar().file_name().unwrap(), "OculusDash.exe.delete");
        assert_eq!(paths.sidecar().parent(), paths.active_dash.parent());
    }

    #[test]
    fn variant_path_is_inside_dash_dir() {
        let paths = RuntimePaths::from_base("base");
        assert_eq!(paths.variant_path("Oculus_Killer.exe").parent(), Some(paths.dash_dir.as_path()));
    }

    #[test]
    fn locate_with_override_requires_existing_dir() {
        let dir = tempfile::tempdir().unwrap();
        let found = RuntimePaths::locate(Some(dir.path())).unwrap();
        assert_eq!(found.base, dir.path());

        let missing = dir.path().join("nope");
        assert!(RuntimePaths::locate(Some(&missing)).is_none());
    }

    #[test]
    fn oculus_installed_checks_client_exe() {
        let dir = tempfile::tempdir().unwrap();
        let paths = RuntimePaths::from_base(dir.path());
        assert!(!paths.oculus_installed());

        std::fs::create_dir_all(paths.client_exe.parent().unwrap()).unwrap();
        std::fs::write(&paths.client_exe, b"client").unwrap();
        assert!(paths.oculus_installed());
    }

    #[cfg(windows)]
    #[test]
    fn app_data_dir_is_inside_appdata() {
        let appdata = std::env::var("APPDATA").unwrap();
        let dir = app_data_dir().unwrap();
        assert!(dir.starts_with(&appdata));
        assert_eq!(dir.file_name().unwrap(), APP_DIR_NAME);
    }

    #[cfg(windows)]
    #[test]
    fn config_and_status_share_same_parent_dir() {
        let config = config_file_path().unwrap();
        let status = status_file_path().unwrap();
        assert_eq!(config.parent(), status.parent());
    }
}
