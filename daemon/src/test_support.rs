/// Fakes for the OS-facing seams, shared by the unit tests.
use async_trait::async_trait;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::dash_variant::RemoteSource;
use crate::error::{ReleaseError, ServiceError};
use crate::identity::BinaryInspector;
use crate::paths::RuntimePaths;
use crate::process_control::{normalize_process_name, ProcessControl};
use crate::release::{ReleaseAsset, ReleaseSource};
use crate::services::{ServiceBackend, ServiceStartup, ServiceState};

/// A lock-conflict error as the OS would report it.
pub fn lock_conflict() -> io::Error {
    io::Error::from_raw_os_error(if cfg!(windows) { 32 } else { 16 })
}

/// Creates `<tmp>/Support/oculus-dash/dash/bin` and returns its runtime paths.
pub fn runtime_in(dir: &Path) -> RuntimePaths {
    let paths = RuntimePaths::from_base(dir);
    std::fs::create_dir_all(&paths.dash_dir).unwrap();
    paths
}

/// Writes `len` bytes of `fill` to `path`.
pub fn write_len(path: &Path, len: usize, fill: u8) {
    std::fs::write(path, vec![fill; len]).unwrap();
}

// ── Processes ─────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct FakeProcesses {
    running: Mutex<HashMap<String, Vec<u32>>>,
    fail_close: Mutex<Option<String>>,
    pub log: Mutex<Vec<String>>,
}

impl FakeProcesses {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn(&self, name: &str, pid: u32) {
        self.running
            .lock()
            .unwrap()
            .entry(normalize_process_name(name))
            .or_default()
            .push(pid);
    }

    /// Makes `close_main_window(name)` fail.
    pub fn fail_close_of(&self, name: &str) {
        *self.fail_close.lock().unwrap() = Some(normalize_process_name(name));
    }

    pub fn calls(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }
}

impl ProcessControl for FakeProcesses {
    fn find(&self, name: &str) -> Vec<u32> {
        self.running
            .lock()
            .unwrap()
            .get(&normalize_process_name(name))
            .cloned()
            .unwrap_or_default()
    }

    fn close_main_window(&self, name: &str) -> io::Result<usize> {
        let key = normalize_process_name(name);
        self.log.lock().unwrap().push(format!("close:{key}"));
        if self.fail_close.lock().unwrap().as_deref() == Some(key.as_str()) {
            return Err(io::Error::other("access denied"));
        }
        Ok(self.running.lock().unwrap().remove(&key).map_or(0, |p| p.len()))
    }

    fn kill(&self, pid: u32) -> io::Result<()> {
        self.log.lock().unwrap().push(format!("kill:{pid}"));
        for pids in self.running.lock().unwrap().values_mut() {
            pids.retain(|p| *p != pid);
        }
        Ok(())
    }

    fn wait_for_exit(&self, pid: u32, _timeout: Duration) -> bool {
        self.log.lock().unwrap().push(format!("wait:{pid}"));
        !self
            .running
            .lock()
            .unwrap()
            .values()
            .any(|pids| pids.contains(&pid))
    }
}

// ── Binary identity ───────────────────────────────────────────────────────────

#[derive(Default)]
pub struct FakeInspector {
    products: Mutex<HashMap<PathBuf, String>>,
    issuers: Mutex<HashMap<PathBuf, String>>,
}

impl FakeInspector {
    pub fn set_product(&self, path: &Path, product: &str) {
        self.products
            .lock()
            .unwrap()
            .insert(path.to_path_buf(), product.to_string());
    }

    pub fn set_issuer(&self, path: &Path, issuer: &str) {
        self.issuers
            .lock()
            .unwrap()
            .insert(path.to_path_buf(), issuer.to_string());
    }
}

impl BinaryInspector for FakeInspector {
    fn product_name(&self, path: &Path) -> Option<String> {
        if !path.exists() {
            return None;
        }
        Some(self.products.lock().unwrap().get(path).cloned().unwrap_or_default())
    }

    fn signer_issuer(&self, path: &Path) -> Option<String> {
        self.issuers.lock().unwrap().get(path).cloned()
    }
}

// ── Release feed ──────────────────────────────────────────────────────────────

/// Serves a single in-memory asset; `None` payload simulates a network failure.
/// `advertised` overrides the size the release claims, for short downloads.
pub struct FakeReleases {
    pub payload: Option<Vec<u8>>,
    pub advertised: Option<u64>,
    pub downloads: AtomicUsize,
}

impl FakeReleases {
    pub fn serving(bytes: Vec<u8>) -> Self {
        Self {
            payload: Some(bytes),
            advertised: None,
            downloads: AtomicUsize::new(0),
        }
    }

    /// Advertises `size` bytes but delivers only `bytes`.
    pub fn truncated(bytes: Vec<u8>, size: u64) -> Self {
        Self {
            advertised: Some(size),
            ..Self::serving(bytes)
        }
    }

    pub fn offline() -> Self {
        Self {
            payload: None,
            advertised: None,
            downloads: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ReleaseSource for FakeReleases {
    async fn latest_asset(&self, source: &RemoteSource) -> Result<ReleaseAsset, ReleaseError> {
        match &self.payload {
            Some(bytes) => Ok(ReleaseAsset {
                name: source.asset.clone(),
                size: self.advertised.unwrap_or(bytes.len() as u64),
                download_url: "https://example.invalid/asset".to_string(),
                release_name: Some("v-test".to_string()),
            }),
            None => Err(ReleaseError::Io(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "offline",
            ))),
        }
    }

    async fn download(&self, _asset: &ReleaseAsset, dest: &Path) -> Result<u64, ReleaseError> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        let bytes = self.payload.as_ref().ok_or_else(|| {
            ReleaseError::Io(io::Error::new(io::ErrorKind::ConnectionReset, "offline"))
        })?;
        std::fs::write(dest, bytes)?;
        Ok(bytes.len() as u64)
    }
}

// ── Services ──────────────────────────────────────────────────────────────────

/// In-memory SCM. `sticky` services ignore stop requests.
#[derive(Default)]
pub struct FakeServices {
    states: Mutex<HashMap<String, ServiceState>>,
    startup: Mutex<HashMap<String, ServiceStartup>>,
    sticky: Mutex<Vec<String>>,
    pub log: Mutex<Vec<String>>,
}

impl FakeServices {
    pub fn with(name: &str, state: ServiceState, startup: ServiceStartup) -> Self {
        let fake = Self::default();
        fake.states.lock().unwrap().insert(name.to_string(), state);
        fake.startup.lock().unwrap().insert(name.to_string(), startup);
        fake
    }

    pub fn add(&self, name: &str, state: ServiceState, startup: ServiceStartup) {
        self.states.lock().unwrap().insert(name.to_string(), state);
        self.startup.lock().unwrap().insert(name.to_string(), startup);
    }

    /// Uninstalls `name`.
    pub fn remove(&self, name: &str) {
        self.states.lock().unwrap().remove(name);
        self.startup.lock().unwrap().remove(name);
    }

    pub fn make_sticky(&self, name: &str) {
        self.sticky.lock().unwrap().push(name.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }
}

impl ServiceBackend for FakeServices {
    fn exists(&self, name: &str) -> bool {
        self.states.lock().unwrap().contains_key(name)
    }

    fn query_state(&self, name: &str) -> Result<ServiceState, ServiceError> {
        self.states
            .lock()
            .unwrap()
            .get(name)
            .copied()
            .ok_or_else(|| ServiceError::NotRegistered(name.to_string()))
    }

    fn query_startup(&self, name: &str) -> Result<ServiceStartup, ServiceError> {
        self.startup
            .lock()
            .unwrap()
            .get(name)
            .copied()
            .ok_or_else(|| ServiceError::NotRegistered(name.to_string()))
    }

    fn start(&self, name: &str) -> Result<(), ServiceError> {
        self.log.lock().unwrap().push(format!("start:{name}"));
        self.states
            .lock()
            .unwrap()
            .insert(name.to_string(), ServiceState::Running);
        Ok(())
    }

    fn stop(&self, name: &str) -> Result<(), ServiceError> {
        self.log.lock().unwrap().push(format!("stop:{name}"));
        if self.sticky.lock().unwrap().iter().any(|s| s == name) {
            return Ok(());
        }
        self.states
            .lock()
            .unwrap()
            .insert(name.to_string(), ServiceState::Stopped);
        Ok(())
    }
}
