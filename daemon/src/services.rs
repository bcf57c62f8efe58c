/// Windows service control for the Oculus runtime services.
///
/// [`ServiceManager`] keeps a registry of known services and re-queries the
/// backend before every operation, so a handle never reports stale state.
/// `start`/`stop` block until the target state is reached or the timeout
/// elapses; a timeout is not an error and callers re-check the state.
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::ServiceError;

pub const DEFAULT_SERVICE_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    Stopped,
    StartPending,
    StopPending,
    Running,
    ContinuePending,
    PausePending,
    Paused,
    /// The service is not registered with the service control manager.
    NotFound,
}

impl ServiceState {
    /// Running, paused or transitioning between the two.
    pub fn is_running_or_pending(self) -> bool {
        matches!(
            self,
            ServiceState::Running
                | ServiceState::Paused
                | ServiceState::StartPending
                | ServiceState::StopPending
        )
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServiceState::Stopped => "Stopped",
            ServiceState::StartPending => "StartPending",
            ServiceState::StopPending => "StopPending",
            ServiceState::Running => "Running",
            ServiceState::ContinuePending => "ContinuePending",
            ServiceState::PausePending => "PausePending",
            ServiceState::Paused => "Paused",
            ServiceState::NotFound => "Not Found",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceStartup {
    Boot,
    System,
    Automatic,
    Manual,
    Disabled,
}

/// Raw access to a service control manager.
pub trait ServiceBackend: Send + Sync {
    fn exists(&self, name: &str) -> bool;
    fn query_state(&self, name: &str) -> Result<ServiceState, ServiceError>;
    fn query_startup(&self, name: &str) -> Result<ServiceStartup, ServiceError>;
    /// Issues a start request without waiting.
    fn start(&self, name: &str) -> Result<(), ServiceError>;
    /// Issues a stop request without waiting.
    fn stop(&self, name: &str) -> Result<(), ServiceError>;
}

/// A registered service and the state last observed for it.
#[derive(Debug, Clone)]
pub struct ServiceHandle {
    pub name: String,
    pub last_state: Option<ServiceState>,
}

pub struct ServiceManager {
    backend: Arc<dyn ServiceBackend>,
    registry: Mutex<HashMap<String, ServiceHandle>>,
    timeout_ms: AtomicU64,
    poll_interval: Duration,
}

impl ServiceManager {
    pub fn new(backend: Arc<dyn ServiceBackend>) -> Self {
        Self {
            backend,
            registry: Mutex::new(HashMap::new()),
            timeout_ms: AtomicU64::new(DEFAULT_SERVICE_TIMEOUT.as_millis() as u64),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    #[cfg(test)]
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.set_timeout(timeout);
        self
    }

    #[cfg(test)]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Bounded wait used by `start` and `stop`.
    pub fn set_timeout(&self, timeout: Duration) {
        self.timeout_ms.store(timeout.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.load(Ordering::Relaxed))
    }

    /// Adds `name` to the registry. Unknown services are logged and skipped;
    /// registering twice is a no-op. Returns whether the service is registered.
    pub fn register(&self, name: &str) -> bool {
        let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        if registry.contains_key(name) {
            return true;
        }
        if !self.backend.exists(name) {
            warn!(service = name, "unable to find service");
            return false;
        }
        registry.insert(
            name.to_string(),
            ServiceHandle {
                name: name.to_string(),
                last_state: None,
            },
        );
        debug!(service = name, "service registered");
        true
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    fn require_registered(&self, name: &str) -> Result<(), ServiceError> {
        if self.is_registered(name) {
            Ok(())
        } else {
            Err(ServiceError::NotRegistered(name.to_string()))
        }
    }

    /// Current state; [`ServiceState::NotFound`] for unregistered or
    /// uninstalled services or when the query fails.
    pub fn get_state(&self, name: &str) -> ServiceState {
        let state = match self
            .require_registered(name)
            .and_then(|()| self.backend.query_state(name))
        {
            Ok(state) => state,
            Err(ServiceError::NotRegistered(_)) => ServiceState::NotFound,
            Err(e) => {
                warn!(service = name, error = %e, "service state query failed");
                ServiceState::NotFound
            }
        };
        self.remember(name, state);
        state
    }

    /// Startup type; `None` for unregistered services or when the query fails.
    pub fn get_startup(&self, name: &str) -> Option<ServiceStartup> {
        match self
            .require_registered(name)
            .and_then(|()| self.backend.query_startup(name))
        {
            Ok(startup) => Some(startup),
            Err(ServiceError::NotRegistered(_)) => None,
            Err(e) => {
                warn!(service = name, error = %e, "service startup query failed");
                None
            }
        }
    }

    /// Re-queries every registered service and returns the handles by name.
    pub fn snapshot(&self) -> Vec<ServiceHandle> {
        let mut names: Vec<String> = self
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        for name in &names {
            self.get_state(name);
        }
        let registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        names
            .iter()
            .filter_map(|name| registry.get(name).cloned())
            .collect()
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.get_state(name) == ServiceState::Running
    }

    /// Starts the service unless it is already running or pending, then waits
    /// for `Running`. Errors are logged; returns the final observed state.
    pub fn start(&self, name: &str) -> ServiceState {
        let state = self.get_state(name);
        if state == ServiceState::NotFound || state.is_running_or_pending() {
            return state;
        }
        debug!(service = name, "starting service");
        if let Err(e) = self.backend.start(name) {
            warn!(service = name, error = %e, "unable to start service");
            return self.get_state(name);
        }
        self.wait_for(name, ServiceState::Running)
    }

    /// Stops the service if it is running or pending, then waits for `Stopped`.
    /// Errors are logged; returns the final observed state.
    pub fn stop(&self, name: &str) -> ServiceState {
        let state = self.get_state(name);
        if !state.is_running_or_pending() {
            return state;
        }
        debug!(service = name, "stopping service");
        if let Err(e) = self.backend.stop(name) {
            warn!(service = name, error = %e, "unable to stop service");
            return self.get_state(name);
        }
        self.wait_for(name, ServiceState::Stopped)
    }

    fn wait_for(&self, name: &str, target: ServiceState) -> ServiceState {
        let deadline = Instant::now() + self.timeout();
        loop {
            let state = self.get_state(name);
            if state == target || state == ServiceState::NotFound {
                return state;
            }
            if Instant::now() >= deadline {
                warn!(service = name, %state, %target, "timed out waiting for service");
                return state;
            }
            std::thread::sleep(self.poll_interval);
        }
    }

    fn remember(&self, name: &str, state: ServiceState) {
        let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = registry.get_mut(name) {
            handle.last_state = Some(state);
        }
    }
}

/// [`ServiceBackend`] talking to the real Windows service control manager.
/// Every call returns [`ServiceError::Unsupported`] on other platforms.
#[derive(Debug, Default, Clone, Copy)]
pub struct WindowsScm;

impl ServiceBackend for WindowsScm {
    fn exists(&self, name: &str) -> bool {
        #[cfg(windows)]
        {
            imp::open(name, imp::QUERY).is_ok()
        }
        #[cfg(not(windows))]
        {
            let _ = name;
            false
        }
    }

    fn query_state(&self, name: &str) -> Result<ServiceState, ServiceError> {
        #[cfg(windows)]
        {
            imp::query_state(name)
        }
        #[cfg(not(windows))]
        {
            let _ = name;
            Err(ServiceError::Unsupported)
        }
    }

    fn query_startup(&self, name: &str) -> Result<ServiceStartup, ServiceError> {
        #[cfg(windows)]
        {
            imp::query_startup(name)
        }
        #[cfg(not(windows))]
        {
            let _ = name;
            Err(ServiceError::Unsupported)
        }
    }

    fn start(&self, name: &str) -> Result<(), ServiceError> {
        #[cfg(windows)]
        {
            imp::start(name)
        }
        #[cfg(not(windows))]
        {
            let _ = name;
            Err(ServiceError::Unsupported)
        }
    }

    fn stop(&self, name: &str) -> Result<(), ServiceError> {
        #[cfg(windows)]
        {
            imp::stop(name)
        }
        #[cfg(not(windows))]
        {
            let _ = name;
            Err(ServiceError::Unsupported)
        }
    }
}

// ── Windows implementation ─────────────────────────────────────────────────────

#[cfg(windows)]
mod imp {
    use super::{ServiceStartup, ServiceState};
    use crate::error::ServiceError;

    use windows::core::PCWSTR;
    use windows::Win32::Foundation::ERROR_SERVICE_DOES_NOT_EXIST;
    use windows::Win32::System::Services::{
        CloseServiceHandle, ControlService, OpenSCManagerW, OpenServiceW, QueryServiceConfigW,
        QueryServiceStatus, StartServiceW, QUERY_SERVICE_CONFIGW, SC_HANDLE, SC_MANAGER_CONNECT,
        SERVICE_CONTROL_STOP, SERVICE_QUERY_CONFIG, SERVICE_QUERY_STATUS, SERVICE_START,
        SERVICE_STATUS, SERVICE_STOP,
    };

    pub const QUERY: u32 = SERVICE_QUERY_STATUS | SERVICE_QUERY_CONFIG;

    /// An open service handle plus its manager, closed together on drop.
    pub struct Service {
        manager: SC_HANDLE,
        service: SC_HANDLE,
    }

    impl Drop for Service {
        fn drop(&mut self) {
            unsafe {
                let _ = CloseServiceHandle(self.service);
                let _ = CloseServiceHandle(self.manager);
            }
        }
    }

    fn wide(s: &str) -> Vec<u16> {
        s.encode_utf16().chain(std::iter::once(0)).collect()
    }

    pub fn open(name: &str, access: u32) -> Result<Service, ServiceError> {
        let open_err = |e: windows::core::Error| {
            if e.code() == ERROR_SERVICE_DOES_NOT_EXIST.to_hresult() {
                ServiceError::NotRegistered(name.to_string())
            } else {
                ServiceError::Open {
                    name: name.to_string(),
                    message: e.message().to_string(),
                }
            }
        };
        let manager =
            unsafe { OpenSCManagerW(PCWSTR::null(), PCWSTR::null(), SC_MANAGER_CONNECT) }
                .map_err(open_err)?;
        let service_name = wide(name);
        match unsafe { OpenServiceW(manager, PCWSTR::from_raw(service_name.as_ptr()), access) } {
            Ok(service) => Ok(Service { manager, service }),
            Err(e) => {
                unsafe {
                    let _ = CloseServiceHandle(manager);
                }
                Err(open_err(e))
            }
        }
    }

    fn control_err(name: &str, operation: &'static str) -> impl FnOnce(windows::core::Error) -> ServiceError + '_ {
        move |e| ServiceError::Control {
            name: name.to_string(),
            operation,
            message: e.message().to_string(),
        }
    }

    pub fn query_state(name: &str) -> Result<ServiceState, ServiceError> {
        let svc = open(name, SERVICE_QUERY_STATUS)?;
        let mut status = SERVICE_STATUS::default();
        unsafe { QueryServiceStatus(svc.service, &mut status) }
            .map_err(control_err(name, "query status"))?;
        Ok(match status.dwCurrentState.0 {
            1 => ServiceState::Stopped,
            2 => ServiceState::StartPending,
            3 => ServiceState::StopPending,
            4 => ServiceState::Running,
            5 => ServiceState::ContinuePending,
            6 => ServiceState::PausePending,
            7 => ServiceState::Paused,
            _ => ServiceState::NotFound,
        })
    }

    pub fn query_startup(name: &str) -> Result<ServiceStartup, ServiceError> {
        let svc = open(name, SERVICE_QUERY_CONFIG)?;
        let mut needed = 0u32;
        // First call only sizes the buffer and is expected to fail.
        let _ = unsafe { QueryServiceConfigW(svc.service, None, 0, &mut needed) };
        let words = (needed as usize).div_ceil(std::mem::size_of::<u64>()).max(1);
        let mut buf = vec![0u64; words];
        let config = buf.as_mut_ptr() as *mut QUERY_SERVICE_CONFIGW;
        unsafe { QueryServiceConfigW(svc.service, Some(config), needed, &mut needed) }
            .map_err(control_err(name, "query config"))?;
        let start_type = unsafe { (*config).dwStartType.0 };
        Ok(match start_type {
            0 => ServiceStartup::Boot,
            1 => ServiceStartup::System,
            2 => ServiceStartup::Automatic,
            3 => ServiceStartup::Manual,
            _ => ServiceStartup::Disabled,
        })
    }

    pub fn start(name: &str) -> Result<(), ServiceError> {
        let svc = open(name, SERVICE_START)?;
        unsafe { StartServiceW(svc.service, None) }.map_err(control_err(name, "start"))
    }

    pub fn stop(name: &str) -> Result<(), ServiceError> {
        let svc = open(name, SERVICE_STOP)?;
        let mut status = SERVICE_STATUS::default();
        unsafe { ControlService(svc.service, SERVICE_CONTROL_STOP, &mut status) }
            .map_err(control_err(name, "stop"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeServices;

    fn manager(fake: FakeServices) -> (Arc<FakeServices>, ServiceManager) {
        let fake = Arc::new(fake);
        let manager = ServiceManager::new(fake.clone())
            .with_timeout(Duration::from_millis(60))
            .with_poll_interval(Duration::from_millis(5));
        (fake, manager)
    }

    #[test]
    fn running_or_pending_states() {
        assert!(ServiceState::Running.is_running_or_pending());
        assert!(ServiceState::Paused.is_running_or_pending());
        assert!(ServiceState::StartPending.is_running_or_pending());
        assert!(ServiceState::StopPending.is_running_or_pending());
        assert!(!ServiceState::Stopped.is_running_or_pending());
        assert!(!ServiceState::NotFound.is_running_or_pending());
    }

    #[test]
    fn unregistered_service_reports_not_found() {
        let (_, m) = manager(FakeServices::with("OVRService", ServiceState::Running, ServiceStartup::Manual));
        assert_eq!(m.get_state("OVRService"), ServiceState::NotFound);
        assert!(m.get_startup("OVRService").is_none());
    }

    #[test]
    fn register_skips_unknown_services() {
        let (_, m) = manager(FakeServices::default());
        assert!(!m.register("Nope"));
        assert!(!m.is_registered("Nope"));
    }

    #[test]
    fn register_is_idempotent() {
        let (_, m) = manager(FakeServices::with("OVRService", ServiceState::Running, ServiceStartup::Manual));
        assert!(m.register("OVRService"));
        assert!(m.register("OVRService"));
        assert_eq!(m.get_state("OVRService"), ServiceState::Running);
        assert_eq!(m.get_startup("OVRService"), Some(ServiceStartup::Manual));
    }

    #[test]
    fn stop_waits_for_stopped() {
        let (fake, m) = manager(FakeServices::with("OVRService", ServiceState::Running, ServiceStartup::Manual));
        m.register("OVRService");
        assert_eq!(m.stop("OVRService"), ServiceState::Stopped);
        assert_eq!(fake.calls(), vec!["stop:OVRService".to_string()]);
    }

    #[test]
    fn stop_of_stopped_service_is_noop() {
        let (fake, m) = manager(FakeServices::with("OVRService", ServiceState::Stopped, ServiceStartup::Manual));
        m.register("OVRService");
        assert_eq!(m.stop("OVRService"), ServiceState::Stopped);
        assert!(fake.calls().is_empty());
    }

    #[test]
    fn start_skips_running_service() {
        let (fake, m) = manager(FakeServices::with("OVRService", ServiceState::Running, ServiceStartup::Manual));
        m.register("OVRService");
        assert_eq!(m.start("OVRService"), ServiceState::Running);
        assert!(fake.calls().is_empty());
    }

    #[test]
    fn start_brings_service_up() {
        let (fake, m) = manager(FakeServices::with("OVRService", ServiceState::Stopped, ServiceStartup::Manual));
        m.register("OVRService");
        assert_eq!(m.start("OVRService"), ServiceState::Running);
        assert_eq!(fake.calls(), vec!["start:OVRService".to_string()]);
    }

    #[test]
    fn stop_timeout_is_best_effort() {
        let (fake, m) = manager(FakeServices::with("OVRService", ServiceState::Running, ServiceStartup::Manual));
        fake.make_sticky("OVRService");
        m.register("OVRService");

        let started = Instant::now();
        assert_eq!(m.stop("OVRService"), ServiceState::Running);
        assert!(started.elapsed() >= Duration::from_millis(60));
    }

    #[test]
    fn uninstalled_service_reads_as_not_found() {
        let (fake, m) = manager(FakeServices::with("OVRService", ServiceState::Running, ServiceStartup::Manual));
        m.register("OVRService");
        fake.remove("OVRService");
        assert_eq!(m.get_state("OVRService"), ServiceState::NotFound);
        assert!(m.get_startup("OVRService").is_none());
    }

    #[test]
    fn snapshot_lists_registered_services_with_fresh_state() {
        let fake = FakeServices::with("OVRService", ServiceState::Running, ServiceStartup::Manual);
        fake.add("OVRLibraryService", ServiceState::Stopped, ServiceStartup::Manual);
        let (fake, m) = manager(fake);
        m.register("OVRService");
        m.register("OVRLibraryService");
        m.register("Nope");

        let handles = m.snapshot();
        let seen: Vec<_> = handles.iter().map(|h| (h.name.as_str(), h.last_state)).collect();
        assert_eq!(
            seen,
            vec![
                ("OVRLibraryService", Some(ServiceState::Stopped)),
                ("OVRService", Some(ServiceState::Running)),
            ]
        );

        fake.add("OVRService", ServiceState::Stopped, ServiceStartup::Manual);
        assert_eq!(m.snapshot()[1].last_state, Some(ServiceState::Stopped));
    }

    #[test]
    fn state_display_matches_scm_names() {
        assert_eq!(ServiceState::Running.to_string(), "Running");
        assert_eq!(ServiceState::NotFound.to_string(), "Not Found");
    }

    #[cfg(not(windows))]
    #[test]
    fn scm_is_unsupported_off_windows() {
        assert!(!WindowsScm.exists("OVRService"));
        assert!(matches!(WindowsScm.query_state("OVRService"), Err(ServiceError::Unsupported)));
    }
}
