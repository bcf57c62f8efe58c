/// Owns the two dash variants and the activation engine, decides which dash
/// currently occupies the slot, and keeps the stored variants in sync with the
/// runtime at startup.
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::activation::{ActivationEngine, ActivationResult, FailureReason};
use crate::config::DashConfig;
use crate::dash_variant::{DashRegistry, DashType, DashVariant};
use crate::error::ActivationError;
use crate::identity::BinaryInspector;
use crate::paths::RuntimePaths;
use crate::process_control::ProcessControl;
use crate::release::ReleaseSource;

const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(250);

/// What the runtime's slot currently holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActiveDash {
    Normal,
    OculusKiller,
    /// A binary that is neither the genuine stock dash nor a known replacement.
    Unknown,
    /// The slot is empty.
    Missing,
}

impl ActiveDash {
    pub fn dash_type(self) -> Option<DashType> {
        match self {
            ActiveDash::Normal => Some(DashType::Normal),
            ActiveDash::OculusKiller => Some(DashType::OculusKiller),
            ActiveDash::Unknown | ActiveDash::Missing => None,
        }
    }
}

impl From<DashType> for ActiveDash {
    fn from(kind: DashType) -> Self {
        match kind {
            DashType::Normal => ActiveDash::Normal,
            DashType::OculusKiller => ActiveDash::OculusKiller,
        }
    }
}

impl fmt::Display for ActiveDash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActiveDash::Normal => f.write_str("normal"),
            ActiveDash::OculusKiller => f.write_str("oculus-killer"),
            ActiveDash::Unknown => f.write_str("unknown"),
            ActiveDash::Missing => f.write_str("missing"),
        }
    }
}

pub struct DashManager {
    registry: DashRegistry,
    engine: ActivationEngine,
    inspector: Arc<dyn BinaryInspector>,
    config: DashConfig,
    active: ActiveDash,
    retry_delay: Duration,
}

impl DashManager {
    pub fn new(
        paths: RuntimePaths,
        processes: Arc<dyn ProcessControl>,
        inspector: Arc<dyn BinaryInspector>,
        config: DashConfig,
    ) -> Self {
        Self::with_engine(ActivationEngine::new(paths, processes), inspector, config)
    }

    pub fn with_engine(
        engine: ActivationEngine,
        inspector: Arc<dyn BinaryInspector>,
        config: DashConfig,
    ) -> Self {
        Self {
            registry: DashRegistry::new(),
            engine,
            inspector,
            config,
            active: ActiveDash::Missing,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }

    #[cfg(test)]
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn apply_config(&mut self, config: DashConfig) {
        self.config = config;
    }

    pub fn paths(&self) -> &RuntimePaths {
        self.engine.paths()
    }

    /// Rebuilds both variants from their definitions and re-reads disk state.
    /// Calling it again yields the same registry.
    pub fn generate_dashes(&mut self) -> ActiveDash {
        self.registry = DashRegistry::new();
        self.refresh_installed_and_active_state()
    }

    /// Re-derives `installed` for both variants and the slot classification.
    pub fn refresh_installed_and_active_state(&mut self) -> ActiveDash {
        for variant in self.registry.iter_mut() {
            self.engine.check_installed(variant);
        }
        let active = self.classify_active_dash();
        for variant in self.registry.iter_mut() {
            variant.active = active.dash_type() == Some(variant.kind);
        }
        if active != self.active {
            debug!(previous = %self.active, current = %active, "active dash changed");
        }
        self.active = active;
        active
    }

    /// Identifies the binary in the slot by its product name, falling back to
    /// the signer issuer to tell the genuine stock dash from an unknown one.
    pub fn classify_active_dash(&self) -> ActiveDash {
        let slot = &self.paths().active_dash;
        if !slot.is_file() {
            return ActiveDash::Missing;
        }
        let product = self.inspector.product_name(slot).unwrap_or_default();

        let Some(owner) = self.registry.iter().find(|v| v.is_this_your_dash(&product)) else {
            return ActiveDash::Unknown;
        };
        if !owner.is_default() {
            return owner.kind.into();
        }
        match self.inspector.signer_issuer(slot) {
            Some(issuer) if issuer == self.config.trusted_issuer => ActiveDash::Normal,
            other => {
                debug!(issuer = ?other, "stock-looking dash has an untrusted signature");
                ActiveDash::Unknown
            }
        }
    }

    pub fn active(&self) -> ActiveDash {
        self.active
    }

    pub fn is_installed(&self, kind: DashType) -> bool {
        self.registry.get(kind).installed
    }

    pub fn variant(&self, kind: DashType) -> &DashVariant {
        self.registry.get(kind)
    }

    pub fn variants(&self) -> impl Iterator<Item = &DashVariant> {
        self.registry.iter()
    }

    /// Display name of whatever `active` refers to.
    pub fn dash_name(&self, active: ActiveDash) -> &str {
        match active.dash_type() {
            Some(kind) => self.registry.get(kind).name(),
            None if active == ActiveDash::Missing => "Missing",
            None => "Unknown",
        }
    }

    /// Startup reconciliation between the stored variants and the slot:
    ///   - finishes or cleans up an interrupted fast switch
    ///   - downloads the replacement if it was never installed
    ///   - keeps a stored copy of the genuine stock dash, refreshed when the
    ///     runtime updates it
    pub async fn startup_sync(&mut self, releases: &dyn ReleaseSource) -> Result<ActiveDash, ActivationError> {
        self.engine.recover_interrupted_switch()?;
        self.refresh_installed_and_active_state();

        if !self.is_installed(DashType::OculusKiller) {
            info!("replacement dash not installed, downloading");
            let variant = self.registry.get_mut(DashType::OculusKiller);
            self.engine.download(variant, releases).await?;
        }

        let active = self.refresh_installed_and_active_state();
        if active == ActiveDash::Normal {
            self.sync_normal_backup()?;
        } else if active == ActiveDash::Unknown {
            warn!("unrecognised dash in the slot, skipping stock dash backup");
        }
        Ok(self.refresh_installed_and_active_state())
    }

    fn sync_normal_backup(&mut self) -> Result<(), ActivationError> {
        let slot = self.paths().active_dash.clone();
        let normal = self.registry.get_mut(DashType::Normal);
        if !normal.installed {
            info!("storing a copy of the stock dash");
            return self.engine.capture_active_dash(normal);
        }
        let stored = self.engine.paths().variant_path(&normal.file_name);
        let stored_len = fs::metadata(&stored).map(|m| m.len()).ok();
        let slot_len = fs::metadata(&slot).map(|m| m.len()).ok();
        if stored_len != slot_len {
            info!(?stored_len, ?slot_len, "stock dash changed, refreshing stored copy");
            self.engine.capture_active_dash(normal)?;
        }
        Ok(())
    }

    /// Checks the replacement for a newer release and downloads it when stale.
    /// Returns whether a new binary was installed.
    pub async fn update(&mut self, releases: &dyn ReleaseSource) -> Result<bool, ActivationError> {
        self.refresh_installed_and_active_state();
        let variant = self.registry.get_mut(DashType::OculusKiller);
        if variant.installed {
            self.engine.check_for_update(variant, releases).await;
            if !variant.needs_update {
                debug!(dash = %variant.name(), "dash is up to date");
                return Ok(false);
            }
        }
        let downloaded = self.engine.download(variant, releases).await?;
        self.refresh_installed_and_active_state();
        Ok(downloaded)
    }

    /// Compares every installed variant that has a remote source with its
    /// latest release, without downloading anything.
    pub async fn check_for_updates(&mut self, releases: &dyn ReleaseSource) {
        self.refresh_installed_and_active_state();
        for variant in self.registry.iter_mut() {
            self.engine.check_for_update(variant, releases).await;
        }
    }

    /// Switches the slot to `kind` using the configured strategy.
    pub fn set_active_dash(&mut self, kind: DashType) -> Result<ActivationResult, ActivationError> {
        self.refresh_installed_and_active_state();
        let variant = self.registry.get(kind);
        let result = if self.config.fast_switch {
            self.engine.activate_fast(variant)
        } else {
            self.engine.activate(variant)
        };
        self.refresh_installed_and_active_state();
        result
    }

    /// [`DashManager::set_active_dash`] retried up to `fast_switch_attempts`
    /// times while the failure is recoverable. Returns whether `kind` ended up
    /// active.
    pub fn activate_fast_transition(&mut self, kind: DashType) -> Result<bool, ActivationError> {
        let attempts = self.config.fast_switch_attempts.max(1);
        for attempt in 1..=attempts {
            match self.set_active_dash(kind)? {
                ActivationResult::Activated => return Ok(true),
                ActivationResult::Failed(FailureReason::NotInstalled) => {
                    warn!(%kind, "cannot switch to a dash that is not installed");
                    return Ok(false);
                }
                ActivationResult::Failed(reason) => {
                    debug!(%kind, attempt, ?reason, "fast transition attempt failed");
                    if attempt < attempts {
                        std::thread::sleep(self.retry_delay);
                    }
                }
            }
        }
        warn!(%kind, attempts, "fast transition gave up");
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_TRUSTED_ISSUER;
    use crate::test_support::{lock_conflict, runtime_in, write_len, FakeInspector, FakeProcesses, FakeReleases};
    use std::io;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixture {
        _dir: tempfile::TempDir,
        paths: RuntimePaths,
        inspector: Arc<FakeInspector>,
        procs: Arc<FakeProcesses>,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let paths = runtime_in(dir.path());
            Self {
                _dir: dir,
                paths,
                inspector: Arc::new(FakeInspector::default()),
                procs: Arc::new(FakeProcesses::new()),
            }
        }

        fn manager(&self) -> DashManager {
            self.manager_with(DashConfig::default())
        }

        fn manager_with(&self, config: DashConfig) -> DashManager {
            DashManager::new(self.paths.clone(), self.procs.clone(), self.inspector.clone(), config)
                .with_retry_delay(Duration::from_millis(1))
        }

        fn genuine_stock_slot(&self, len: usize) {
            write_len(&self.paths.active_dash, len, 1);
            self.inspector.set_issuer(&self.paths.active_dash, DEFAULT_TRUSTED_ISSUER);
        }

        fn killer_slot(&self, len: usize) {
            write_len(&self.paths.active_dash, len, 2);
            self.inspector.set_product(&self.paths.active_dash, "Oculus Killer");
        }

        fn store(&self, kind: DashType, len: usize, fill: u8) {
            let file = DashRegistry::new().get(kind).file_name.clone();
            write_len(&self.paths.variant_path(&file), len, fill);
        }
    }

    // ── classification ────────────────────────────────────────────────────────

    #[test]
    fn classify_missing_slot() {
        let fx = Fixture::new();
        assert_eq!(fx.manager().classify_active_dash(), ActiveDash::Missing);
    }

    #[test]
    fn classify_replacement_by_product_name() {
        let fx = Fixture::new();
        fx.killer_slot(100);
        assert_eq!(fx.manager().classify_active_dash(), ActiveDash::OculusKiller);
    }

    #[test]
    fn classify_genuine_stock_dash() {
        let fx = Fixture::new();
        fx.genuine_stock_slot(100);
        assert_eq!(fx.manager().classify_active_dash(), ActiveDash::Normal);
    }

    #[test]
    fn unsigned_stock_looking_dash_is_unknown() {
        let fx = Fixture::new();
        write_len(&fx.paths.active_dash, 100, 1);
        assert_eq!(fx.manager().classify_active_dash(), ActiveDash::Unknown);

        fx.inspector.set_issuer(&fx.paths.active_dash, "CN=Someone Else");
        assert_eq!(fx.manager().classify_active_dash(), ActiveDash::Unknown);
    }

    #[test]
    fn foreign_product_name_is_unknown() {
        let fx = Fixture::new();
        write_len(&fx.paths.active_dash, 100, 1);
        fx.inspector.set_product(&fx.paths.active_dash, "Some Other Dash");
        fx.inspector.set_issuer(&fx.paths.active_dash, DEFAULT_TRUSTED_ISSUER);
        assert_eq!(fx.manager().classify_active_dash(), ActiveDash::Unknown);
    }

    #[test]
    fn classification_is_idempotent() {
        let fx = Fixture::new();
        fx.killer_slot(100);
        let mut m = fx.manager();
        let first = m.refresh_installed_and_active_state();
        let second = m.refresh_installed_and_active_state();
        assert_eq!(first, second);
        assert_eq!(m.classify_active_dash(), first);
    }

    #[test]
    fn refresh_marks_active_variant() {
        let fx = Fixture::new();
        fx.killer_slot(100);
        fx.store(DashType::OculusKiller, 100, 2);
        let mut m = fx.manager();
        m.refresh_installed_and_active_state();
        assert!(m.variant(DashType::OculusKiller).active);
        assert!(m.variant(DashType::OculusKiller).installed);
        assert!(!m.variant(DashType::Normal).active);
        assert!(!m.is_installed(DashType::Normal));
    }

    #[test]
    fn generate_dashes_is_idempotent() {
        let fx = Fixture::new();
        fx.store(DashType::Normal, 10, 1);
        let mut m = fx.manager();
        m.generate_dashes();
        m.generate_dashes();
        assert_eq!(m.variants().count(), 2);
        assert!(m.is_installed(DashType::Normal));
    }

    #[test]
    fn dash_names() {
        let fx = Fixture::new();
        let m = fx.manager();
        assert_eq!(m.dash_name(ActiveDash::Normal), "Official Oculus Dash");
        assert_eq!(m.dash_name(ActiveDash::OculusKiller), "DevOculus-Meta-Quest - Oculus Killer");
        assert_eq!(m.dash_name(ActiveDash::Unknown), "Unknown");
        assert_eq!(m.dash_name(ActiveDash::Missing), "Missing");
    }

    // ── startup sync ──────────────────────────────────────────────────────────

    #[tokio::test]
    async fn startup_downloads_missing_replacement_and_backs_up_stock_dash() {
        let fx = Fixture::new();
        fx.genuine_stock_slot(1000);
        let releases = FakeReleases::serving(vec![9; 300]);
        let mut m = fx.manager();

        let active = m.startup_sync(&releases).await.unwrap();
        assert_eq!(active, ActiveDash::Normal);
        assert!(m.is_installed(DashType::OculusKiller));
        assert!(m.is_installed(DashType::Normal));
        let stored = fx.paths.variant_path("OculusDash_Normal.exe");
        assert_eq!(fs::read(stored).unwrap(), vec![1; 1000]);
    }

    #[tokio::test]
    async fn startup_refreshes_stale_stock_backup() {
        let fx = Fixture::new();
        fx.genuine_stock_slot(1200);
        fx.store(DashType::Normal, 1000, 5);
        fx.store(DashType::OculusKiller, 300, 2);
        let releases = FakeReleases::offline();
        let mut m = fx.manager();

        m.startup_sync(&releases).await.unwrap();
        let stored = fx.paths.variant_path("OculusDash_Normal.exe");
        assert_eq!(fs::metadata(stored).unwrap().len(), 1200);
        assert_eq!(releases.downloads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn startup_never_backs_up_unknown_dash() {
        let fx = Fixture::new();
        write_len(&fx.paths.active_dash, 1000, 3);
        fx.store(DashType::OculusKiller, 300, 2);
        let mut m = fx.manager();

        let active = m.startup_sync(&FakeReleases::offline()).await.unwrap();
        assert_eq!(active, ActiveDash::Unknown);
        assert!(!m.is_installed(DashType::Normal));
    }

    #[tokio::test]
    async fn startup_survives_offline_download() {
        let fx = Fixture::new();
        fx.killer_slot(300);
        let mut m = fx.manager();
        let active = m.startup_sync(&FakeReleases::offline()).await.unwrap();
        assert_eq!(active, ActiveDash::OculusKiller);
        assert!(!m.is_installed(DashType::OculusKiller));
    }

    #[tokio::test]
    async fn update_downloads_only_when_sizes_differ() {
        let fx = Fixture::new();
        fx.store(DashType::OculusKiller, 300, 2);
        let mut m = fx.manager();

        let same = FakeReleases::serving(vec![0; 300]);
        assert!(!m.update(&same).await.unwrap());
        assert_eq!(same.downloads.load(Ordering::SeqCst), 0);

        let newer = FakeReleases::serving(vec![0; 320]);
        assert!(m.update(&newer).await.unwrap());
        assert_eq!(newer.downloads.load(Ordering::SeqCst), 1);
        assert!(!m.variant(DashType::OculusKiller).needs_update);
        assert_eq!(m.variant(DashType::OculusKiller).current_version.as_deref(), Some("v-test"));
    }

    #[tokio::test]
    async fn check_for_updates_never_downloads() {
        let fx = Fixture::new();
        fx.store(DashType::OculusKiller, 300, 2);
        fx.store(DashType::Normal, 1000, 1);
        let mut m = fx.manager();

        let newer = FakeReleases::serving(vec![0; 320]);
        m.check_for_updates(&newer).await;
        assert!(m.variant(DashType::OculusKiller).needs_update);
        assert!(!m.variant(DashType::Normal).needs_update);
        assert_eq!(newer.downloads.load(Ordering::SeqCst), 0);

        m.check_for_updates(&FakeReleases::serving(vec![0; 300])).await;
        let killer = m.variant(DashType::OculusKiller);
        assert!(!killer.needs_update);
        assert_eq!(killer.current_version.as_deref(), Some("v-test"));
    }

    // ── switching ─────────────────────────────────────────────────────────────

    #[test]
    fn set_active_dash_switches_and_reclassifies() {
        let fx = Fixture::new();
        fx.genuine_stock_slot(1000);
        fx.store(DashType::OculusKiller, 300, 2);
        fx.inspector
            .set_product(&fx.paths.variant_path("Oculus_Killer.exe"), "Oculus Killer");
        let mut m = fx.manager();

        let result = m.set_active_dash(DashType::OculusKiller).unwrap();
        assert!(result.succeeded());
        assert_eq!(fs::read(&fx.paths.active_dash).unwrap(), vec![2; 300]);
    }

    #[test]
    fn safe_strategy_is_used_when_fast_switch_disabled() {
        let fx = Fixture::new();
        fx.killer_slot(300);
        fx.store(DashType::Normal, 1000, 1);
        fx.procs.spawn("OculusDash", 11);
        let config = DashConfig {
            fast_switch: false,
            ..DashConfig::default()
        };
        let mut m = fx.manager_with(config);

        assert!(m.set_active_dash(DashType::Normal).unwrap().succeeded());
        // The safe path never kills the running dash.
        assert_eq!(fx.procs.calls(), vec!["close:vrmonitor".to_string()]);
        assert!(!fx.paths.sidecar().exists());
    }

    #[test]
    fn fast_transition_of_missing_variant_gives_up_immediately() {
        let fx = Fixture::new();
        fx.killer_slot(300);
        let mut m = fx.manager();
        assert!(!m.activate_fast_transition(DashType::Normal).unwrap());
    }

    static LOCKED_COPIES: AtomicUsize = AtomicUsize::new(0);

    fn locked_twice(from: &Path, to: &Path) -> io::Result<u64> {
        if LOCKED_COPIES.fetch_add(1, Ordering::SeqCst) < 2 {
            return Err(lock_conflict());
        }
        fs::copy(from, to)
    }

    #[test]
    fn fast_transition_retries_lock_conflicts() {
        let fx = Fixture::new();
        fx.killer_slot(300);
        fx.store(DashType::Normal, 1000, 1);
        let engine = ActivationEngine::new(fx.paths.clone(), fx.procs.clone()).with_copier(locked_twice);
        let mut m = DashManager::with_engine(engine, fx.inspector.clone(), DashConfig::default())
            .with_retry_delay(Duration::from_millis(1));

        assert!(m.activate_fast_transition(DashType::Normal).unwrap());
        assert_eq!(LOCKED_COPIES.load(Ordering::SeqCst), 3);
        assert_eq!(fs::read(&fx.paths.active_dash).unwrap(), vec![1; 1000]);
    }

    fn always_locked(_from: &Path, _to: &Path) -> io::Result<u64> {
        Err(lock_conflict())
    }

    #[test]
    fn fast_transition_stops_after_attempt_budget() {
        let fx = Fixture::new();
        fx.killer_slot(300);
        fx.store(DashType::Normal, 1000, 1);
        let engine = ActivationEngine::new(fx.paths.clone(), fx.procs.clone()).with_copier(always_locked);
        let config = DashConfig {
            fast_switch_attempts: 3,
            ..DashConfig::default()
        };
        let mut m = DashManager::with_engine(engine, fx.inspector.clone(), config)
            .with_retry_delay(Duration::from_millis(1));

        assert!(!m.activate_fast_transition(DashType::Normal).unwrap());
        // Every failed attempt restored the previous dash.
        assert_eq!(fs::read(&fx.paths.active_dash).unwrap(), vec![2; 300]);
    }
}
