/// Dash activation engine: places a variant's binary into the runtime's
/// `OculusDash.exe` slot.
///
/// Two strategies are provided:
///   - [`ActivationEngine::activate`] (safe) closes the variant's dependent
///     process, copies the binary over the slot and verifies it by length.
///   - [`ActivationEngine::activate_fast`] moves the running dash aside to a
///     `.delete` sidecar, copies the new binary in, and only once the copy is
///     verified kills the old dash process and removes the sidecar.
///
/// In both, a failed verification never leads to a destructive step, and every
/// file operation holds an exclusive advisory lock on the dash directory so two
/// activations cannot interleave their copy and delete steps.
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::dash_variant::DashVariant;
use crate::error::{is_lock_conflict, ActivationError, ReleaseError};
use crate::paths::RuntimePaths;
use crate::process_control::ProcessControl;
use crate::release::ReleaseSource;

/// Process name of whatever binary currently runs from the slot.
pub const ACTIVE_DASH_PROCESS: &str = "OculusDash";
const LOCK_FILE_NAME: &str = ".nexus-dash.lock";
const DASH_EXIT_TIMEOUT: Duration = Duration::from_secs(5);
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Copies `from` to `to`, returning the number of bytes copied.
pub type CopyFn = fn(&Path, &Path) -> io::Result<u64>;

/// Why an activation attempt did not place the variant in the slot.
/// None of these are fatal; the caller may retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    NotInstalled,
    ProcessLockConflict,
    SizeMismatchAfterCopy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationResult {
    Activated,
    Failed(FailureReason),
}

impl ActivationResult {
    pub fn succeeded(&self) -> bool {
        matches!(self, ActivationResult::Activated)
    }

    pub fn failure(&self) -> Option<FailureReason> {
        match self {
            ActivationResult::Activated => None,
            ActivationResult::Failed(reason) => Some(*reason),
        }
    }
}

/// Exclusive advisory lock on `<dash_dir>/.nexus-dash.lock`, released on drop.
struct DirLock {
    file: File,
}

impl DirLock {
    fn open(dash_dir: &Path) -> Result<File, ActivationError> {
        OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(dash_dir.join(LOCK_FILE_NAME))
            .map_err(ActivationError::Lock)
    }

    fn acquire(dash_dir: &Path) -> Result<Self, ActivationError> {
        let file = Self::open(dash_dir)?;
        file.lock_exclusive().map_err(ActivationError::Lock)?;
        Ok(Self { file })
    }

    /// Like [`DirLock::acquire`] but yields to the runtime while contended.
    async fn acquire_async(dash_dir: &Path) -> Result<Self, ActivationError> {
        let file = Self::open(dash_dir)?;
        let contended = fs2::lock_contended_error().raw_os_error();
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => return Ok(Self { file }),
                Err(e) if e.raw_os_error() == contended => {
                    tokio::time::sleep(LOCK_RETRY_INTERVAL).await;
                }
                Err(e) => return Err(ActivationError::Lock(e)),
            }
        }
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

fn file_len(path: &Path) -> Result<u64, ActivationError> {
    fs::metadata(path)
        .map(|m| m.len())
        .map_err(|e| ActivationError::io(path, e))
}

pub struct ActivationEngine {
    paths: RuntimePaths,
    processes: Arc<dyn ProcessControl>,
    copy: CopyFn,
}

impl ActivationEngine {
    pub fn new(paths: RuntimePaths, processes: Arc<dyn ProcessControl>) -> Self {
        Self {
            paths,
            processes,
            copy: |from, to| fs::copy(from, to),
        }
    }

    /// Replaces the file copy routine; used to simulate locked or truncated copies.
    #[cfg(test)]
    pub fn with_copier(mut self, copy: CopyFn) -> Self {
        self.copy = copy;
        self
    }

    pub fn paths(&self) -> &RuntimePaths {
        &self.paths
    }

    /// Sets `installed` to whether the variant's stored binary exists.
    pub fn check_installed(&self, variant: &mut DashVariant) {
        let stored = self.paths.variant_path(&variant.file_name);
        match fs::metadata(&stored) {
            Ok(meta) if meta.is_file() => {
                variant.installed = true;
                variant.current_size = Some(meta.len());
            }
            _ => {
                variant.installed = false;
                variant.current_size = None;
                variant.current_version = None;
            }
        }
    }

    /// Compares the stored binary's size with the latest release asset.
    /// Network failures leave `needs_update` untouched.
    pub async fn check_for_update(&self, variant: &mut DashVariant, releases: &dyn ReleaseSource) {
        let Some(source) = variant.source.clone() else {
            return;
        };
        if !variant.installed {
            return;
        }
        let stored = self.paths.variant_path(&variant.file_name);
        let local = match fs::metadata(&stored) {
            Ok(m) => m.len(),
            Err(e) => {
                warn!(dash = %variant.name(), error = %e, "cannot read stored dash size");
                return;
            }
        };
        match releases.latest_asset(&source).await {
            Ok(asset) => {
                variant.needs_update = asset.size != local;
                if !variant.needs_update {
                    variant.current_version = asset.release_name;
                }
                debug!(dash = %variant.name(), local, remote = asset.size, needs_update = variant.needs_update, "update check");
            }
            Err(e) => warn!(dash = %variant.name(), error = %e, "update check failed"),
        }
    }

    /// Downloads the variant's latest release into its stored file.
    ///
    /// The download lands in a `.tmp` file and only replaces the stored binary
    /// when its length matches the size the release advertises.
    ///
    /// When the variant is the active dash, the slot copy is removed first and
    /// refreshed from the new download afterwards; if anything fails the slot
    /// is restored from the stored copy so the runtime always has a dash.
    /// Returns whether the download completed.
    pub async fn download(
        &self,
        variant: &mut DashVariant,
        releases: &dyn ReleaseSource,
    ) -> Result<bool, ActivationError> {
        let Some(source) = variant.source.clone() else {
            debug!(dash = %variant.name(), "no remote source, nothing to download");
            return Ok(false);
        };
        let _lock = DirLock::acquire_async(&self.paths.dash_dir).await?;

        let stored = self.paths.variant_path(&variant.file_name);
        let mut temp = stored.clone().into_os_string();
        temp.push(".tmp");
        let temp = std::path::PathBuf::from(temp);
        let slot = &self.paths.active_dash;

        let mut removed_slot = false;
        if variant.active && stored.is_file() {
            match fs::remove_file(slot) {
                Ok(()) => removed_slot = true,
                Err(e) => {
                    warn!(dash = %variant.name(), error = %e, "active dash is in use, skipping download");
                    return Ok(false);
                }
            }
        }

        info!(dash = %variant.name(), repo = %source.repo, project = %source.project, "downloading dash");
        let outcome = async {
            let asset = releases.latest_asset(&source).await?;
            let written = releases.download(&asset, &temp).await?;
            if written != asset.size {
                return Err(ReleaseError::Incomplete {
                    asset: asset.name,
                    expected: asset.size,
                    written,
                });
            }
            fs::rename(&temp, &stored)?;
            Ok::<_, ReleaseError>((asset, written))
        }
        .await;

        let completed = match outcome {
            Ok((asset, written)) => {
                variant.installed = true;
                variant.needs_update = false;
                variant.current_size = Some(written);
                info!(dash = %variant.name(), release = ?asset.release_name, bytes = written, "dash downloaded");
                variant.current_version = asset.release_name;
                if removed_slot {
                    if let Err(e) = fs::copy(&stored, slot) {
                        warn!(dash = %variant.name(), error = %e, "could not refresh active dash from download");
                    }
                }
                true
            }
            Err(e) => {
                error!(dash = %variant.name(), error = %e, "dash download failed");
                let _ = fs::remove_file(&temp);
                false
            }
        };

        if removed_slot && !slot.exists() {
            warn!(dash = %variant.name(), "restoring active dash from stored copy");
            fs::copy(&stored, slot).map_err(|e| ActivationError::io(slot, e))?;
        }
        Ok(completed)
    }

    /// Safe strategy: close the dependent process, copy over the slot, verify.
    /// Sidecars left by earlier fast switches are removed once the copy is
    /// verified and no dash runs from them.
    pub fn activate(&self, variant: &DashVariant) -> Result<ActivationResult, ActivationError> {
        if !variant.installed {
            return Ok(ActivationResult::Failed(FailureReason::NotInstalled));
        }
        let _lock = DirLock::acquire(&self.paths.dash_dir)?;

        self.stop_dependent_process(variant)?;

        let source = self.paths.variant_path(&variant.file_name);
        let result = self.switch_files(&source, &self.paths.active_dash)?;
        if result.succeeded() {
            self.remove_leftover_sidecars();
        }
        log_result(variant, "safe", result);
        Ok(result)
    }

    /// Fast strategy, suitable while the headset is in use.
    ///
    /// The slot is renamed to the sidecar rather than deleted, so at every
    /// point either the slot or the sidecar holds a working dash. A sidecar
    /// left by an earlier switch is parked under `.delete.old` first so the
    /// current slot always gets the sidecar name. The old dash process is
    /// killed and both leftovers removed only after the new binary is
    /// verified in place; on failure everything is moved back.
    pub fn activate_fast(&self, variant: &DashVariant) -> Result<ActivationResult, ActivationError> {
        if !variant.installed {
            return Ok(ActivationResult::Failed(FailureReason::NotInstalled));
        }
        let source = self.paths.variant_path(&variant.file_name);
        if !source.is_file() {
            return Ok(ActivationResult::Failed(FailureReason::NotInstalled));
        }
        let _lock = DirLock::acquire(&self.paths.dash_dir)?;

        let slot = &self.paths.active_dash;
        let sidecar = self.paths.sidecar();
        let stale = self.paths.stale_sidecar();

        // With an empty slot the sidecar of an interrupted run is the backup.
        let mut parked = false;
        let sidecar_is_backup = if slot.exists() {
            if sidecar.exists() {
                debug!(sidecar = %sidecar.display(), "parking sidecar from an earlier switch");
                if let Some(failed) = park(&sidecar, &stale)? {
                    return Ok(failed);
                }
                parked = true;
            }
            let moved = move_aside(slot, &sidecar);
            if parked && !matches!(moved, Ok(None)) {
                unpark(&stale, &sidecar);
            }
            if let Some(failed) = moved? {
                return Ok(failed);
            }
            true
        } else {
            sidecar.exists()
        };

        let result = self.switch_files(&source, slot);

        if !matches!(result, Ok(ActivationResult::Activated)) {
            if sidecar_is_backup {
                if let Err(e) = fs::rename(&sidecar, slot) {
                    error!(error = %e, "failed to move previous dash back into the slot");
                    return Err(ActivationError::io(slot, e));
                }
                debug!("previous dash restored from sidecar");
            }
            if parked {
                unpark(&stale, &sidecar);
            }
            if let Ok(r) = result {
                log_result(variant, "fast", r);
            }
            return result;
        }

        self.retire_previous_dash();
        self.stop_dependent_process(variant)?;

        log_result(variant, "fast", ActivationResult::Activated);
        Ok(ActivationResult::Activated)
    }

    /// Copies the binary currently in the slot into `variant`'s stored file.
    /// Used to keep a backup of the vendor's own dash.
    pub fn capture_active_dash(&self, variant: &mut DashVariant) -> Result<(), ActivationError> {
        let _lock = DirLock::acquire(&self.paths.dash_dir)?;
        let stored = self.paths.variant_path(&variant.file_name);
        fs::copy(&self.paths.active_dash, &stored).map_err(|e| ActivationError::io(&stored, e))?;
        self.check_installed(variant);
        info!(dash = %variant.name(), "stored copy refreshed from active dash");
        Ok(())
    }

    /// Startup cleanup of sidecars left by an interrupted fast switch.
    ///
    /// An empty slot gets the sidecar (or failing that the parked sidecar)
    /// moved back; otherwise the leftovers are deleted unless a dash process
    /// still runs from one of them.
    pub fn recover_interrupted_switch(&self) -> Result<(), ActivationError> {
        let sidecar = self.paths.sidecar();
        let stale = self.paths.stale_sidecar();
        if !sidecar.exists() && !stale.exists() {
            return Ok(());
        }
        let _lock = DirLock::acquire(&self.paths.dash_dir)?;
        let slot = &self.paths.active_dash;
        if !slot.exists() {
            let backup = if sidecar.exists() { &sidecar } else { &stale };
            warn!(backup = %backup.display(), "slot is empty, restoring previous dash");
            fs::rename(backup, slot).map_err(|e| ActivationError::io(slot, e))?;
        }
        self.remove_leftover_sidecars();
        Ok(())
    }

    /// Copies `new` over `slot` and verifies by byte length.
    /// A lock conflict is a non-fatal failure; other I/O errors are fatal.
    fn switch_files(&self, new: &Path, slot: &Path) -> Result<ActivationResult, ActivationError> {
        if !new.is_file() {
            return Ok(ActivationResult::Failed(FailureReason::NotInstalled));
        }
        match (self.copy)(new, slot) {
            Ok(_) => {}
            Err(e) if is_lock_conflict(&e) => {
                debug!(slot = %slot.display(), "slot is locked by another process");
                return Ok(ActivationResult::Failed(FailureReason::ProcessLockConflict));
            }
            Err(e) => return Err(ActivationError::io(slot, e)),
        }

        let source_len = file_len(new)?;
        let slot_len = match fs::metadata(slot) {
            Ok(m) => m.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Ok(ActivationResult::Failed(FailureReason::SizeMismatchAfterCopy));
            }
            Err(e) => return Err(ActivationError::io(slot, e)),
        };
        if source_len == slot_len {
            Ok(ActivationResult::Activated)
        } else {
            warn!(source_len, slot_len, "dash length mismatch after copy");
            Ok(ActivationResult::Failed(FailureReason::SizeMismatchAfterCopy))
        }
    }

    /// Kills the dash still running from the old binary, then deletes the sidecars.
    fn retire_previous_dash(&self) {
        let mut all_exited = true;
        for pid in self.processes.find(ACTIVE_DASH_PROCESS) {
            debug!(pid, "killing previous dash");
            if let Err(e) = self.processes.kill(pid) {
                warn!(pid, error = %e, "failed to kill previous dash");
            }
            all_exited &= self.processes.wait_for_exit(pid, DASH_EXIT_TIMEOUT);
        }
        if !all_exited {
            warn!("previous dash did not exit in time; sidecar removal may fail");
        }
        self.delete_sidecars();
    }

    /// Deletes both sidecars unless a dash process may still run from one.
    fn remove_leftover_sidecars(&self) {
        if !self.paths.sidecar().exists() && !self.paths.stale_sidecar().exists() {
            return;
        }
        if self.processes.is_running(ACTIVE_DASH_PROCESS) {
            debug!("dash still running, leaving sidecar for the next switch");
            return;
        }
        self.delete_sidecars();
    }

    fn delete_sidecars(&self) {
        for path in [self.paths.sidecar(), self.paths.stale_sidecar()] {
            match fs::remove_file(&path) {
                Ok(()) => debug!(path = %path.display(), "removed previous dash sidecar"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "could not remove sidecar, it will be cleaned up later"),
            }
        }
    }

    /// Cooperatively closes the variant's dependent process. Any failure is fatal
    /// to the activation: a process left attached may keep the slot locked.
    fn stop_dependent_process(&self, variant: &DashVariant) -> Result<(), ActivationError> {
        let Some(name) = variant.process_to_stop.as_deref() else {
            return Ok(());
        };
        match self.processes.close_main_window(name) {
            Ok(count) => {
                debug!(process = name, count, "asked dependent process to close");
                Ok(())
            }
            Err(source) => {
                error!(process = name, error = %source, "unable to close dependent process");
                Err(ActivationError::StopProcess {
                    name: name.to_string(),
                    source,
                })
            }
        }
    }
}

/// Renames `from` to `to`. A lock conflict becomes a non-fatal failure.
fn move_aside(from: &Path, to: &Path) -> Result<Option<ActivationResult>, ActivationError> {
    match fs::rename(from, to) {
        Ok(()) => Ok(None),
        Err(e) if is_lock_conflict(&e) => {
            debug!(path = %from.display(), "file is locked by another process");
            Ok(Some(ActivationResult::Failed(FailureReason::ProcessLockConflict)))
        }
        Err(e) => Err(ActivationError::io(from, e)),
    }
}

/// Moves `sidecar` to `stale`, replacing whatever an earlier park left there.
fn park(sidecar: &Path, stale: &Path) -> Result<Option<ActivationResult>, ActivationError> {
    match fs::remove_file(stale) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) if is_lock_conflict(&e) => {
            return Ok(Some(ActivationResult::Failed(FailureReason::ProcessLockConflict)));
        }
        Err(e) => return Err(ActivationError::io(stale, e)),
    }
    move_aside(sidecar, stale)
}

fn unpark(stale: &Path, sidecar: &Path) {
    if let Err(e) = fs::rename(stale, sidecar) {
        warn!(error = %e, "could not move parked sidecar back");
    }
}

fn log_result(variant: &DashVariant, strategy: &str, result: ActivationResult) {
    match result.failure() {
        None => info!(dash = %variant.name(), strategy, "dash activated"),
        Some(reason) => warn!(dash = %variant.name(), strategy, ?reason, "dash activation failed"),
    }
}
