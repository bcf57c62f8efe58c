/// Requests front-ends hand to a running daemon.
///
/// A request is a small TOML file dropped into the app data `requests`
/// directory. Writers create it under a `.part` name and rename it into
/// place, so the daemon never reads half a request. The daemon consumes each
/// file once, oldest first, and deletes it.
///
/// Whether a daemon is running is decided by [`DaemonLock`]: `nexus run`
/// holds it for its lifetime, and one-shot commands hold it while they work
/// so the two never switch the dash at the same time.
use anyhow::{Context, Result};
use fs2::FileExt;
use notify::{Config as NotifyConfig, RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::dash_variant::DashType;
use crate::event::ManagerEvent;
use crate::hover::HoverAction;

const REQUEST_EXT: &str = "toml";
const PARTIAL_EXT: &str = "part";

static SEQUENCE: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ControlRequest {
    /// Switch the slot through the link controller.
    Activate { dash: DashType },
    HoverEnter { button: HoverAction },
    HoverLeave { button: HoverAction },
    /// Restart the runtime service.
    ResetLink,
}

impl From<ControlRequest> for ManagerEvent {
    fn from(request: ControlRequest) -> Self {
        match request {
            ControlRequest::Activate { dash } => ManagerEvent::ActivateRequested(dash),
            ControlRequest::HoverEnter { button } => ManagerEvent::HoverEnter(button),
            ControlRequest::HoverLeave { button } => ManagerEvent::HoverLeave(button),
            ControlRequest::ResetLink => ManagerEvent::ResetLinkRequested,
        }
    }
}

/// Writes `request` into `dir` and returns the path it was published under.
pub fn submit(dir: &Path, request: &ControlRequest) -> Result<PathBuf> {
    fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create request directory {}", dir.display()))?;
    let body = toml::to_string(request).context("Failed to serialize request")?;

    // Zero-padded so that name order is submission order.
    let stamp = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
    let stem = format!(
        "{stamp:020}-{}-{}",
        std::process::id(),
        SEQUENCE.fetch_add(1, Ordering::Relaxed)
    );
    let partial = dir.join(format!("{stem}.{PARTIAL_EXT}"));
    let path = dir.join(format!("{stem}.{REQUEST_EXT}"));

    fs::write(&partial, body)
        .with_context(|| format!("Failed to write request {}", partial.display()))?;
    fs::rename(&partial, &path)
        .with_context(|| format!("Failed to publish request {}", path.display()))?;
    debug!(path = %path.display(), ?request, "request submitted");
    Ok(path)
}

/// Takes every published request out of `dir`, oldest first.
///
/// Unparseable files are logged and deleted. A file that cannot be read is
/// left for the next drain.
pub fn drain(dir: &Path) -> Vec<ControlRequest> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Vec::new(),
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "cannot list request directory");
            return Vec::new();
        }
    };
    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.extension().is_some_and(|ext| ext == REQUEST_EXT))
        .collect();
    files.sort();
    files.iter().filter_map(|path| take(path)).collect()
}

fn take(path: &Path) -> Option<ControlRequest> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot read request");
            return None;
        }
    };
    if let Err(e) = fs::remove_file(path) {
        // Not removable means it would be replayed on the next drain.
        warn!(path = %path.display(), error = %e, "cannot remove request, skipping it");
        return None;
    }
    match toml::from_str(&text) {
        Ok(request) => Some(request),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "discarding malformed request");
            None
        }
    }
}

/// Forwards requests dropped into `dir` to the event loop. Requests already
/// waiting when the daemon starts are delivered first. Returns when the
/// loop's receiver is gone or the directory cannot be watched.
pub async fn watch_requests(dir: PathBuf, tx: mpsc::Sender<ManagerEvent>) {
    if let Err(e) = fs::create_dir_all(&dir) {
        warn!(dir = %dir.display(), error = %e, "failed to create request directory");
        return;
    }

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
            warn!(error = %e, "failed to create request watcher");
            return;
        }
    };
    if let Err(e) = watcher.watch(&dir, RecursiveMode::NonRecursive) {
        warn!(error = %e, dir = %dir.display(), "failed to watch request directory");
        return;
    }

    if !forward(drain(&dir), &tx).await {
        return;
    }
    while let Some(event) = watch_rx.recv().await {
        let published = matches!(
            event.kind,
            notify::EventKind::Create(_) | notify::EventKind::Modify(_)
        ) && event
            .paths
            .iter()
            .any(|p| p.extension().is_some_and(|ext| ext == REQUEST_EXT));
        if published && !forward(drain(&dir), &tx).await {
            return;
        }
    }
}

async fn forward(requests: Vec<ControlRequest>, tx: &mpsc::Sender<ManagerEvent>) -> bool {
    for request in requests {
        info!(?request, "request received");
        if tx.send(request.into()).await.is_err() {
            return false;
        }
    }
    true
}

/// Exclusive lock on `daemon.lock`, released on drop.
pub struct DaemonLock {
    file: File,
}

impl DaemonLock {
    /// `None` when another process already holds the lock.
    pub fn try_acquire(path: &Path) -> Result<Option<Self>> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(Self { file })),
            Err(e) if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to lock {}", path.display())),
        }
    }
}

impl Drop for DaemonLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn requests_use_an_action_tag() {
        let text = toml::to_string(&ControlRequest::Activate {
            dash: DashType::OculusKiller,
        })
        .unwrap();
        assert!(text.contains("action = \"activate\""));
        assert!(text.contains("dash = \"oculus_killer\""));

        let parsed: ControlRequest = toml::from_str("action = \"hover_enter\"\nbutton = \"exit_link\"\n").unwrap();
        assert_eq!(parsed, ControlRequest::HoverEnter { button: HoverAction::ExitLink });

        let reset: ControlRequest = toml::from_str("action = \"reset_link\"").unwrap();
        assert_eq!(reset, ControlRequest::ResetLink);
    }

    #[test]
    fn requests_map_to_loop_events() {
        assert!(matches!(
            ManagerEvent::from(ControlRequest::Activate { dash: DashType::Normal }),
            ManagerEvent::ActivateRequested(DashType::Normal)
        ));
        assert!(matches!(
            ManagerEvent::from(ControlRequest::HoverLeave { button: HoverAction::Normal }),
            ManagerEvent::HoverLeave(HoverAction::Normal)
        ));
        assert!(matches!(
            ManagerEvent::from(ControlRequest::ResetLink),
            ManagerEvent::ResetLinkRequested
        ));
    }

    #[test]
    fn drain_returns_submissions_in_order_and_consumes_them() {
        let dir = tempfile::tempdir().unwrap();
        let first = ControlRequest::HoverEnter { button: HoverAction::Normal };
        let second = ControlRequest::Activate { dash: DashType::OculusKiller };
        submit(dir.path(), &first).unwrap();
        submit(dir.path(), &second).unwrap();

        assert_eq!(drain(dir.path()), vec![first, second]);
        assert!(drain(dir.path()).is_empty());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn drain_discards_malformed_and_ignores_partial_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("0001.toml"), "action = \"explode\"").unwrap();
        fs::write(dir.path().join("0002.part"), "action = \"reset_link\"").unwrap();
        fs::write(dir.path().join("0003.toml"), "action = \"reset_link\"").unwrap();

        assert_eq!(drain(dir.path()), vec![ControlRequest::ResetLink]);
        assert!(!dir.path().join("0001.toml").exists());
        assert!(dir.path().join("0002.part").exists());
    }

    #[test]
    fn drain_of_missing_directory_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(drain(&dir.path().join("requests")).is_empty());
    }

    #[test]
    fn daemon_lock_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.lock");

        let held = DaemonLock::try_acquire(&path).unwrap();
        assert!(held.is_some());
        assert!(DaemonLock::try_acquire(&path).unwrap().is_none());

        drop(held);
        assert!(DaemonLock::try_acquire(&path).unwrap().is_some());
    }

    #[tokio::test]
    async fn pending_requests_reach_the_event_loop() {
        let dir = tempfile::tempdir().unwrap();
        submit(dir.path(), &ControlRequest::Activate { dash: DashType::Normal }).unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        let watcher = tokio::spawn(watch_requests(dir.path().to_path_buf(), tx));

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, ManagerEvent::ActivateRequested(DashType::Normal)));
        watcher.abort();
    }
}
