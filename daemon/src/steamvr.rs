/// SteamVR process state and the "close SteamVR and reset the link" routine.
///
/// Running flags for `steam`, `vrserver` and `vrmonitor` are fed by process
/// watcher events. `manager_called_exit` marks shutdowns this daemon caused,
/// so that only a user quitting SteamVR triggers an automatic link reset.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::link::LinkController;
use crate::process_control::{normalize_process_name, ProcessControl};
use crate::process_monitor::{ProcessEventKind, WatchedProcessEvent};

const STEAM: &str = "steam";
const VR_SERVER: &str = "vrserver";
const VR_MONITOR: &str = "vrmonitor";

pub struct SteamVr {
    processes: Arc<dyn ProcessControl>,
    steam: AtomicBool,
    server: AtomicBool,
    monitor: AtomicBool,
    manager_called_exit: AtomicBool,
}

impl SteamVr {
    pub fn new(processes: Arc<dyn ProcessControl>) -> Self {
        Self {
            processes,
            steam: AtomicBool::new(false),
            server: AtomicBool::new(false),
            monitor: AtomicBool::new(false),
            manager_called_exit: AtomicBool::new(false),
        }
    }

    /// Initial running state from a process scan.
    pub fn seed(&self) {
        self.steam.store(self.processes.is_running(STEAM), Ordering::SeqCst);
        self.server.store(self.processes.is_running(VR_SERVER), Ordering::SeqCst);
        self.monitor.store(self.processes.is_running(VR_MONITOR), Ordering::SeqCst);
        debug!(
            steam = self.steam_running(),
            server = self.server_running(),
            monitor = self.monitor_running(),
            "SteamVR state seeded"
        );
    }

    pub fn steam_running(&self) -> bool {
        self.steam.load(Ordering::SeqCst)
    }

    pub fn server_running(&self) -> bool {
        self.server.load(Ordering::SeqCst)
    }

    pub fn monitor_running(&self) -> bool {
        self.monitor.load(Ordering::SeqCst)
    }

    pub fn set_manager_called_exit(&self) {
        self.manager_called_exit.store(true, Ordering::SeqCst);
    }

    pub fn manager_called_exit(&self) -> bool {
        self.manager_called_exit.load(Ordering::SeqCst)
    }

    /// Updates the running flags from a watcher event. Returns `true` when the
    /// event changed whether `vrserver` is running.
    pub fn apply(&self, event: &WatchedProcessEvent) -> bool {
        let running = event.kind == ProcessEventKind::Started;
        match normalize_process_name(&event.name).as_str() {
            STEAM => {
                self.steam.store(running, Ordering::SeqCst);
                false
            }
            VR_SERVER => self.server.swap(running, Ordering::SeqCst) != running,
            VR_MONITOR => {
                self.monitor.store(running, Ordering::SeqCst);
                false
            }
            _ => false,
        }
    }

    /// Called after a `vrserver` state change. Returns whether the change was
    /// a user exit that should reset the link, and clears `manager_called_exit`.
    pub fn take_user_exit(&self, reset_on_user_exit: bool) -> bool {
        let called_by_manager = self.manager_called_exit.swap(false, Ordering::SeqCst);
        !self.server_running() && !called_by_manager && reset_on_user_exit
    }

    /// Kills `vrserver` and closes `vrmonitor`, falling back to a kill when the
    /// monitor refuses a cooperative close.
    pub fn close_server(&self) {
        if self.server_running() || self.processes.is_running(VR_SERVER) {
            for pid in self.processes.find(VR_SERVER) {
                if let Err(e) = self.processes.kill(pid) {
                    warn!(pid, error = %e, "failed to kill vrserver");
                }
            }
        }
        self.close_monitor();
    }

    fn close_monitor(&self) {
        if let Err(e) = self.processes.close_main_window(VR_MONITOR) {
            debug!(error = %e, "vrmonitor refused to close, killing it");
            for pid in self.processes.find(VR_MONITOR) {
                if let Err(e) = self.processes.kill(pid) {
                    warn!(pid, error = %e, "failed to kill vrmonitor");
                }
            }
        }
    }
}

/// Closes SteamVR, stops the link, then returns a worker that brings the link
/// back after `delay` and closes SteamVR once more after a second `delay`.
///
/// The blocking process and service calls run on the blocking pool.
pub async fn close_steamvr_reset_link(
    steamvr: Arc<SteamVr>,
    link: Arc<LinkController>,
    delay: Duration,
) -> JoinHandle<()> {
    info!("closing SteamVR and resetting the link");
    {
        let steamvr = Arc::clone(&steamvr);
        let link = Arc::clone(&link);
        let stopped = tokio::task::spawn_blocking(move || {
            steamvr.close_server();
            link.stop_link();
            steamvr.close_server();
        })
        .await;
        if let Err(e) = stopped {
            warn!(error = %e, "link stop task failed");
        }
    }

    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let restarted = {
            let steamvr = Arc::clone(&steamvr);
            tokio::task::spawn_blocking(move || {
                steamvr.set_manager_called_exit();
                steamvr.close_server();
                link.start_link();
            })
            .await
        };
        if let Err(e) = restarted {
            warn!(error = %e, "link restart task failed");
        }

        tokio::time::sleep(delay).await;
        let closed = tokio::task::spawn_blocking(move || {
            steamvr.set_manager_called_exit();
            steamvr.close_server();
        })
        .await;
        if let Err(e) = closed {
            warn!(error = %e, "SteamVR close task failed");
        }
        debug!("link reset complete");
    })
}
