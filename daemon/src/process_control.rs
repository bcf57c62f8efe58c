/// Process control surface used by dash activation and the SteamVR helpers:
/// enumerate by name, cooperative close, force-terminate, wait-for-exit.
///
/// Names are matched case-insensitively with or without the `.exe` suffix, so
/// `"vrmonitor"` and `"vrmonitor.exe"` find the same process.
use std::io;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use sysinfo::{Pid, ProcessesToUpdate, System};
use tracing::debug;

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

pub trait ProcessControl: Send + Sync {
    /// Pids of running processes called `name`.
    fn find(&self, name: &str) -> Vec<u32>;

    /// Asks every process called `name` to close its main window.
    /// Returns the number of processes asked; zero when none are running.
    fn close_main_window(&self, name: &str) -> io::Result<usize>;

    /// Terminates `pid` immediately. A pid that is already gone is not an error.
    fn kill(&self, pid: u32) -> io::Result<()>;

    /// Blocks until `pid` has exited or `timeout` elapses; true if it exited.
    fn wait_for_exit(&self, pid: u32, timeout: Duration) -> bool;

    fn is_running(&self, name: &str) -> bool {
        !self.find(name).is_empty()
    }
}

/// Lower-cases `name` and strips a trailing `.exe`.
pub fn normalize_process_name(name: &str) -> String {
    let lower = name.to_lowercase();
    match lower.strip_suffix(".exe") {
        Some(stem) => stem.to_string(),
        None => lower,
    }
}

/// [`ProcessControl`] backed by the live OS process table.
pub struct SystemProcesses {
    sys: Mutex<System>,
}

impl SystemProcesses {
    pub fn new() -> Self {
        Self {
            sys: Mutex::new(System::new()),
        }
    }

    fn refreshed(&self) -> MutexGuard<'_, System> {
        let mut sys = self.sys.lock().unwrap_or_else(PoisonError::into_inner);
        sys.refresh_processes(ProcessesToUpdate::All, true);
        sys
    }

    #[cfg(windows)]
    fn request_close(&self, pid: u32) -> io::Result<()> {
        let posted = imp::close_windows(pid)?;
        debug!(pid, windows = posted, "posted WM_CLOSE");
        Ok(())
    }

    #[cfg(not(windows))]
    fn request_close(&self, pid: u32) -> io::Result<()> {
        let sys = self.sys.lock().unwrap_or_else(PoisonError::into_inner);
        match sys.process(Pid::from_u32(pid)) {
            None => Ok(()),
            Some(p) => match p.kill_with(sysinfo::Signal::Term) {
                Some(true) => {
                    debug!(pid, "sent SIGTERM");
                    Ok(())
                }
                _ => Err(io::Error::other(format!("failed to signal pid {pid}"))),
            },
        }
    }
}

impl Default for SystemProcesses {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessControl for SystemProcesses {
    fn find(&self, name: &str) -> Vec<u32> {
        let wanted = normalize_process_name(name);
        let sys = self.refreshed();
        sys.processes()
            .iter()
            .filter(|(_, p)| normalize_process_name(&p.name().to_string_lossy()) == wanted)
            .map(|(pid, _)| pid.as_u32())
            .collect()
    }

    fn close_main_window(&self, name: &str) -> io::Result<usize> {
        let pids = self.find(name);
        for &pid in &pids {
            self.request_close(pid)?;
        }
        Ok(pids.len())
    }

    fn kill(&self, pid: u32) -> io::Result<()> {
        let sys = self.refreshed();
        match sys.process(Pid::from_u32(pid)) {
            None => Ok(()),
            Some(p) if p.kill() => Ok(()),
            Some(_) => Err(io::Error::other(format!("failed to terminate pid {pid}"))),
        }
    }

    fn wait_for_exit(&self, pid: u32, timeout: Duration) -> bool {
        let pid = Pid::from_u32(pid);
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut sys = self.sys.lock().unwrap_or_else(PoisonError::into_inner);
                sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
                if sys.process(pid).is_none() {
                    return true;
                }
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(EXIT_POLL_INTERVAL);
        }
    }
}

// ── Windows implementation ─────────────────────────────────────────────────────

#[cfg(windows)]
mod imp {
    use std::io;
    use windows::Win32::Foundation::{BOOL, HWND, LPARAM, WPARAM};
    use windows::Win32::UI::WindowsAndMessaging::{
        EnumWindows, GetWindowThreadProcessId, IsWindowVisible, PostMessageW, WM_CLOSE,
    };

    struct Search {
        pid: u32,
        windows: Vec<HWND>,
    }

    unsafe extern "system" fn collect(hwnd: HWND, lparam: LPARAM) -> BOOL {
        let search = &mut *(lparam.0 as *mut Search);
        let mut owner = 0u32;
        GetWindowThreadProcessId(hwnd, Some(&mut owner));
        if owner == search.pid && IsWindowVisible(hwnd).as_bool() {
            search.windows.push(hwnd);
        }
        BOOL(1)
    }

    /// Posts `WM_CLOSE` to every visible top-level window owned by `pid`.
    pub fn close_windows(pid: u32) -> io::Result<usize> {
        let mut search = Search {
            pid,
            windows: Vec::new(),
        };
        unsafe { EnumWindows(Some(collect), LPARAM(&mut search as *mut Search as isize)) }
            .map_err(|e| io::Error::other(e.to_string()))?;
        for hwnd in &search.windows {
            unsafe { PostMessageW(*hwnd, WM_CLOSE, WPARAM(0), LPARAM(0)) }
                .map_err(|e| io::Error::other(e.to_string()))?;
        }
        Ok(search.windows.len())
    }
}
