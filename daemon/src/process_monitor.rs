use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use sysinfo::{ProcessesToUpdate, System};
use tokio::sync::{broadcast, RwLock};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, trace};

use crate::config::Config;
use crate::process_control::normalize_process_name;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessEventKind {
    Started,
    Exited,
}

/// A process appearing in or disappearing from the process table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedProcessEvent {
    /// Executable name as reported by the OS, e.g. `vrserver.exe`.
    pub name: String,
    pub pid: u32,
    pub kind: ProcessEventKind,
}

impl WatchedProcessEvent {
    /// True when this event is about `name` (case-insensitive, `.exe` optional).
    #[cfg(test)]
    pub fn is(&self, name: &str) -> bool {
        normalize_process_name(&self.name) == normalize_process_name(name)
    }
}

/// Diffs successive process-table snapshots into start/exit events and
/// broadcasts them. Subscribers unsubscribe by dropping their receiver.
pub struct ProcessWatcher {
    tx: broadcast::Sender<WatchedProcessEvent>,
    known: HashMap<u32, String>,
    ignored: HashSet<String>,
}

impl ProcessWatcher {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            tx,
            known: HashMap::new(),
            ignored: HashSet::new(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WatchedProcessEvent> {
        self.tx.subscribe()
    }

    #[cfg(test)]
    pub fn sender(&self) -> broadcast::Sender<WatchedProcessEvent> {
        self.tx.clone()
    }

    pub fn set_ignored<I, S>(&mut self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.ignored = names
            .into_iter()
            .map(|n| normalize_process_name(n.as_ref()))
            .collect();
    }

    /// Records `snapshot` as the baseline without emitting anything.
    pub fn seed(&mut self, snapshot: HashMap<u32, String>) {
        self.known = snapshot;
    }

    /// Computes the events between the previous snapshot and `snapshot`,
    /// dropping ignored names, and makes `snapshot` the new baseline.
    pub fn diff(&mut self, snapshot: HashMap<u32, String>) -> Vec<WatchedProcessEvent> {
        let mut events = Vec::new();
        for (pid, name) in &self.known {
            // A reused pid with a different name counts as exit plus start.
            if snapshot.get(pid) != Some(name) {
                events.push(WatchedProcessEvent {
                    name: name.clone(),
                    pid: *pid,
                    kind: ProcessEventKind::Exited,
                });
            }
        }
        for (pid, name) in &snapshot {
            if self.known.get(pid) != Some(name) {
                events.push(WatchedProcessEvent {
                    name: name.clone(),
                    pid: *pid,
                    kind: ProcessEventKind::Started,
                });
            }
        }
        self.known = snapshot;
        events.retain(|e| !self.ignored.contains(&normalize_process_name(&e.name)));
        events
    }

    /// Broadcasts `events`. With no subscribers the events are dropped.
    pub fn publish(&self, events: Vec<WatchedProcessEvent>) {
        for event in events {
            trace!(name = %event.name, pid = event.pid, kind = ?event.kind, "process event");
            let _ = self.tx.send(event);
        }
    }

    /// Polls the OS process list every `watcher.poll_interval_ms` and
    /// publishes the differences. Runs until the task is aborted.
    pub async fn run(mut self, config: Arc<RwLock<Config>>) {
        let mut sys = System::new();
        sys.refresh_processes(ProcessesToUpdate::All, true);
        self.seed(snapshot(&sys));

        let period = config.read().await.watcher.poll_interval();
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!(?period, processes = self.known.len(), "process watcher started");

        loop {
            ticker.tick().await;

            {
                let config = config.read().await;
                self.set_ignored(&config.watcher.ignored_processes);
            }

            sys.refresh_processes(ProcessesToUpdate::All, true);
            let events = self.diff(snapshot(&sys));
            self.publish(events);
        }
    }
}

impl Default for ProcessWatcher {
    fn default() -> Self {
        Self::new()
    }
}

fn snapshot(sys: &System) -> HashMap<u32, String> {
    sys.processes()
        .iter()
        .map(|(pid, p)| (pid.as_u32(), p.name().to_string_lossy().into_owned()))
        .collect()
}
