/// Hover-to-activate: holding the pointer over a button for a configured time
/// triggers its action, which matters when the user is inside the headset and
/// cannot click.
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, RwLock};
use tokio::time::{interval, MissedTickBehavior};
use tracing::debug;

use crate::config::Config;
use crate::event::ManagerEvent;
use crate::steamvr::SteamVr;

/// What a hover button does when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HoverAction {
    /// Switch to the stock dash through the retrying fast transition.
    Normal,
    /// Close SteamVR and reset the link.
    ExitLink,
}

/// One button as front-ends see it in the status file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct HoverButtonStatus {
    pub enabled: bool,
    pub hovering: bool,
    /// Fraction of the threshold held so far, 0.0 to 1.0.
    pub progress: f32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct HoverStatus {
    pub normal: HoverButtonStatus,
    pub exit_link: HoverButtonStatus,
}

#[derive(Debug)]
struct HoverState {
    enabled: bool,
    hovering: bool,
    started_at: Instant,
    threshold: Duration,
}

/// `Idle -> Hovering` on enter, back to `Idle` on leave/reset or after firing.
///
/// All transitions take the same lock, so a reset from the event loop and a
/// tick from the poller never interleave.
#[derive(Debug)]
pub struct HoverTimer {
    state: Mutex<HoverState>,
}

impl HoverTimer {
    pub fn new(threshold: Duration) -> Self {
        Self {
            state: Mutex::new(HoverState {
                enabled: false,
                hovering: false,
                started_at: Instant::now(),
                threshold,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HoverState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_enabled(&self, enabled: bool) {
        let mut state = self.lock();
        state.enabled = enabled;
        if !enabled {
            state.hovering = false;
        }
    }

    pub fn set_threshold(&self, threshold: Duration) {
        self.lock().threshold = threshold;
    }

    /// Starts a hover session at `now`. Ignored while disabled.
    pub fn enter(&self, now: Instant) {
        let mut state = self.lock();
        if state.enabled {
            state.hovering = true;
            state.started_at = now;
        }
    }

    pub fn leave(&self) {
        self.reset();
    }

    pub fn reset(&self) {
        let mut state = self.lock();
        state.hovering = false;
        state.started_at = Instant::now();
    }

    pub fn is_hovering(&self) -> bool {
        self.lock().hovering
    }

    /// State at `now`; progress is clamped to the threshold and zero when idle.
    pub fn snapshot(&self, now: Instant) -> HoverButtonStatus {
        let state = self.lock();
        let progress = if !state.hovering {
            0.0
        } else if state.threshold.is_zero() {
            1.0
        } else {
            let held = now.saturating_duration_since(state.started_at).min(state.threshold);
            held.as_secs_f32() / state.threshold.as_secs_f32()
        };
        HoverButtonStatus {
            enabled: state.enabled,
            hovering: state.hovering,
            progress,
        }
    }

    /// Returns `true` exactly once per hover session, when the elapsed time
    /// reaches the threshold; the timer is then back to idle.
    pub fn tick(&self, now: Instant) -> bool {
        let mut state = self.lock();
        if !state.enabled || !state.hovering {
            return false;
        }
        if now.saturating_duration_since(state.started_at) >= state.threshold {
            state.hovering = false;
            state.started_at = now;
            return true;
        }
        false
    }
}

pub struct HoverButton {
    pub action: HoverAction,
    pub timer: HoverTimer,
    /// Only fires while SteamVR is running, unless the setting overrides it.
    pub check_steamvr: bool,
}

/// The two hover buttons front-ends can drive.
pub struct HoverButtons {
    normal: HoverButton,
    exit_link: HoverButton,
}

impl HoverButtons {
    pub fn new(threshold: Duration) -> Self {
        Self {
            normal: HoverButton {
                action: HoverAction::Normal,
                timer: HoverTimer::new(threshold),
                check_steamvr: true,
            },
            exit_link: HoverButton {
                action: HoverAction::ExitLink,
                timer: HoverTimer::new(threshold),
                check_steamvr: true,
            },
        }
    }

    pub fn get(&self, action: HoverAction) -> &HoverButton {
        match action {
            HoverAction::Normal => &self.normal,
            HoverAction::ExitLink => &self.exit_link,
        }
    }

    fn iter(&self) -> impl Iterator<Item = &HoverButton> {
        [&self.normal, &self.exit_link].into_iter()
    }

    pub fn set_threshold(&self, threshold: Duration) {
        for button in self.iter() {
            button.timer.set_threshold(threshold);
        }
    }

    /// Enables the Normal button only when its dash is installed; ExitLink is
    /// always available.
    pub fn update_enabled(&self, normal_installed: bool) {
        self.normal.timer.set_enabled(normal_installed);
        self.exit_link.timer.set_enabled(true);
    }

    pub fn enter(&self, action: HoverAction, now: Instant) {
        self.get(action).timer.enter(now);
    }

    pub fn leave(&self, action: HoverAction) {
        self.get(action).timer.leave();
    }

    pub fn any_hovering(&self) -> bool {
        self.iter().any(|b| b.timer.is_hovering())
    }

    pub fn snapshot(&self, now: Instant) -> HoverStatus {
        HoverStatus {
            normal: self.normal.timer.snapshot(now),
            exit_link: self.exit_link.timer.snapshot(now),
        }
    }

    pub fn reset_all(&self) {
        for button in self.iter() {
            button.timer.reset();
        }
    }

    /// Ticks both buttons and returns the actions that fired. A button that
    /// needs SteamVR keeps its session but does not advance to firing while
    /// SteamVR is down.
    pub fn tick(&self, now: Instant, steamvr_running: bool, ignore_steamvr: bool) -> Vec<HoverAction> {
        self.iter()
            .filter(|b| !b.check_steamvr || ignore_steamvr || steamvr_running)
            .filter(|b| b.timer.tick(now))
            .map(|b| b.action)
            .collect()
    }
}

/// Ticks the hover buttons every `hover.poll_interval_ms` and posts fired
/// actions to the event loop, plus a progress event on every tick a button
/// is held. Returns when the loop's receiver is gone.
pub async fn run_poller(
    buttons: Arc<HoverButtons>,
    steamvr: Arc<SteamVr>,
    config: Arc<RwLock<Config>>,
    tx: mpsc::Sender<ManagerEvent>,
) {
    let period = config.read().await.hover.poll_interval();
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        let ignore = config.read().await.hover.ignore_steamvr_status;
        let now = Instant::now();
        let held = buttons.any_hovering();
        for action in buttons.tick(now, steamvr.server_running(), ignore) {
            debug!(?action, "hover button fired");
            if tx.send(ManagerEvent::HoverFired(action)).await.is_err() {
                return;
            }
        }
        if held && tx.send(ManagerEvent::HoverProgress).await.is_err() {
            return;
        }
    }
}
