use crate::config::Config;
use crate::dash_variant::DashType;
use crate::hover::HoverAction;
use crate::process_monitor::WatchedProcessEvent;

/// Everything the daemon's event loop reacts to.
#[derive(Debug)]
pub enum ManagerEvent {
    /// A process started or exited (already filtered by the ignore list).
    Process(WatchedProcessEvent),
    /// The config file changed on disk and was successfully re-parsed.
    ConfigReloaded(Config),
    /// Switch the slot to this dash through the link controller.
    ActivateRequested(DashType),
    /// The pointer entered a hover button.
    HoverEnter(HoverAction),
    /// The pointer left a hover button.
    HoverLeave(HoverAction),
    /// A hover button was held long enough.
    HoverFired(HoverAction),
    /// A hover button is still held; its progress should be published.
    HoverProgress,
    /// Close SteamVR and restart the link service, as if ExitLink fired.
    ResetLinkRequested,
    /// Ctrl+C received; the daemon should write final state and exit.
    Shutdown,
}
