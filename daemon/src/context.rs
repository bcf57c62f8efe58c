/// Shared daemon state and the handlers behind the event loop.
use anyhow::{anyhow, Context as _, Result};
use std::ops::ControlFlow;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::dash_manager::DashManager;
use crate::dash_variant::DashType;
use crate::event::ManagerEvent;
use crate::hover::{HoverAction, HoverButtons};
use crate::identity::{BinaryInspector, PeInspector};
use crate::link::LinkController;
use crate::logging::log_error;
use crate::paths::{self, RuntimePaths};
use crate::process_control::{ProcessControl, SystemProcesses};
use crate::process_monitor::WatchedProcessEvent;
use crate::release::{GitHubReleases, ReleaseSource};
use crate::services::{ServiceBackend, ServiceManager, WindowsScm};
use crate::status::{write_status, DaemonStatus};
use crate::steamvr::{close_steamvr_reset_link, SteamVr};

/// The OS-facing implementations a context is built from.
pub struct Backends {
    pub processes: Arc<dyn ProcessControl>,
    pub inspector: Arc<dyn BinaryInspector>,
    pub services: Arc<dyn ServiceBackend>,
    pub releases: Arc<dyn ReleaseSource>,
}

impl Backends {
    pub fn system() -> Result<Self> {
        Ok(Self {
            processes: Arc::new(SystemProcesses::new()),
            inspector: Arc::new(PeInspector),
            services: Arc::new(WindowsScm),
            releases: Arc::new(GitHubReleases::new().context("Failed to build HTTP client")?),
        })
    }
}

pub struct AppContext {
    pub config: Arc<RwLock<Config>>,
    pub dashes: Arc<Mutex<DashManager>>,
    pub link: Arc<LinkController>,
    pub steamvr: Arc<SteamVr>,
    pub hover: Arc<HoverButtons>,
    pub releases: Arc<dyn ReleaseSource>,
    pub status_path: PathBuf,
    pub status: DaemonStatus,
}

impl AppContext {
    /// Builds the context for the real machine, locating the Oculus runtime.
    pub fn for_system(config: Config) -> Result<Self> {
        let runtime = RuntimePaths::locate(config.dash.oculus_base.as_deref())
            .ok_or_else(|| anyhow!("Oculus runtime not found; set OculusBase or dash.oculus_base"))?;
        if !runtime.oculus_installed() {
            warn!(base = %runtime.base.display(), "Oculus client executable not found");
        }
        let status_path = paths::status_file_path()?;
        Ok(Self::new(config, runtime, Backends::system()?, status_path))
    }

    pub fn new(config: Config, runtime: RuntimePaths, backends: Backends, status_path: PathBuf) -> Self {
        let services = Arc::new(ServiceManager::new(backends.services));
        let steamvr = Arc::new(SteamVr::new(Arc::clone(&backends.processes)));
        let link = Arc::new(LinkController::new(
            services,
            Arc::clone(&steamvr),
            config.link.clone(),
        ));
        let dashes = DashManager::new(
            runtime,
            backends.processes,
            backends.inspector,
            config.dash.clone(),
        );
        let hover = Arc::new(HoverButtons::new(config.hover.threshold()));

        Self {
            config: Arc::new(RwLock::new(config)),
            dashes: Arc::new(Mutex::new(dashes)),
            link,
            steamvr,
            hover,
            releases: backends.releases,
            status_path,
            status: DaemonStatus::new(),
        }
    }

    /// Startup reconciliation: SteamVR state, interrupted switches, missing
    /// downloads and the stock dash backup.
    pub async fn startup(&mut self) -> Result<()> {
        self.steamvr.seed();
        {
            let mut dashes = self.dashes.lock().await;
            dashes.generate_dashes();
            if let Err(e) = dashes.startup_sync(self.releases.as_ref()).await {
                log_error(&e, Some("startup sync"));
                self.status.error = Some(format!("Startup sync failed: {e}"));
            }
        }
        self.refresh_status().await;
        Ok(())
    }

    /// Re-derives the status file contents and writes it out.
    pub async fn refresh_status(&mut self) {
        {
            let mut dashes = self.dashes.lock().await;
            let active = dashes.refresh_installed_and_active_state();
            self.status.current_dash = active;
            self.status.current_dash_name = dashes.dash_name(active).to_string();
            self.status.normal_installed = dashes.is_installed(DashType::Normal);
            self.status.oculus_killer_installed = dashes.is_installed(DashType::OculusKiller);
            self.hover.update_enabled(self.status.normal_installed);
        }
        self.status.hover = self.hover.snapshot(Instant::now());
        self.status.steamvr_running = self.steamvr.server_running();
        let link = Arc::clone(&self.link);
        self.status.link_service = tokio::task::spawn_blocking(move || link.service_state())
            .await
            .unwrap_or(crate::services::ServiceState::NotFound);
        write_status(&self.status_path, &self.status);
    }

    /// Handles one event. `Break` ends the event loop.
    pub async fn handle(&mut self, event: ManagerEvent) -> ControlFlow<()> {
        match event {
            ManagerEvent::Process(event) => self.on_process(event).await,
            ManagerEvent::ConfigReloaded(config) => self.on_config(config).await,
            ManagerEvent::ActivateRequested(kind) => {
                let succeeded = self.activate(kind).await;
                self.finish_activation(kind, succeeded).await;
            }
            ManagerEvent::HoverEnter(action) => {
                self.hover.enter(action, Instant::now());
                self.publish_hover();
            }
            ManagerEvent::HoverLeave(action) => {
                self.hover.leave(action);
                self.publish_hover();
            }
            ManagerEvent::HoverProgress => self.publish_hover(),
            ManagerEvent::HoverFired(HoverAction::Normal) => {
                let succeeded = self.fast_transition(DashType::Normal).await;
                self.finish_activation(DashType::Normal, succeeded).await;
            }
            ManagerEvent::HoverFired(HoverAction::ExitLink) => {
                self.publish_hover();
                self.reset_link_after_steamvr().await;
            }
            ManagerEvent::ResetLinkRequested => {
                info!("link reset requested");
                let link = Arc::clone(&self.link);
                if let Err(e) = tokio::task::spawn_blocking(move || link.reset_link()).await {
                    warn!(error = %e, "link reset task failed");
                }
                self.refresh_status().await;
            }
            ManagerEvent::Shutdown => {
                info!("shutting down");
                self.hover.reset_all();
                let link = Arc::clone(&self.link);
                if let Err(e) = tokio::task::spawn_blocking(move || link.stop_services_on_exit()).await {
                    warn!(error = %e, "service shutdown task failed");
                }
                self.refresh_status().await;
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    fn publish_hover(&mut self) {
        self.status.hover = self.hover.snapshot(Instant::now());
        write_status(&self.status_path, &self.status);
    }

    async fn on_process(&mut self, event: WatchedProcessEvent) {
        if !self.steamvr.apply(&event) {
            return;
        }
        debug!(running = self.steamvr.server_running(), "SteamVR server state changed");
        let reset_on_exit = self.config.read().await.link.exit_link_on_user_exit_steamvr;
        if self.steamvr.take_user_exit(reset_on_exit) {
            info!("SteamVR closed by the user");
            self.reset_link_after_steamvr().await;
        }
        self.status.steamvr_running = self.steamvr.server_running();
        write_status(&self.status_path, &self.status);
    }

    async fn on_config(&mut self, config: Config) {
        info!("config reloaded");
        self.dashes.lock().await.apply_config(config.dash.clone());
        self.hover.set_threshold(config.hover.threshold());
        let link = Arc::clone(&self.link);
        let link_config = config.link.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || link.apply_config(link_config)).await {
            warn!(error = %e, "link reconfiguration task failed");
        }
        *self.config.write().await = config;
    }

    /// Activation through the link controller, run on the blocking pool.
    pub async fn activate(&self, kind: DashType) -> bool {
        let dashes = Arc::clone(&self.dashes);
        let link = Arc::clone(&self.link);
        let outcome = tokio::task::spawn_blocking(move || {
            let mut dashes = dashes.blocking_lock();
            link.activate(&mut dashes, kind)
        })
        .await;
        self.settle(kind, outcome)
    }

    /// Retrying fast transition without touching the service.
    async fn fast_transition(&self, kind: DashType) -> bool {
        let dashes = Arc::clone(&self.dashes);
        let steamvr = Arc::clone(&self.steamvr);
        let outcome = tokio::task::spawn_blocking(move || {
            steamvr.set_manager_called_exit();
            dashes.blocking_lock().activate_fast_transition(kind)
        })
        .await;
        self.settle(kind, outcome)
    }

    fn settle(
        &self,
        kind: DashType,
        outcome: Result<Result<bool, crate::error::ActivationError>, tokio::task::JoinError>,
    ) -> bool {
        match outcome {
            Ok(Ok(activated)) => activated,
            Ok(Err(e)) => {
                log_error(&e, Some(&format!("activating {kind}")));
                false
            }
            Err(e) => {
                warn!(error = %e, "activation task failed");
                false
            }
        }
    }

    async fn finish_activation(&mut self, kind: DashType, succeeded: bool) {
        self.status.record_activation(kind, succeeded);
        self.status.error = (!succeeded).then(|| format!("Activation of {kind} failed"));
        self.refresh_status().await;
    }

    async fn reset_link_after_steamvr(&self) {
        let delay = self.config.read().await.link.restart_delay();
        // The delayed restart keeps running on its own.
        let _worker = close_steamvr_reset_link(
            Arc::clone(&self.steamvr),
            Arc::clone(&self.link),
            delay,
        )
        .await;
    }
}
