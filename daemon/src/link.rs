/// Oculus Link service control around dash activation.
///
/// The runtime service keeps the dash slot open while it runs, so activation
/// stops it first and restarts it afterwards. Every stop this controller makes
/// is flagged on [`SteamVr`] so the resulting SteamVR exit is not mistaken for
/// a user quitting.
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info, warn};

use crate::config::LinkConfig;
use crate::dash_manager::DashManager;
use crate::dash_variant::DashType;
use crate::error::ActivationError;
use crate::services::{ServiceHandle, ServiceManager, ServiceStartup, ServiceState};
use crate::steamvr::SteamVr;

pub struct LinkController {
    services: Arc<ServiceManager>,
    steamvr: Arc<SteamVr>,
    config: RwLock<LinkConfig>,
}

impl LinkController {
    /// Registers the runtime and library services with `services`.
    pub fn new(services: Arc<ServiceManager>, steamvr: Arc<SteamVr>, config: LinkConfig) -> Self {
        let link = Self {
            services,
            steamvr,
            config: RwLock::new(LinkConfig::default()),
        };
        link.apply_config(config);
        link
    }

    pub fn apply_config(&self, config: LinkConfig) {
        self.services.register(&config.service_name);
        self.services.register(&config.library_service_name);
        self.services.set_timeout(config.service_timeout());
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = config;
    }

    fn config(&self) -> LinkConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn service_name(&self) -> String {
        self.config().service_name
    }

    pub fn service_state(&self) -> ServiceState {
        self.services.get_state(&self.service_name())
    }

    /// Fresh state of every Oculus service this controller manages.
    pub fn services(&self) -> Vec<ServiceHandle> {
        self.services.snapshot()
    }

    /// Activates `kind` with the runtime service stopped. The dash is only
    /// touched once the service is confirmed down; the service is restarted
    /// afterwards if it was running, whatever the outcome.
    pub fn activate(&self, manager: &mut DashManager, kind: DashType) -> Result<bool, ActivationError> {
        let service = self.service_name();
        info!(%kind, "starting activation");

        let was_running = self.services.is_running(&service);
        if was_running {
            debug!(service = %service, "stopping runtime service");
            self.steamvr.set_manager_called_exit();
            self.services.stop(&service);
        }

        let outcome = if self.services.is_running(&service) {
            warn!(service = %service, "runtime service cannot be stopped, not activating");
            Ok(false)
        } else {
            if kind == DashType::Normal {
                self.steamvr.set_manager_called_exit();
            }
            manager.set_active_dash(kind).map(|r| r.succeeded())
        };

        if was_running {
            debug!(service = %service, "restarting runtime service");
            self.services.start(&service);
        }
        outcome
    }

    /// Restarts the runtime service if it is running.
    pub fn reset_link(&self) {
        let service = self.service_name();
        if self.services.is_running(&service) {
            self.steamvr.set_manager_called_exit();
            self.services.stop(&service);
            self.services.start(&service);
            self.steamvr.set_manager_called_exit();
        }
    }

    pub fn stop_link(&self) {
        let service = self.service_name();
        if self.services.is_running(&service) {
            self.steamvr.set_manager_called_exit();
            self.services.stop(&service);
            self.steamvr.set_manager_called_exit();
        }
    }

    pub fn start_link(&self) {
        let service = self.service_name();
        if !self.services.is_running(&service) {
            self.services.start(&service);
        }
    }

    /// Stops the library and runtime services on daemon exit when configured,
    /// but only those set to manual start.
    pub fn stop_services_on_exit(&self) {
        let config = self.config();
        if !config.close_services_on_exit {
            return;
        }
        for name in [&config.library_service_name, &config.service_name] {
            if self.services.get_startup(name) == Some(ServiceStartup::Manual) {
                info!(service = %name, "stopping service on exit");
                self.services.stop(name);
            }
        }
    }
}
