mod activation;
mod config;
mod context;
mod control;
mod dash_manager;
mod dash_variant;
mod error;
mod event;
mod hover;
mod identity;
mod link;
mod logging;
mod paths;
mod process_control;
mod process_monitor;
mod release;
mod services;
mod status;
mod steamvr;
#[cfg(test)]
mod test_support;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

use crate::context::AppContext;
use crate::control::{ControlRequest, DaemonLock};
use crate::dash_variant::DashType;
use crate::event::ManagerEvent;
use crate::hover::HoverAction;
use crate::process_monitor::ProcessWatcher;

/// Switches the Oculus runtime between its stock dash and Oculus Killer.
#[derive(Debug, Parser)]
#[command(name = "nexus", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the daemon (default).
    Run,
    /// Activate a dash. Handed to the daemon when one is running.
    Activate {
        #[arg(value_enum)]
        dash: DashArg,
        /// Use the rename-aside strategy regardless of config.
        #[arg(long, conflicts_with = "safe")]
        fast: bool,
        /// Use the stop-then-copy strategy regardless of config.
        #[arg(long)]
        safe: bool,
    },
    /// Restart the Oculus runtime service. Handed to the daemon when one is running.
    ResetLink,
    /// Tell the running daemon the pointer entered or left a hover button.
    Hover {
        #[arg(value_enum)]
        edge: HoverEdge,
        #[arg(value_enum)]
        button: ButtonArg,
    },
    /// Classify the active dash and print the installed variants.
    Status,
    /// Download Oculus Killer if it is missing or out of date.
    Update,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum HoverEdge {
    Enter,
    Leave,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ButtonArg {
    Normal,
    ExitLink,
}

impl From<ButtonArg> for HoverAction {
    fn from(arg: ButtonArg) -> Self {
        match arg {
            ButtonArg::Normal => HoverAction::Normal,
            ButtonArg::ExitLink => HoverAction::ExitLink,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum DashArg {
    Normal,
    OculusKiller,
}

impl From<DashArg> for DashType {
    fn from(arg: DashArg) -> Self {
        match arg {
            DashArg::Normal => DashType::Normal,
            DashArg::OculusKiller => DashType::OculusKiller,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("nexus: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    // ── App data directory ────────────────────────────────────────────────────
    let app_dir = paths::app_data_dir()?;
    std::fs::create_dir_all(&app_dir)
        .with_context(|| format!("Failed to create app data directory {}", app_dir.display()))?;

    // ── Configuration ─────────────────────────────────────────────────────────
    let config_path = paths::config_file_path()?;
    let (mut config, config_error) = match config::load_or_default(&config_path) {
        Ok(config) => (config, None),
        Err(e) => (config::Config::default(), Some(e)),
    };

    // ── Logging ───────────────────────────────────────────────────────────────
    let _log_guard = logging::init(&paths::log_dir()?, &config.log.level)?;
    if let Some(e) = config_error {
        warn!(error = %format!("{e:#}"), "config unreadable, using defaults");
    }

    let lock_path = paths::daemon_lock_path()?;
    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run_daemon(config, config_path, &lock_path).await,
        Command::Activate { dash, fast, safe } => {
            let Some(_guard) = DaemonLock::try_acquire(&lock_path)? else {
                if fast || safe {
                    eprintln!("nexus: the running daemon uses its configured strategy");
                }
                return hand_to_daemon(ControlRequest::Activate { dash: dash.into() });
            };
            if fast || safe {
                config.dash.fast_switch = fast;
            }
            activate_once(config, dash.into()).await
        }
        Command::ResetLink => {
            let Some(_guard) = DaemonLock::try_acquire(&lock_path)? else {
                return hand_to_daemon(ControlRequest::ResetLink);
            };
            reset_link_once(config).await
        }
        Command::Hover { edge, button } => {
            if DaemonLock::try_acquire(&lock_path)?.is_some() {
                anyhow::bail!("no nexus daemon is running");
            }
            let button = button.into();
            hand_to_daemon(match edge {
                HoverEdge::Enter => ControlRequest::HoverEnter { button },
                HoverEdge::Leave => ControlRequest::HoverLeave { button },
            })
        }
        Command::Update => update_once(config).await,
        Command::Status => show_status(config).await,
    }
}

fn hand_to_daemon(request: ControlRequest) -> Result<ExitCode> {
    let path = control::submit(&paths::request_dir()?, &request)?;
    info!(path = %path.display(), ?request, "request handed to the running daemon");
    println!("Handed to the running daemon");
    Ok(ExitCode::SUCCESS)
}

async fn show_status(config: config::Config) -> Result<ExitCode> {
    let ctx = AppContext::for_system(config)?;
    let mut dashes = ctx.dashes.lock().await;
    dashes.check_for_updates(ctx.releases.as_ref()).await;
    let active = dashes.active();

    println!("Active dash:  {} ({active})", dashes.dash_name(active));
    for variant in dashes.variants() {
        let state = match (variant.installed, variant.active) {
            (true, true) => "installed, active",
            (true, false) => "installed",
            (false, _) => "not installed",
        };
        let update = if variant.needs_update { ", update available" } else { "" };
        println!("  {:<40} {state}{update}", variant.name());
    }
    if let Some(version) = &dashes.variant(DashType::OculusKiller).current_version {
        println!("Oculus Killer release: {version}");
    }
    for service in ctx.link.services() {
        let state = service
            .last_state
            .map_or_else(|| "unknown".to_string(), |s| s.to_string());
        println!("Service {:<30} {state}", service.name);
    }
    Ok(ExitCode::SUCCESS)
}

async fn activate_once(config: config::Config, kind: DashType) -> Result<ExitCode> {
    let mut ctx = AppContext::for_system(config)?;
    ctx.steamvr.seed();
    ctx.dashes.lock().await.generate_dashes();

    let succeeded = ctx.activate(kind).await;
    ctx.status.record_activation(kind, succeeded);
    ctx.refresh_status().await;

    if succeeded {
        println!("Activated {kind}");
        Ok(ExitCode::SUCCESS)
    } else {
        eprintln!("Failed to activate {kind}");
        Ok(ExitCode::FAILURE)
    }
}

async fn update_once(config: config::Config) -> Result<ExitCode> {
    let mut ctx = AppContext::for_system(config)?;
    let releases = Arc::clone(&ctx.releases);
    let updated = {
        let mut dashes = ctx.dashes.lock().await;
        dashes.generate_dashes();
        dashes.update(releases.as_ref()).await?
    };
    ctx.refresh_status().await;
    println!("{}", if updated { "Oculus Killer updated" } else { "Oculus Killer is up to date" });
    Ok(ExitCode::SUCCESS)
}

async fn reset_link_once(config: config::Config) -> Result<ExitCode> {
    let mut ctx = AppContext::for_system(config)?;
    let _ = ctx.handle(ManagerEvent::ResetLinkRequested).await;
    println!("Link service: {}", ctx.status.link_service);
    Ok(ExitCode::SUCCESS)
}

async fn run_daemon(
    config: config::Config,
    config_path: std::path::PathBuf,
    lock_path: &std::path::Path,
) -> Result<ExitCode> {
    let Some(_daemon_lock) = DaemonLock::try_acquire(lock_path)? else {
        anyhow::bail!("another nexus daemon is already running");
    };
    let mut ctx = AppContext::for_system(config)?;
    ctx.startup().await?;

    let (event_tx, mut event_rx) = mpsc::channel::<ManagerEvent>(64);

    // ── Background tasks ──────────────────────────────────────────────────────
    tokio::spawn(config::watch_config(config_path, event_tx.clone()));
    tokio::spawn(control::watch_requests(paths::request_dir()?, event_tx.clone()));

    let watcher = ProcessWatcher::new();
    let mut process_rx = watcher.subscribe();
    tokio::spawn(watcher.run(Arc::clone(&ctx.config)));
    {
        let tx = event_tx.clone();
        tokio::spawn(async move {
            loop {
                match process_rx.recv().await {
                    Ok(event) => {
                        if tx.send(ManagerEvent::Process(event)).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "process events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    tokio::spawn(hover::run_poller(
        Arc::clone(&ctx.hover),
        Arc::clone(&ctx.steamvr),
        Arc::clone(&ctx.config),
        event_tx.clone(),
    ));

    // Graceful shutdown on Ctrl+C.
    {
        let tx = event_tx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                let _ = tx.send(ManagerEvent::Shutdown).await;
            }
        });
    }
    drop(event_tx);

    info!(
        dash = %ctx.status.current_dash_name,
        "nexus daemon v{} started",
        env!("CARGO_PKG_VERSION")
    );

    // ── Event loop ────────────────────────────────────────────────────────────
    while let Some(event) = event_rx.recv().await {
        if ctx.handle(event).await.is_break() {
            break;
        }
    }
    Ok(ExitCode::SUCCESS)
}
