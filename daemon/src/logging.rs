/// Logging configuration using tracing.
use anyhow::{Context, Result};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub const LOG_ENV_VAR: &str = "NEXUS_LOG";
pub const LOG_FILE_NAME: &str = "nexus.log";

/// Initialize the logging subsystem
///
/// Logs are written to a daily rolling `nexus.log` in `log_dir` and to stderr.
/// The filter comes from `NEXUS_LOG`, falling back to `default_level`.
///
/// The returned guard flushes the file writer when dropped; keep it alive for
/// the lifetime of the process.
///
/// # Examples
/// ```bash
/// NEXUS_LOG=debug nexus run
/// NEXUS_LOG=nexus_daemon::activation=trace nexus activate normal
/// ```
pub fn init(log_dir: &Path, default_level: &str) -> Result<WorkerGuard> {
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("Failed to create log directory: {}", log_dir.display()))?;

    let file_appender = RollingFileAppender::new(Rotation::DAILY, log_dir, LOG_FILE_NAME);
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(build_filter(default_level))
        .with(
            fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false)
                .with_target(true)
                .with_file(true)
                .with_line_number(true)
                .with_timer(fmt::time::ChronoLocal::new(
                    "%Y-%m-%d %H:%M:%S%.3f".to_string(),
                )),
        )
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .compact(),
        )
        .try_init()
        .context("Failed to install tracing subscriber")?;

    tracing::info!("PCVR Nexus daemon v{} starting", env!("CARGO_PKG_VERSION"));
    tracing::info!("Log directory: {}", log_dir.display());

    Ok(guard)
}

/// `NEXUS_LOG` when set and valid, otherwise `default_level`, otherwise `info`.
fn build_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV_VAR)
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Logs `err` and its full cause chain as one error record.
pub fn log_error(err: &(dyn std::error::Error + 'static), context: Option<&str>) {
    let chain = format_chain(err);
    match context {
        Some(context) => tracing::error!(context, error = %chain, "operation failed"),
        None => tracing::error!(error = %chain, "operation failed"),
    }
}

fn format_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut text = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        text.push_str(": ");
        text.push_str(&cause.to_string());
        source = cause.source();
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ActivationError;
    use std::io;

    #[test]
    fn chain_includes_every_cause() {
        let err = ActivationError::StopProcess {
            name: "vrmonitor".to_string(),
            source: io::Error::new(io::ErrorKind::PermissionDenied, "access denied"),
        };
        assert_eq!(
            format_chain(&err),
            "failed to stop dependent process vrmonitor: access denied"
        );
    }

    #[test]
    fn log_error_without_subscriber_does_not_panic() {
        let err = io::Error::other("boom");
        log_error(&err, Some("startup"));
        log_error(&err, None);
    }

    #[test]
    fn invalid_default_level_falls_back() {
        // Only exercises construction; an invalid directive must not panic.
        let _ = build_filter("not a [valid filter");
    }
}
